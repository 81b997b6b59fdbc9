//! Durable per-session turn log.
//!
//! Each session is one JSONL file under `.agent/sessions/<id>.jsonl`, one
//! [`Turn`] per line. Appends are fsynced before returning. A torn trailing
//! line (crash mid-append) is skipped on load and cut off by the next append;
//! corruption anywhere else is an error.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::Turn;

/// Longest accepted session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Read/write contract for session persistence.
pub trait SessionStore {
    /// Durably append one turn to the session log.
    fn append(&self, session_id: &str, turn: &Turn) -> Result<()>;
    /// All turns of a session in insertion order; empty for an unknown id.
    fn load(&self, session_id: &str) -> Result<Vec<Turn>>;
    /// Drop every turn of a session.
    fn clear(&self, session_id: &str) -> Result<()>;
}

/// Reject ids that are empty, too long, hidden, or not `[A-Za-z0-9._-]`.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(anyhow!("session id must be non-empty"));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(anyhow!(
            "session id must be at most {MAX_SESSION_ID_LEN} characters"
        ));
    }
    if session_id.starts_with('.') {
        return Err(anyhow!("session id must not start with '.'"));
    }
    if let Some(bad) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(anyhow!(
            "session id `{session_id}` contains invalid character {bad:?}"
        ));
    }
    Ok(())
}

/// JSONL-backed store rooted at a sessions directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{session_id}.jsonl")))
    }
}

impl SessionStore for FileSessionStore {
    #[instrument(skip_all, fields(session_id, seq = turn.seq))]
    fn append(&self, session_id: &str, turn: &Turn) -> Result<()> {
        let path = self.session_path(session_id)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create sessions dir {}", self.dir.display()))?;

        let mut line = serde_json::to_string(turn).context("serialize turn")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open session log {}", path.display()))?;
        truncate_torn_tail(&mut file)
            .with_context(|| format!("repair session log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("write session log {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync session log {}", path.display()))?;
        debug!("turn appended");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id))]
    fn load(&self, session_id: &str) -> Result<Vec<Turn>> {
        let path = self.session_path(session_id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read session log {}", path.display()));
            }
        };
        parse_log(&path, &contents)
    }

    #[instrument(skip_all, fields(session_id))]
    fn clear(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove session log {}", path.display())),
        }
    }
}

/// Cut a trailing partial line left by an interrupted append.
fn truncate_torn_tail(file: &mut File) -> Result<()> {
    let len = file.metadata().context("stat")?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Start(len - 1)).context("seek")?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).context("read")?;
    if last[0] == b'\n' {
        return Ok(());
    }

    file.seek(SeekFrom::Start(0)).context("seek")?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).context("read")?;
    let keep = contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |idx| idx + 1);
    warn!(dropped_bytes = contents.len() - keep, "truncating torn trailing line");
    file.set_len(keep as u64).context("truncate")?;
    Ok(())
}

fn parse_log(path: &Path, contents: &str) -> Result<Vec<Turn>> {
    let lines: Vec<(usize, &str)> = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();
    let last_index = lines.len().saturating_sub(1);

    let mut turns = Vec::with_capacity(lines.len());
    for (position, (lineno, line)) in lines.into_iter().enumerate() {
        match serde_json::from_str::<Turn>(line) {
            Ok(turn) => turns.push(turn),
            Err(err) if position == last_index && !contents.ends_with('\n') => {
                warn!(path = %path.display(), line = lineno + 1, err = %err, "skipping torn trailing line");
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("parse {} line {}", path.display(), lineno + 1)
                });
            }
        }
    }
    Ok(turns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Role, TurnContent};
    use serde_json::json;

    fn turn(seq: u64, role: Role, text: &str) -> Turn {
        Turn {
            seq,
            role,
            content: TurnContent::Text(text.to_string()),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn append_then_load_preserves_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path().join("sessions"));
        let turns = vec![
            turn(0, Role::User, "hello"),
            Turn {
                seq: 1,
                role: Role::Tool,
                content: TurnContent::Payload(json!({"tool": "list_files", "result": {"ok": true}})),
                timestamp: "2026-01-01T00:00:01Z".to_string(),
            },
            turn(2, Role::Assistant, "done"),
        ];
        for t in &turns {
            store.append("s1", t).expect("append");
        }
        assert_eq!(store.load("s1").expect("load"), turns);
    }

    #[test]
    fn sessions_are_independent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path());
        store.append("a", &turn(0, Role::User, "a")).expect("append");
        store.append("b", &turn(0, Role::User, "b")).expect("append");
        store.clear("a").expect("clear");
        assert!(store.load("a").expect("load").is_empty());
        assert_eq!(store.load("b").expect("load").len(), 1);
    }

    #[test]
    fn load_unknown_session_is_empty_and_clear_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path());
        assert!(store.load("missing").expect("load").is_empty());
        store.clear("missing").expect("clear");
    }

    #[test]
    fn torn_trailing_line_is_skipped_then_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path());
        store.append("s", &turn(0, Role::User, "hi")).expect("append");
        let path = store.session_path("s").expect("path");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(br#"{"seq":1,"role":"assis"#).expect("tear");
        drop(file);

        assert_eq!(store.load("s").expect("load").len(), 1);

        let next = turn(1, Role::Assistant, "ok");
        store.append("s", &next).expect("append after tear");
        let turns = store.load("s").expect("load after repair");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1], next);
    }

    #[test]
    fn corrupt_middle_line_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(temp.path());
        let path = store.session_path("s").expect("path");
        let good = serde_json::to_string(&turn(0, Role::User, "x")).expect("json");
        fs::write(&path, format!("not json\n{good}\n")).expect("write");
        assert!(store.load("s").is_err());
    }

    #[test]
    fn rejects_path_like_session_ids() {
        for bad in ["", "../etc", "a/b", ".hidden", "white space"] {
            assert!(validate_session_id(bad).is_err(), "{bad:?}");
        }
        for good in ["default", "s-1", "2026.01.01_run"] {
            validate_session_id(good).expect(good);
        }
    }
}
