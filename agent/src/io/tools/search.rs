//! `search_text`: line search over workspace files.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

use super::ToolError;
use super::fs::{default_path, relative, resolve_path, walk_files};

/// Most matches returned per search.
pub const MAX_MATCHES: usize = 200;
/// Files larger than this are never searched.
pub const MAX_FILE_BYTES: u64 = 1_048_576;
/// Leading bytes inspected for a NUL to detect binary files.
const SNIFF_BYTES: usize = 1024;

#[derive(Debug, Deserialize)]
pub struct SearchTextArgs {
    pub pattern: String,
    #[serde(default = "default_path")]
    pub path: String,
}

enum Matcher {
    Regex(Regex),
    Literal(String),
}

impl Matcher {
    /// Compile `pattern` as a regex, falling back to a literal match.
    fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => Matcher::Regex(re),
            Err(_) => Matcher::Literal(pattern.to_string()),
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            Matcher::Regex(_) => "regex",
            Matcher::Literal(_) => "literal",
        }
    }

    fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Regex(re) => re.is_match(line),
            Matcher::Literal(needle) => line.contains(needle.as_str()),
        }
    }
}

/// True for files that are too large, look binary, or cannot be read.
pub fn should_skip(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return true;
    };
    if metadata.len() > MAX_FILE_BYTES {
        return true;
    }
    let Ok(file) = File::open(path) else {
        return true;
    };
    let mut head = Vec::with_capacity(SNIFF_BYTES);
    if file.take(SNIFF_BYTES as u64).read_to_end(&mut head).is_err() {
        return true;
    }
    head.contains(&0)
}

pub fn search_text(root: &Path, args: &SearchTextArgs) -> Result<Value, ToolError> {
    let target = resolve_path(root, &args.path)?;
    if !target.exists() {
        return Err(ToolError::execution(format!(
            "path does not exist: {}",
            args.path
        )));
    }
    let matcher = Matcher::new(&args.pattern);

    let mut matches = Vec::new();
    'files: for file in walk_files(&target) {
        if should_skip(&file) {
            continue;
        }
        let Ok(bytes) = fs::read(&file) else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        let rel = relative(root, &file);
        for (idx, line) in text.lines().enumerate() {
            if matcher.is_match(line) {
                matches.push(format!("{rel}:{}:{line}", idx + 1));
                if matches.len() >= MAX_MATCHES {
                    break 'files;
                }
            }
        }
    }

    Ok(json!({
        "count": matches.len(),
        "matches": matches,
        "search_mode": matcher.mode(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical");
        (temp, root)
    }

    fn search(root: &Path, pattern: &str) -> Value {
        search_text(
            root,
            &SearchTextArgs {
                pattern: pattern.to_string(),
                path: ".".to_string(),
            },
        )
        .expect("search")
    }

    /// Regression check run by the verification pipeline after every edit.
    #[test]
    fn search_skips_binary_and_oversized_files() {
        let (_temp, root) = workspace();
        fs::write(root.join("a.txt"), "hello world\nthis is a test\npattern123\n").expect("a");

        let mut binary = b"pattern123\n".to_vec();
        binary.extend((0u8..=255).cycle().take(1024));
        fs::write(root.join("b.bin"), binary).expect("b");

        let mut large = File::create(root.join("c.txt")).expect("c");
        writeln!(large, "pattern123").expect("c head");
        let filler = "0123456789abcdef".repeat(6);
        for _ in 0..(2 * 1024 * 1024 / 100) {
            writeln!(large, "{filler}").expect("c body");
        }
        drop(large);

        let result = search(&root, "pattern123");
        assert_eq!(result["count"], 1, "matches: {}", result["matches"]);
        assert_eq!(result["matches"][0], "a.txt:3:pattern123");
    }

    #[test]
    fn invalid_regex_falls_back_to_literal() {
        let (_temp, root) = workspace();
        fs::write(root.join("f.rs"), "fn main() {\n    call(x\n}\n").expect("write");
        let result = search(&root, "call(x");
        assert_eq!(result["search_mode"], "literal");
        assert_eq!(result["matches"], json!(["f.rs:2:    call(x"]));

        let result = search(&root, r"fn \w+\(\)");
        assert_eq!(result["search_mode"], "regex");
        assert_eq!(result["count"], 1);
    }

    #[test]
    fn caps_matches() {
        let (_temp, root) = workspace();
        fs::write(root.join("many.txt"), "hit\n".repeat(MAX_MATCHES + 50)).expect("write");
        let result = search(&root, "hit");
        assert_eq!(result["count"], MAX_MATCHES);
    }

    #[test]
    fn searches_a_single_file_path() {
        let (_temp, root) = workspace();
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::write(root.join("src/lib.rs"), "needle\n").expect("write");
        fs::write(root.join("other.rs"), "needle\n").expect("write");
        let result = search_text(
            &root,
            &SearchTextArgs {
                pattern: "needle".to_string(),
                path: "src/lib.rs".to_string(),
            },
        )
        .expect("search");
        assert_eq!(result["matches"], json!(["src/lib.rs:1:needle"]));
    }

    #[test]
    fn rejects_paths_outside_workspace() {
        let (_temp, root) = workspace();
        let err = search_text(
            &root,
            &SearchTextArgs {
                pattern: "x".to_string(),
                path: "../".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.message.contains("escapes workspace"));
    }
}
