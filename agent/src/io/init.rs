//! Initialization helpers for `.agent/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{AgentConfig, write_config};

/// All canonical paths within `.agent/` for a workspace root.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub root: PathBuf,
    pub agent_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub sessions_dir: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let agent_dir = root.join(".agent");
        Self {
            root,
            gitignore_path: agent_dir.join(".gitignore"),
            config_path: agent_dir.join("config.toml"),
            sessions_dir: agent_dir.join("sessions"),
            agent_dir,
        }
    }
}

/// Options for `init_agent`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the existing config.
    pub force: bool,
}

/// Create `.agent/` scaffolding in `root` with a default config.
///
/// Fails if `.agent/` already exists unless `options.force` is set. Session
/// logs are never touched.
pub fn init_agent(root: &Path, options: &InitOptions) -> Result<AgentPaths> {
    let paths = AgentPaths::new(root);
    if paths.agent_dir.exists() && !paths.agent_dir.is_dir() {
        return Err(anyhow!("agent init: .agent exists but is not a directory"));
    }
    if paths.agent_dir.exists() && !options.force {
        return Err(anyhow!(
            "agent init: .agent already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.agent_dir)?;
    create_dir(&paths.sessions_dir)?;
    fs::write(&paths.gitignore_path, AGENT_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &AgentConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const AGENT_GITIGNORE: &str = "sessions/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_agent(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.agent_dir.is_dir());
        assert!(paths.sessions_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            AGENT_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            AgentConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_agent_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_agent(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_agent(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_config_and_keeps_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_agent(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_steps = 3\nreserved_steps = 1\n").expect("custom");
        let log = paths.sessions_dir.join("default.jsonl");
        fs::write(&log, "{}\n").expect("session log");

        init_agent(temp.path(), &InitOptions { force: true }).expect("re-init");

        assert_eq!(load_config(&paths.config_path).expect("config").max_steps, 25);
        assert!(log.is_file());
    }
}
