//! Scripted collaborators and fixtures for loop tests.
//!
//! Every double records what it was asked to do so tests can assert on the
//! calls that did (or did not) happen.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::Turn;
use crate::io::config::AgentConfig;
use crate::io::model::{ModelClient, ModelError, ModelRequest};
use crate::io::process::{CommandOutput, LaunchRequest, Launcher};
use crate::io::session_store::SessionStore;

/// Reply used once the scripted reviews run out.
pub const DEFAULT_REVIEW: &str = "Verdict: PASS\n- change matches the request";

/// Launcher that replays queued outputs instead of spawning processes.
///
/// Once the script is exhausted every launch exits 0 with no output.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    outputs: RefCell<VecDeque<Result<CommandOutput, String>>>,
    requests: RefCell<Vec<LaunchRequest>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next launch; `Err` is a launch failure.
    pub fn push(&self, output: Result<CommandOutput, String>) {
        self.outputs.borrow_mut().push_back(output);
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.borrow().clone()
    }
}

impl Launcher for ScriptedLauncher {
    fn run(&self, request: &LaunchRequest) -> Result<CommandOutput> {
        self.requests.borrow_mut().push(request.clone());
        match self.outputs.borrow_mut().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(CommandOutput::exited(0, "", "")),
        }
    }
}

/// Model that answers from two queues: decisions (`json_mode` requests) and
/// reviews (free-text requests).
#[derive(Debug, Default)]
pub struct ScriptedModel {
    decisions: RefCell<VecDeque<Result<String, ModelError>>>,
    reviews: RefCell<VecDeque<Result<String, ModelError>>>,
    requests: RefCell<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(decisions: Vec<&str>) -> Self {
        Self::from_results(decisions.into_iter().map(|d| Ok(d.to_string())).collect())
    }

    pub fn from_results(decisions: Vec<Result<String, ModelError>>) -> Self {
        Self {
            decisions: RefCell::new(decisions.into()),
            ..Self::default()
        }
    }

    pub fn with_reviews(self, reviews: Vec<&str>) -> Self {
        self.with_review_results(reviews.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_review_results(self, reviews: Vec<Result<String, ModelError>>) -> Self {
        *self.reviews.borrow_mut() = reviews.into();
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.borrow().clone()
    }

    /// Requests that asked for a decision.
    pub fn decision_requests(&self) -> Vec<ModelRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|request| request.json_mode)
            .cloned()
            .collect()
    }

    /// Requests sent to the reviewer.
    pub fn review_requests(&self) -> Vec<ModelRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|request| !request.json_mode)
            .cloned()
            .collect()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.requests.borrow_mut().push(request.clone());
        if request.json_mode {
            self.decisions
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Fatal("no scripted decision left".to_string())))
        } else {
            self.reviews
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(DEFAULT_REVIEW.to_string()))
        }
    }
}

/// In-memory session store with an optional write failure.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RefCell<HashMap<String, Vec<Turn>>>,
    /// Appends that still succeed; `None` means unlimited.
    appends_left: Cell<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `count` more appends succeed, then fail every later one.
    pub fn fail_after(&self, count: usize) {
        self.appends_left.set(Some(count));
    }

    pub fn turns(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .borrow()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl SessionStore for MemoryStore {
    fn append(&self, session_id: &str, turn: &Turn) -> Result<()> {
        if let Some(left) = self.appends_left.get() {
            if left == 0 {
                return Err(anyhow!("disk full"));
            }
            self.appends_left.set(Some(left - 1));
        }
        self.sessions
            .borrow_mut()
            .entry(session_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Vec<Turn>> {
        Ok(self.turns(session_id))
    }

    fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.borrow_mut().remove(session_id);
        Ok(())
    }
}

/// Config for loop tests: no retry delays, small budget.
pub fn test_config(max_steps: u32, reserved_steps: u32) -> AgentConfig {
    AgentConfig {
        model: "decider".to_string(),
        reviewer_model: "reviewer".to_string(),
        max_steps,
        reserved_steps,
        model_backoff_ms: 0,
        ..AgentConfig::default()
    }
}

/// Temporary workspace directory with helpers for seeding files.
pub struct TestWorkspace {
    _temp: TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp workspace")?;
        let root = temp
            .path()
            .canonicalize()
            .context("canonicalize temp workspace")?;
        Ok(Self { _temp: temp, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}
