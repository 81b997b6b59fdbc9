//! Agent configuration stored under `.agent/config.toml`.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::budget::StepBudget;
use crate::core::compact::CompactionLimits;
use crate::core::safety::{DEFAULT_DENY_PATTERNS, SafetyFilter};
use crate::core::verdict::VerdictRules;
use crate::io::tools::ToolName;

/// Agent configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; a handful of settings can be overridden per process with
/// `AGENT_*` environment variables (see [`AgentConfig::apply_env`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Model used for decisions.
    pub model: String,

    /// Model used by the secondary reviewer. Empty means "same as `model`".
    pub reviewer_model: String,

    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,

    /// Total steps per user request.
    pub max_steps: u32,

    /// Steps held back for the verify phase. Must be below `max_steps`.
    pub reserved_steps: u32,

    pub shell_timeout_secs: u64,

    /// Network timeout for one model request.
    pub model_timeout_secs: u64,

    /// Transient model failures retried before giving up.
    pub model_retries: u32,

    /// Base delay for exponential backoff between model retries.
    pub model_backoff_ms: u64,

    /// Corrective re-issues after a malformed decision.
    pub decision_retry_limit: u32,

    pub max_tokens: u32,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Earlier turns replayed to the model from previous requests.
    pub history_turns: usize,

    /// Enabled tools, by name.
    pub tools: Vec<String>,

    pub compaction: CompactionLimits,
    pub verification: VerificationConfig,
    pub safety: SafetyConfig,
    pub review: ReviewConfig,
}

/// Commands run after every successful edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Project-wide compile/type check.
    pub static_check: Vec<String>,
    /// Designated regression test.
    pub behavioral_check: Vec<String>,
    pub timeout_secs: u64,
    /// Characters of output tail kept per check.
    pub detail_chars: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            static_check: to_strings(&["cargo", "check", "--quiet", "--all-targets"]),
            behavioral_check: to_strings(&[
                "cargo",
                "test",
                "--quiet",
                "--",
                "search_skips_binary_and_oversized_files",
            ]),
            timeout_secs: 300,
            detail_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Case-insensitive regular expressions; any match blocks a shell command.
    pub deny_patterns: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            deny_patterns: to_strings(DEFAULT_DENY_PATTERNS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Line prefix the reviewer's verdict is read from.
    pub verdict_label: String,
    /// Verdict token that accepts an edit (case-insensitive).
    pub accept_token: String,
    pub max_tokens: u32,
    /// Recent user/assistant turns included as reviewer context.
    pub context_turns: usize,
    /// Characters of the edit diff sent to the reviewer.
    pub diff_chars: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        let rules = VerdictRules::default();
        Self {
            verdict_label: rules.label,
            accept_token: rules.accept_token,
            max_tokens: 300,
            context_turns: 8,
            diff_chars: 4000,
        }
    }
}

impl ReviewConfig {
    pub fn rules(&self) -> VerdictRules {
        VerdictRules {
            label: self.verdict_label.clone(),
            accept_token: self.accept_token.clone(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5.1".to_string(),
            reviewer_model: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            max_steps: 25,
            reserved_steps: 4,
            shell_timeout_secs: 30,
            model_timeout_secs: 120,
            model_retries: 2,
            model_backoff_ms: 500,
            decision_retry_limit: 2,
            max_tokens: 1000,
            output_limit_bytes: 100_000,
            history_turns: 6,
            tools: ToolName::ALL.iter().map(|tool| tool.as_str().to_string()).collect(),
            compaction: CompactionLimits::default(),
            verification: VerificationConfig::default(),
            safety: SafetyConfig::default(),
            review: ReviewConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if self.api_base.trim().is_empty() {
            return Err(anyhow!("api_base must be non-empty"));
        }
        StepBudget::new(self.max_steps, self.reserved_steps)?;
        if self.shell_timeout_secs == 0 {
            return Err(anyhow!("shell_timeout_secs must be > 0"));
        }
        if self.model_timeout_secs == 0 {
            return Err(anyhow!("model_timeout_secs must be > 0"));
        }
        if self.max_tokens == 0 {
            return Err(anyhow!("max_tokens must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        self.enabled_tools()?;

        let limits = &self.compaction;
        if limits.text_chars == 0
            || limits.list_items == 0
            || limits.payload_chars == 0
            || limits.history_chars == 0
        {
            return Err(anyhow!("compaction limits must be > 0"));
        }

        let verification = &self.verification;
        for (name, command) in [
            ("static_check", &verification.static_check),
            ("behavioral_check", &verification.behavioral_check),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("verification.{name} must be a non-empty array"));
            }
        }
        if verification.timeout_secs == 0 {
            return Err(anyhow!("verification.timeout_secs must be > 0"));
        }

        SafetyFilter::new(&self.safety.deny_patterns)?;

        if self.review.verdict_label.trim().is_empty() {
            return Err(anyhow!("review.verdict_label must be non-empty"));
        }
        if self.review.accept_token.trim().is_empty() {
            return Err(anyhow!("review.accept_token must be non-empty"));
        }
        Ok(())
    }

    /// Parse `tools` into the closed tool set; unknown or repeated names are errors.
    pub fn enabled_tools(&self) -> Result<Vec<ToolName>> {
        let mut enabled = Vec::with_capacity(self.tools.len());
        for name in &self.tools {
            let tool = ToolName::from_str(name)?;
            if enabled.contains(&tool) {
                return Err(anyhow!("tool `{name}` is listed more than once"));
            }
            enabled.push(tool);
        }
        Ok(enabled)
    }

    pub fn budget(&self) -> Result<StepBudget> {
        StepBudget::new(self.max_steps, self.reserved_steps)
    }

    pub fn reviewer_model(&self) -> &str {
        if self.reviewer_model.trim().is_empty() {
            &self.model
        } else {
            &self.reviewer_model
        }
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    /// Apply `AGENT_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("AGENT_MODEL") {
            self.model = model;
        }
        if let Some(model) = lookup("AGENT_VERIFIER_MODEL") {
            self.reviewer_model = model;
        }
        if let Some(api_base) = lookup("AGENT_API_BASE") {
            self.api_base = api_base;
        }
        if let Some(raw) = lookup("AGENT_MAX_STEPS") {
            self.max_steps = parse_env("AGENT_MAX_STEPS", &raw)?;
        }
        if let Some(raw) = lookup("AGENT_RESERVED_STEPS") {
            self.reserved_steps = parse_env("AGENT_RESERVED_STEPS", &raw)?;
        }
        if let Some(raw) = lookup("AGENT_SHELL_TIMEOUT") {
            self.shell_timeout_secs = parse_env("AGENT_SHELL_TIMEOUT", &raw)?;
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("{key} must be a positive integer (got `{raw}`)"))
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config and apply environment overrides from the process environment.
pub fn load_effective_config(path: &Path) -> Result<AgentConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env(|key| std::env::var(key).ok())?;
    cfg.validate()
        .context("invalid configuration after environment overrides")?;
    debug!(model = %cfg.model, max_steps = cfg.max_steps, reserved_steps = cfg.reserved_steps, "config loaded");
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
