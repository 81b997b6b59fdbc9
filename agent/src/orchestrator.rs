//! The agent loop for one user request.
//!
//! `run_turn` drives `Running(phase) -> AwaitingDecision -> Done(..)`: it asks
//! the model for a decision, dispatches tool calls (safety filter first for
//! `run_shell`), verifies and reviews successful edits, and persists exactly
//! one turn per completed step. The step counter only moves after the turn is
//! durable. Once `max_steps - reserved` steps have run the loop enters the
//! verify phase, where every tool except the read-only ones fails with
//! `BudgetExceeded`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::StepBudget;
use crate::core::compact::{
    CompactionLimits, clip, compact_arguments, compact_tool_result, render_tool_payload,
};
use crate::core::decision::{DecisionViolation, parse_decision};
use crate::core::safety::SafetyFilter;
use crate::core::types::{
    Decision, EditVerdict, ErrorKind, Phase, ReviewVerdict, Role, ToolResult, Turn, TurnContent,
};
use crate::error::FatalError;
use crate::io::config::AgentConfig;
use crate::io::model::{ChatMessage, ModelClient, ModelRequest, RetryPolicy, request_with_retry};
use crate::io::process::{CancelToken, Launcher};
use crate::io::prompt::{PromptEngine, SystemPromptInput};
use crate::io::session_store::{SessionStore, validate_session_id};
use crate::io::tools::{ShellSettings, ToolName, ToolRegistry};
use crate::review::{ReviewInput, Reviewer, edit_diff, recent_context};
use crate::verify::VerificationPipeline;

/// Explicit per-session state threaded through the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
    /// Steps completed in the current user request.
    pub step: u32,
    pub phase: Phase,
}

/// Why a request stopped.
#[derive(Debug)]
pub enum LoopStop {
    /// The model answered with a message.
    Success { message: String },
    /// `max_steps` ran out; `summary` is the synthesized final message.
    BudgetExhausted { summary: String },
    FatalError(FatalError),
    Cancelled,
}

impl LoopStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStop::Success { .. } => "success",
            LoopStop::BudgetExhausted { .. } => "budget_exhausted",
            LoopStop::FatalError(_) => "fatal_error",
            LoopStop::Cancelled => "cancelled",
        }
    }
}

/// Summary of one `run_turn` call.
#[derive(Debug)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub steps: u32,
    pub phase: Phase,
}

/// Progress notifications for the caller.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    /// A malformed decision is being re-requested with a correction.
    DecisionRetry {
        attempt: u32,
        violations: &'a [String],
    },
    /// A tool step completed and its turn was persisted.
    ToolStep {
        step: u32,
        tool: &'a str,
        result: &'a ToolResult,
    },
    PhaseChanged { step: u32, phase: Phase },
}

/// Loop settings derived from [`AgentConfig`].
#[derive(Debug, Clone)]
struct LoopSettings {
    model: String,
    max_tokens: u32,
    decision_retry_limit: u32,
    history_turns: usize,
    compaction: CompactionLimits,
    review_context_turns: usize,
    diff_chars: usize,
    retry: RetryPolicy,
}

/// Edits and verdicts seen during one request, for the finalize notice and
/// the budget summary.
#[derive(Debug, Default)]
struct RequestProgress {
    edited_files: Vec<String>,
    last_verdict: Option<EditVerdict>,
}

impl RequestProgress {
    fn record_edit(&mut self, path: &str) {
        if !self.edited_files.iter().any(|known| known == path) {
            self.edited_files.push(path.to_string());
        }
    }
}

pub struct Orchestrator<'a, M, L, S> {
    model: &'a M,
    launcher: &'a L,
    store: &'a S,
    registry: ToolRegistry,
    safety: SafetyFilter,
    pipeline: VerificationPipeline,
    reviewer: Reviewer,
    prompts: PromptEngine,
    budget: StepBudget,
    settings: LoopSettings,
    system_prompt: String,
    cancel: CancelToken,
}

impl<'a, M: ModelClient, L: Launcher, S: SessionStore> Orchestrator<'a, M, L, S> {
    /// Wire the loop for `workspace`. Invalid configuration fails here, before
    /// any session is touched.
    pub fn new(
        cfg: &AgentConfig,
        workspace: &Path,
        model: &'a M,
        launcher: &'a L,
        store: &'a S,
        cancel: CancelToken,
    ) -> Result<Self> {
        cfg.validate().context("validate config")?;
        let budget = cfg.budget()?;
        let enabled = cfg.enabled_tools()?;
        let registry = ToolRegistry::new(
            workspace,
            &enabled,
            ShellSettings {
                timeout: cfg.shell_timeout(),
                output_limit_bytes: cfg.output_limit_bytes,
            },
        )?;
        let safety = SafetyFilter::new(&cfg.safety.deny_patterns)?;
        let pipeline = VerificationPipeline::from_config(cfg, registry.workspace().to_path_buf());
        let retry = RetryPolicy {
            retries: cfg.model_retries,
            backoff: Duration::from_millis(cfg.model_backoff_ms),
        };
        let reviewer = Reviewer::from_config(cfg, retry);
        let prompts = PromptEngine::new();
        let system_prompt = prompts
            .render_system(&SystemPromptInput {
                workspace: &registry.workspace().display().to_string(),
                tools: &registry.specs(),
                max_steps: budget.max_steps(),
                execution_limit: budget.execution_limit(),
            })
            .context("render system prompt")?;

        Ok(Self {
            model,
            launcher,
            store,
            registry,
            safety,
            pipeline,
            reviewer,
            prompts,
            budget,
            settings: LoopSettings {
                model: cfg.model.clone(),
                max_tokens: cfg.max_tokens,
                decision_retry_limit: cfg.decision_retry_limit,
                history_turns: cfg.history_turns,
                compaction: cfg.compaction,
                review_context_turns: cfg.review.context_turns,
                diff_chars: cfg.review.diff_chars,
                retry,
            },
            system_prompt,
            cancel,
        })
    }

    pub fn budget(&self) -> StepBudget {
        self.budget
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Load (or start) a session, replaying its persisted turns.
    #[instrument(skip_all, fields(session_id = id))]
    pub fn open_session(&self, id: &str) -> Result<Session> {
        validate_session_id(id)?;
        let turns = self
            .store
            .load(id)
            .with_context(|| format!("load session `{id}`"))?;
        info!(turns = turns.len(), "session opened");
        Ok(Session {
            id: id.to_string(),
            turns,
            step: 0,
            phase: Phase::Execute,
        })
    }

    /// Drop the session's history, in memory and in the store.
    #[instrument(skip_all, fields(session_id = %session.id))]
    pub fn reset_session(&self, session: &mut Session) -> Result<()> {
        self.store
            .clear(&session.id)
            .with_context(|| format!("clear session `{}`", session.id))?;
        session.turns.clear();
        session.step = 0;
        session.phase = Phase::Execute;
        info!("session reset");
        Ok(())
    }

    /// Close a session. Its log stays in the store.
    pub fn end_session(&self, session: Session) {
        info!(session_id = %session.id, turns = session.turns.len(), "session ended");
    }

    /// Run the loop for one user request until it reaches a `Done` state.
    #[instrument(skip_all, fields(session_id = %session.id))]
    pub fn run_turn<F>(&self, session: &mut Session, user_input: &str, mut on_event: F) -> LoopOutcome
    where
        F: FnMut(&LoopEvent<'_>),
    {
        session.step = 0;
        session.phase = Phase::Execute;
        let stop = self.drive(session, user_input, &mut on_event);
        info!(stop = stop.as_str(), steps = session.step, "request finished");
        LoopOutcome {
            stop,
            steps: session.step,
            phase: session.phase,
        }
    }

    fn drive<F>(&self, session: &mut Session, user_input: &str, on_event: &mut F) -> LoopStop
    where
        F: FnMut(&LoopEvent<'_>),
    {
        let request_start = session.turns.len();
        if let Err(err) = self.append(session, Role::User, TurnContent::Text(user_input.to_string()))
        {
            return LoopStop::FatalError(err);
        }
        let mut progress = RequestProgress::default();

        loop {
            if self.cancel.is_cancelled() {
                return LoopStop::Cancelled;
            }
            if self.budget.exhausted(session.step) {
                let summary = self.budget_summary(session.step, &progress);
                if let Err(err) =
                    self.append(session, Role::Assistant, TurnContent::Text(summary.clone()))
                {
                    warn!(summary = %summary, "budget summary not persisted");
                    return LoopStop::FatalError(err);
                }
                return LoopStop::BudgetExhausted { summary };
            }

            let messages = match self.build_messages(session, request_start, &progress) {
                Ok(messages) => messages,
                Err(err) => return LoopStop::FatalError(err),
            };
            let decision = match self.request_decision(messages, on_event) {
                Ok(decision) => decision,
                Err(err) => return LoopStop::FatalError(err),
            };

            let (tool_label, payload, result) = match decision {
                Ok(Decision::Message { text }) => {
                    if let Err(err) =
                        self.append(session, Role::Assistant, TurnContent::Text(text.clone()))
                    {
                        return LoopStop::FatalError(err);
                    }
                    session.step += 1;
                    return LoopStop::Success { message: text };
                }
                Ok(Decision::ToolCall { name, arguments }) => {
                    let result = match self.execute_tool(
                        session,
                        user_input,
                        &name,
                        &arguments,
                        &mut progress,
                    ) {
                        Ok(result) => result,
                        Err(err) => return LoopStop::FatalError(err),
                    };
                    let payload = json!({
                        "tool": name,
                        "arguments": compact_arguments(&arguments, &self.settings.compaction),
                        "result": compact_tool_result(&result, &self.settings.compaction),
                    });
                    (name, payload, result)
                }
                Err(violation) => {
                    let result = self.parse_failure(&violation);
                    let payload = json!({
                        "tool": Value::Null,
                        "raw": clip(&violation.raw, self.settings.compaction.text_chars),
                        "result": compact_tool_result(&result, &self.settings.compaction),
                    });
                    ("decision".to_string(), payload, result)
                }
            };

            if let Err(err) = self.append(session, Role::Tool, TurnContent::Payload(payload)) {
                return LoopStop::FatalError(err);
            }
            session.step += 1;
            on_event(&LoopEvent::ToolStep {
                step: session.step,
                tool: &tool_label,
                result: &result,
            });

            let next = self.budget.phase_after(session.phase, session.step);
            if next != session.phase {
                session.phase = next;
                info!(step = session.step, "entering verify phase");
                on_event(&LoopEvent::PhaseChanged {
                    step: session.step,
                    phase: next,
                });
            }
        }
    }

    /// Persist a turn, then record it in memory.
    fn append(&self, session: &mut Session, role: Role, content: TurnContent) -> Result<(), FatalError> {
        let turn = Turn {
            seq: session.turns.last().map_or(0, |turn| turn.seq + 1),
            role,
            content,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        self.store
            .append(&session.id, &turn)
            .map_err(FatalError::StoreWrite)?;
        session.turns.push(turn);
        Ok(())
    }

    /// System prompt, bounded earlier requests, the full current request, and
    /// the finalize notice once in the verify phase.
    fn build_messages(
        &self,
        session: &Session,
        request_start: usize,
        progress: &RequestProgress,
    ) -> Result<Vec<ChatMessage>, FatalError> {
        let limits = &self.settings.compaction;
        let (earlier, current) = session.turns.split_at(request_start);
        let skip = earlier.len().saturating_sub(self.settings.history_turns);

        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        messages.extend(
            earlier[skip..]
                .iter()
                .map(|turn| turn_message(turn, limits, Some(limits.history_chars))),
        );
        messages.extend(current.iter().map(|turn| turn_message(turn, limits, None)));

        if session.phase == Phase::Verify {
            let notice = self
                .prompts
                .render_finalize(self.budget.remaining(session.step), &progress.edited_files)
                .map_err(FatalError::Prompt)?;
            messages.push(ChatMessage::user(notice));
        }
        Ok(messages)
    }

    /// Ask for a decision, re-issuing with a correction after malformed output.
    ///
    /// The outer error is fatal; the inner one is a decision that still failed
    /// after `decision_retry_limit` corrections.
    fn request_decision<F>(
        &self,
        base: Vec<ChatMessage>,
        on_event: &mut F,
    ) -> Result<Result<Decision, DecisionViolation>, FatalError>
    where
        F: FnMut(&LoopEvent<'_>),
    {
        let mut request = ModelRequest {
            model: self.settings.model.clone(),
            messages: base.clone(),
            max_tokens: self.settings.max_tokens,
            json_mode: true,
        };
        let mut attempt = 0u32;
        loop {
            let raw = request_with_retry(self.model, &request, self.settings.retry)?;
            let violation = match parse_decision(&raw) {
                Ok(decision) => return Ok(Ok(decision)),
                Err(violation) => violation,
            };
            if attempt >= self.settings.decision_retry_limit {
                warn!(attempts = attempt + 1, "decision retries exhausted");
                return Ok(Err(violation));
            }
            attempt += 1;
            debug!(attempt, violations = ?violation.violations, "malformed decision, retrying");
            on_event(&LoopEvent::DecisionRetry {
                attempt,
                violations: &violation.violations,
            });
            let correction = self
                .prompts
                .render_correction(&violation.violations)
                .map_err(FatalError::Prompt)?;
            let mut messages = base.clone();
            messages.push(ChatMessage::assistant(raw));
            messages.push(ChatMessage::user(correction));
            request.messages = messages;
        }
    }

    fn parse_failure(&self, violation: &DecisionViolation) -> ToolResult {
        ToolResult::failure(
            ErrorKind::DecisionParseError,
            format!(
                "model output did not match the decision schema after {} retries: {}",
                self.settings.decision_retry_limit,
                violation.violations.join("; ")
            ),
        )
    }

    /// Policy checks, dispatch, and post-edit verification for one call.
    #[instrument(skip_all, fields(tool = name, phase = ?session.phase))]
    fn execute_tool(
        &self,
        session: &Session,
        user_input: &str,
        name: &str,
        arguments: &Value,
        progress: &mut RequestProgress,
    ) -> Result<ToolResult, FatalError> {
        let tool = self.registry.lookup(name);

        if let Some(tool) = tool
            && !tool.is_read_only()
            && session.phase == Phase::Verify
        {
            warn!("non-read-only tool rejected in verify phase");
            return Ok(ToolResult::failure(
                ErrorKind::BudgetExceeded,
                format!(
                    "`{tool}` is disabled: the execution budget of {} steps is spent; finalize with a message",
                    self.budget.execution_limit()
                ),
            ));
        }

        if tool == Some(ToolName::RunShell)
            && let Some(command) = arguments.get("command").and_then(Value::as_str)
        {
            let verdict = self.safety.check(command);
            if !verdict.allowed {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "command rejected by safety filter".to_string());
                warn!(reason = %reason, "shell command blocked");
                return Ok(ToolResult::failure(ErrorKind::PolicyViolation, reason));
            }
        }

        let mut result = self
            .registry
            .execute(self.launcher, &self.cancel, name, arguments);

        if let Some(tool) = tool
            && tool.is_edit()
            && result.ok
        {
            let verdict = self.verify_edit(session, user_input, tool, arguments, &result, progress)?;
            result.verification = Some(verdict);
        }
        Ok(result)
    }

    fn verify_edit(
        &self,
        session: &Session,
        user_input: &str,
        tool: ToolName,
        arguments: &Value,
        result: &ToolResult,
        progress: &mut RequestProgress,
    ) -> Result<EditVerdict, FatalError> {
        let path = result
            .output
            .get("path")
            .or_else(|| arguments.get("path"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        progress.record_edit(&path);

        let report = self.pipeline.run(self.launcher, &self.cancel);
        let review = if self.cancel.is_cancelled() {
            ReviewVerdict {
                verdict: "cancelled".to_string(),
                accepted: false,
                justification: "review skipped: request cancelled".to_string(),
            }
        } else {
            self.reviewer.review(
                self.model,
                &self.prompts,
                &ReviewInput {
                    user_request: user_input,
                    tool,
                    path: &path,
                    diff: edit_diff(tool, arguments, self.settings.diff_chars),
                    report: &report,
                    context: recent_context(&session.turns, self.settings.review_context_turns),
                },
            )?
        };
        let verdict = EditVerdict::new(report, review);
        info!(path = %path, edit_accepted = verdict.edit_accepted, "edit verified");
        progress.last_verdict = Some(verdict.clone());
        Ok(verdict)
    }

    fn budget_summary(&self, steps: u32, progress: &RequestProgress) -> String {
        let mut lines = vec![format!(
            "Step budget exhausted after {steps} steps without a final answer."
        )];
        if progress.edited_files.is_empty() {
            lines.push("No files were edited.".to_string());
        } else {
            lines.push(format!("Edited files: {}.", progress.edited_files.join(", ")));
        }
        if let Some(verdict) = &progress.last_verdict {
            let failed: Vec<&str> = verdict
                .report
                .failed_steps()
                .map(|step| step.name.as_str())
                .collect();
            let checks = if failed.is_empty() {
                "all checks passed".to_string()
            } else {
                format!("failed checks: {}", failed.join(", "))
            };
            lines.push(format!(
                "Last edit {} ({checks}; reviewer verdict {}).",
                if verdict.edit_accepted { "accepted" } else { "not accepted" },
                verdict.review.verdict
            ));
        }
        lines.join("\n")
    }
}

/// Convert a persisted turn into a chat message, optionally clipped.
fn turn_message(turn: &Turn, limits: &CompactionLimits, max_chars: Option<usize>) -> ChatMessage {
    let text = match (&turn.role, &turn.content) {
        (Role::Tool, TurnContent::Payload(payload)) => {
            format!("Tool result: {}", render_tool_payload(payload, limits))
        }
        (_, content) => content.render(),
    };
    let text = match max_chars {
        Some(max) => clip(&text, max),
        None => text,
    };
    match turn.role {
        Role::Assistant => ChatMessage::assistant(text),
        Role::User | Role::Tool => ChatMessage::user(text),
    }
}
