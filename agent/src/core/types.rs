//! Shared deterministic types for the agent loop.
//!
//! These types define the contracts between the orchestrator and its
//! collaborators. They carry no I/O and serialize to stable JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a persisted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Body of a turn: free text or a structured JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    Payload(Value),
}

impl TurnContent {
    /// Render the content as the text the model sees.
    pub fn render(&self) -> String {
        match self {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Payload(value) => compact_json(value),
        }
    }
}

/// One immutable entry of a session's conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Position in the session (0-indexed, contiguous).
    pub seq: u64,
    pub role: Role,
    pub content: TurnContent,
    /// RFC 3339 UTC timestamp of the append.
    pub timestamp: String,
}

/// Parsed model output for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Message { text: String },
    ToolCall { name: String, arguments: Value },
}

/// Error taxonomy recorded in tool results and fatal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyViolation,
    ToolExecutionError,
    DecisionParseError,
    BudgetExceeded,
    Timeout,
    ModelUnavailable,
    StoreWriteError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::ToolExecutionError => "tool_execution_error",
            ErrorKind::DecisionParseError => "decision_parse_error",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::StoreWriteError => "store_write_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Outcome of executing a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    /// Structured tool output, or a plain string describing the failure.
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Post-edit verdict, present only for successful edit tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<EditVerdict>,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            ok: true,
            output,
            error: None,
            verification: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: Value::String(message.into()),
            error: Some(kind),
            verification: None,
        }
    }
}

/// One check of the verification pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStep {
    pub name: String,
    pub passed: bool,
    /// Tail of the captured stdout/stderr, or the launch error.
    pub detail: String,
}

/// Ordered check results produced once per successful edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub steps: Vec<VerificationStep>,
    pub overall: bool,
}

impl VerificationReport {
    /// Build a report; `overall` is the AND of every step.
    pub fn from_steps(steps: Vec<VerificationStep>) -> Self {
        let overall = steps.iter().all(|step| step.passed);
        Self { steps, overall }
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &VerificationStep> {
        self.steps.iter().filter(|step| !step.passed)
    }
}

/// Reviewer verdict extracted from free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: String,
    pub accepted: bool,
    pub justification: String,
}

/// Combined post-edit outcome attached to an edit tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditVerdict {
    pub report: VerificationReport,
    pub review: ReviewVerdict,
    pub edit_accepted: bool,
}

impl EditVerdict {
    pub fn new(report: VerificationReport, review: ReviewVerdict) -> Self {
        let edit_accepted = report.overall && review.accepted;
        Self {
            report,
            review,
            edit_accepted,
        }
    }
}

/// Loop phase: free work, or finalization once the execution budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Execute,
    Verify,
}

/// Serialize JSON without whitespace.
pub fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}
