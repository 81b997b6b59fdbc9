//! Secondary reviewer: an independent model call judging each verified edit.

use serde_json::Value;
use tracing::{info, instrument};

use crate::core::compact::clip;
use crate::core::types::{ReviewVerdict, Role, Turn, VerificationReport};
use crate::core::verdict::{VerdictRules, extract_verdict};
use crate::error::FatalError;
use crate::io::config::AgentConfig;
use crate::io::model::{ChatMessage, ModelClient, ModelRequest, RetryPolicy, request_with_retry};
use crate::io::prompt::{PromptEngine, ReviewPromptInput};
use crate::io::tools::ToolName;

/// Characters kept from each context line.
const CONTEXT_LINE_CHARS: usize = 220;

/// What the reviewer is shown about one edit.
#[derive(Debug, Clone)]
pub struct ReviewInput<'a> {
    pub user_request: &'a str,
    pub tool: ToolName,
    pub path: &'a str,
    pub diff: String,
    pub report: &'a VerificationReport,
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct Reviewer {
    model: String,
    rules: VerdictRules,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl Reviewer {
    pub fn new(model: String, rules: VerdictRules, max_tokens: u32, retry: RetryPolicy) -> Self {
        Self {
            model,
            rules,
            max_tokens,
            retry,
        }
    }

    pub fn from_config(cfg: &AgentConfig, retry: RetryPolicy) -> Self {
        Self::new(
            cfg.reviewer_model().to_string(),
            cfg.review.rules(),
            cfg.review.max_tokens,
            retry,
        )
    }

    /// Ask the reviewer model for a verdict on one edit.
    ///
    /// A reply without a verdict line is a rejection, not an error. Model
    /// failures after retries are fatal.
    #[instrument(skip_all, fields(path = input.path, model = %self.model))]
    pub fn review<M: ModelClient>(
        &self,
        client: &M,
        prompts: &PromptEngine,
        input: &ReviewInput<'_>,
    ) -> Result<ReviewVerdict, FatalError> {
        let system = prompts
            .render_reviewer_system(&self.rules)
            .map_err(FatalError::Prompt)?;
        let user = prompts
            .render_review_request(&ReviewPromptInput {
                user_request: input.user_request,
                tool: input.tool.as_str(),
                path: input.path,
                diff: &input.diff,
                report: input.report,
                context: &input.context,
            })
            .map_err(FatalError::Prompt)?;
        let request = ModelRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            max_tokens: self.max_tokens,
            json_mode: false,
        };
        let reply = request_with_retry(client, &request, self.retry)?;
        let verdict = extract_verdict(&reply, &self.rules);
        info!(verdict = %verdict.verdict, accepted = verdict.accepted, "review finished");
        Ok(verdict)
    }
}

/// Describe an edit for review, bounded to `max_chars`.
pub fn edit_diff(tool: ToolName, arguments: &Value, max_chars: usize) -> String {
    let field = |key: &str| arguments.get(key).and_then(Value::as_str).unwrap_or("");
    match tool {
        ToolName::PatchFile => clip(
            &format!("--- find\n{}\n+++ replace\n{}", field("find"), field("replace")),
            max_chars,
        ),
        ToolName::WriteFile => clip(
            &format!("new file content:\n{}", field("content")),
            max_chars,
        ),
        _ => String::new(),
    }
}

/// The last `max_items` user/assistant turns as `role: text` lines.
pub fn recent_context(turns: &[Turn], max_items: usize) -> String {
    let relevant: Vec<&Turn> = turns
        .iter()
        .filter(|turn| matches!(turn.role, Role::User | Role::Assistant))
        .collect();
    let start = relevant.len().saturating_sub(max_items);
    relevant[start..]
        .iter()
        .map(|turn| {
            format!(
                "{}: {}",
                turn.role.as_str(),
                clip(&turn.content.render(), CONTEXT_LINE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
