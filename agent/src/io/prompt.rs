//! Prompt rendering for decision and review requests.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{VerificationReport, compact_json};
use crate::core::verdict::VerdictRules;
use crate::io::tools::ToolSpec;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const FINALIZE_TEMPLATE: &str = include_str!("prompts/finalize.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const REVIEW_REQUEST_TEMPLATE: &str = include_str!("prompts/review_request.md");

/// Tool entry as shown in the system prompt.
#[derive(Debug, Clone, Serialize)]
struct ToolContext {
    name: String,
    description: String,
    input_schema: String,
}

/// Inputs for the decision system prompt.
#[derive(Debug, Clone)]
pub struct SystemPromptInput<'a> {
    pub workspace: &'a str,
    pub tools: &'a [ToolSpec],
    pub max_steps: u32,
    pub execution_limit: u32,
}

/// Inputs for the reviewer's user message.
#[derive(Debug, Clone)]
pub struct ReviewPromptInput<'a> {
    pub user_request: &'a str,
    pub tool: &'a str,
    pub path: &'a str,
    pub diff: &'a str,
    pub report: &'a VerificationReport,
    pub context: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("finalize", FINALIZE_TEMPLATE)
            .expect("finalize template should be valid");
        env.add_template("correction", CORRECTION_TEMPLATE)
            .expect("correction template should be valid");
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        env.add_template("review_request", REVIEW_REQUEST_TEMPLATE)
            .expect("review request template should be valid");
        Self { env }
    }

    pub fn render_system(&self, input: &SystemPromptInput<'_>) -> Result<String> {
        let tools: Vec<ToolContext> = input
            .tools
            .iter()
            .map(|spec| ToolContext {
                name: spec.name.clone(),
                description: spec.description.clone(),
                input_schema: compact_json(&spec.input_schema),
            })
            .collect();
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            workspace => input.workspace,
            tools => tools,
            max_steps => input.max_steps,
            execution_limit => input.execution_limit,
            decision_schema => compact_json(crate::core::decision::decision_schema()),
        })?;
        Ok(rendered.trim_end().to_string())
    }

    /// Notice sent with every request once the verify phase starts.
    pub fn render_finalize(&self, remaining: u32, edited_files: &[String]) -> Result<String> {
        let template = self.env.get_template("finalize")?;
        let rendered = template.render(context! {
            remaining => remaining,
            edited_files => edited_files,
        })?;
        Ok(rendered.trim_end().to_string())
    }

    /// Corrective instruction naming every schema violation.
    pub fn render_correction(&self, violations: &[String]) -> Result<String> {
        let template = self.env.get_template("correction")?;
        let rendered = template.render(context! { violations => violations })?;
        Ok(rendered.trim_end().to_string())
    }

    pub fn render_reviewer_system(&self, rules: &VerdictRules) -> Result<String> {
        let template = self.env.get_template("reviewer")?;
        let rendered = template.render(context! {
            label => rules.label.trim(),
            accept_token => rules.accept_token.trim(),
        })?;
        Ok(rendered.trim_end().to_string())
    }

    pub fn render_review_request(&self, input: &ReviewPromptInput<'_>) -> Result<String> {
        let template = self.env.get_template("review_request")?;
        let rendered = template.render(context! {
            user_request => input.user_request.trim(),
            tool => input.tool,
            path => input.path,
            diff => input.diff,
            report => input.report,
            context => input.context.trim(),
        })?;
        Ok(rendered.trim_end().to_string())
    }
}
