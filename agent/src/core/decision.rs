//! Strict parsing of model output into a [`Decision`].
//!
//! The accepted shapes are fixed by `schemas/decision.schema.json`:
//! `{"action":"message","content":...}` or
//! `{"action":"tool","name":...,"arguments":{...}}`. Anything else is a
//! [`DecisionViolation`] listing every problem found, which the caller feeds
//! back to the model as a corrective instruction.

use std::fmt;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::{Map, Value};

use crate::core::types::Decision;

pub const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");

static SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(DECISION_SCHEMA).expect("decision schema should be valid json")
});

static MESSAGE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_variant("message"));
static TOOL_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_variant("tool"));

fn compile_variant(name: &str) -> Validator {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&SCHEMA["$defs"][name])
        .expect("decision schema variant should compile")
}

/// The decision schema as JSON, for inclusion in model requests.
pub fn decision_schema() -> &'static Value {
    &SCHEMA
}

/// Model output that does not conform to the decision schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionViolation {
    /// Human-readable schema violations, in discovery order.
    pub violations: Vec<String>,
    /// The raw model output that failed to parse.
    pub raw: String,
}

impl fmt::Display for DecisionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decision schema violation: {}", self.violations.join("; "))
    }
}

impl std::error::Error for DecisionViolation {}

/// Parse raw model output into a [`Decision`].
pub fn parse_decision(raw: &str) -> Result<Decision, DecisionViolation> {
    let violation = |violations: Vec<String>| DecisionViolation {
        violations,
        raw: raw.to_string(),
    };

    let mut value = extract_json_object(raw).map_err(|err| violation(vec![err]))?;
    let Some(object) = value.as_object() else {
        return Err(violation(vec![
            "top-level value must be a JSON object".to_string(),
        ]));
    };

    let validator = match object.get("action") {
        Some(Value::String(action)) if action == "message" => &*MESSAGE_VALIDATOR,
        Some(Value::String(action)) if action == "tool" => &*TOOL_VALIDATOR,
        Some(other) => {
            return Err(violation(vec![format!(
                "\"action\" must be \"message\" or \"tool\" (got {other})"
            )]));
        }
        None => {
            return Err(violation(vec![
                "\"action\" is a required property".to_string(),
            ]));
        }
    };

    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(violation(messages));
    }

    value
        .as_object_mut()
        .and_then(into_decision)
        .ok_or_else(|| violation(vec!["decision fields have unexpected types".to_string()]))
}

fn into_decision(object: &mut Map<String, Value>) -> Option<Decision> {
    match object.get("action")?.as_str()? {
        "message" => {
            let text = object.remove("content")?.as_str()?.to_string();
            Some(Decision::Message { text })
        }
        "tool" => {
            let name = object.remove("name")?.as_str()?.to_string();
            let arguments = object.remove("arguments")?;
            Some(Decision::ToolCall { name, arguments })
        }
        _ => None,
    }
}

/// Locate the JSON value in model output.
///
/// Accepts bare JSON, JSON wrapped in a markdown fence, or the first balanced
/// `{...}` object embedded in surrounding prose.
pub fn extract_json_object(text: &str) -> Result<Value, String> {
    let raw = strip_fence(text.trim());
    if raw.is_empty() {
        return Err("response was empty".to_string());
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Ok(value);
    }

    let start = raw
        .find('{')
        .ok_or_else(|| "no JSON object found in response".to_string())?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let candidate = &raw[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate)
                        .map_err(|err| format!("invalid JSON object: {err}"));
                }
            }
            _ => {}
        }
    }
    Err("unterminated JSON object in response".to_string())
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
