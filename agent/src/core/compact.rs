//! Bounding tool results before they re-enter the conversation.
//!
//! Long text fields are clipped, long lists are cut with a `<key>_truncated`
//! count, and a rendered payload bounds its arguments and output separately so
//! the verification verdict always reaches the model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::types::{ToolResult, compact_json};

/// Marker appended to clipped text.
pub const CLIP_MARKER: &str = "...(truncated)";

const TEXT_KEYS: &[&str] = &["stdout", "stderr", "content"];
const LIST_KEYS: &[&str] = &["files", "matches"];

/// Size limits applied to tool output and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionLimits {
    /// Max characters kept from `stdout`, `stderr`, `content` and check details.
    pub text_chars: usize,
    /// Max entries kept from `files` and `matches`.
    pub list_items: usize,
    /// Max characters of the arguments plus the output of a rendered tool
    /// result; each gets half.
    pub payload_chars: usize,
    /// Max characters of each earlier turn replayed as history.
    pub history_chars: usize,
}

impl Default for CompactionLimits {
    fn default() -> Self {
        Self {
            text_chars: 1500,
            list_items: 40,
            payload_chars: 1800,
            history_chars: 1500,
        }
    }
}

/// Keep the first `max_chars` characters of `text`, marking the cut.
pub fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{CLIP_MARKER}", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Keep the last `max_chars` characters of `text`.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    let byte_idx = text
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    format!("{CLIP_MARKER}{}", &text[byte_idx..])
}

/// Compact a structured tool output object in place.
pub fn compact_output(output: &mut Value, limits: &CompactionLimits) {
    let Some(object) = output.as_object_mut() else {
        if let Value::String(text) = output {
            *text = clip(text, limits.text_chars);
        }
        return;
    };
    compact_object(object, limits);
}

fn compact_object(object: &mut Map<String, Value>, limits: &CompactionLimits) {
    for key in TEXT_KEYS {
        if let Some(Value::String(text)) = object.get_mut(*key) {
            *text = clip(text, limits.text_chars);
        }
    }
    for key in LIST_KEYS {
        let dropped = match object.get_mut(*key) {
            Some(Value::Array(items)) if items.len() > limits.list_items => {
                let dropped = items.len() - limits.list_items;
                items.truncate(limits.list_items);
                dropped
            }
            _ => continue,
        };
        object.insert(format!("{key}_truncated"), json!(dropped));
    }
}

/// Compacted JSON form of a tool result, as persisted in a tool turn.
pub fn compact_tool_result(result: &ToolResult, limits: &CompactionLimits) -> Value {
    let mut compacted = result.clone();
    compact_output(&mut compacted.output, limits);
    if let Some(verdict) = compacted.verification.as_mut() {
        for step in &mut verdict.report.steps {
            step.detail = tail(&step.detail, limits.text_chars);
        }
        verdict.review.justification = clip(&verdict.review.justification, limits.text_chars);
    }
    // Serializing plain data with string keys cannot fail.
    serde_json::to_value(&compacted).unwrap_or(Value::Null)
}

/// Tool-call arguments with every string value clipped to `text_chars`.
pub fn compact_arguments(arguments: &Value, limits: &CompactionLimits) -> Value {
    match arguments {
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, value)| match value {
                    Value::String(text) => (key.clone(), json!(clip(text, limits.text_chars))),
                    other => (key.clone(), other.clone()),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a tool payload for the model.
///
/// `arguments` and the result's `output` are each bounded to half of
/// `payload_chars`. Everything else, including `verification`, is rendered in
/// full; its details are already capped by [`compact_tool_result`].
pub fn render_tool_payload(payload: &Value, limits: &CompactionLimits) -> String {
    let share = limits.payload_chars / 2;
    let mut bounded = payload.clone();
    let Some(object) = bounded.as_object_mut() else {
        return clip(&compact_json(payload), limits.payload_chars);
    };
    if let Some(arguments) = object.get_mut("arguments") {
        bound_rendered(arguments, share);
    }
    match object.get_mut("result") {
        Some(Value::Object(result)) => {
            if let Some(output) = result.get_mut("output") {
                bound_rendered(output, share);
            }
        }
        Some(other) => bound_rendered(other, share),
        None => {}
    }
    compact_json(&bounded)
}

/// Replace `value` by its clipped rendering when that exceeds `max_chars`.
fn bound_rendered(value: &mut Value, max_chars: usize) {
    let rendered = compact_json(value);
    if rendered.chars().count() > max_chars {
        *value = Value::String(clip(&rendered, max_chars));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        EditVerdict, ErrorKind, ReviewVerdict, VerificationReport, VerificationStep,
    };

    fn small() -> CompactionLimits {
        CompactionLimits {
            text_chars: 5,
            list_items: 2,
            payload_chars: 30,
            history_chars: 10,
        }
    }

    #[test]
    fn clip_is_char_safe() {
        assert_eq!(clip("héllo wörld", 5), "héllo...(truncated)");
        assert_eq!(clip("short", 5), "short");
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdefgh", 3), "...(truncated)fgh");
        assert_eq!(tail("abc", 3), "abc");
    }

    #[test]
    fn clips_text_fields_and_truncates_lists() {
        let mut output = json!({
            "stdout": "0123456789",
            "files": ["a", "b", "c", "d"],
            "count": 4,
        });
        compact_output(&mut output, &small());
        assert_eq!(output["stdout"], "01234...(truncated)");
        assert_eq!(output["files"], json!(["a", "b"]));
        assert_eq!(output["files_truncated"], 2);
        assert_eq!(output["count"], 4);
        assert!(output.get("matches_truncated").is_none());
    }

    #[test]
    fn short_lists_are_untouched() {
        let mut output = json!({"matches": ["x:1:y"]});
        compact_output(&mut output, &small());
        assert_eq!(output, json!({"matches": ["x:1:y"]}));
    }

    #[test]
    fn compacts_verification_details() {
        let report = VerificationReport::from_steps(vec![VerificationStep {
            name: "static_check".to_string(),
            passed: false,
            detail: "error: long compiler output".to_string(),
        }]);
        let review = ReviewVerdict {
            verdict: "unparseable".to_string(),
            accepted: false,
            justification: String::new(),
        };
        let mut result = ToolResult::success(json!({"path": "src/lib.rs"}));
        result.verification = Some(EditVerdict::new(report, review));

        let value = compact_tool_result(&result, &small());
        assert_eq!(
            value["verification"]["report"]["steps"][0]["detail"],
            "...(truncated)utput"
        );
        assert_eq!(value["verification"]["edit_accepted"], false);
    }

    #[test]
    fn failure_output_string_is_clipped() {
        let result = ToolResult::failure(ErrorKind::ToolExecutionError, "a very long error");
        let value = compact_tool_result(&result, &small());
        assert_eq!(value["output"], "a ver...(truncated)");
        assert_eq!(value["error"], "tool_execution_error");
    }

    #[test]
    fn arguments_keep_keys_and_clip_strings() {
        let arguments = json!({"path": "a.rs", "content": "0123456789", "start": 3});
        assert_eq!(
            compact_arguments(&arguments, &small()),
            json!({"path": "a.rs", "content": "01234...(truncated)", "start": 3})
        );
    }

    #[test]
    fn rendered_payload_bounds_arguments_and_output() {
        let payload = json!({
            "tool": "write_file",
            "arguments": {"path": "a.rs", "content": "x".repeat(100)},
            "result": {"ok": true, "output": {"path": "a.rs", "bytes": 100}},
        });
        let rendered = render_tool_payload(&payload, &small());
        let value: Value = serde_json::from_str(&rendered).expect("valid json");
        let arguments = value["arguments"].as_str().expect("clipped arguments");
        assert!(arguments.ends_with(CLIP_MARKER));
        assert_eq!(arguments.chars().count(), 15 + CLIP_MARKER.len());
        assert_eq!(value["tool"], "write_file");
        assert!(value["result"]["output"].is_string());
    }

    #[test]
    fn rendered_payload_keeps_verification_whole() {
        let report = VerificationReport::from_steps(vec![VerificationStep {
            name: "static_check".to_string(),
            passed: false,
            detail: "error[E0425]: cannot find value `y`".to_string(),
        }]);
        let review = ReviewVerdict {
            verdict: "PASS".to_string(),
            accepted: true,
            justification: "fine".to_string(),
        };
        let mut result = ToolResult::success(json!({"path": "a.rs"}));
        result.verification = Some(EditVerdict::new(report, review));
        let payload = json!({
            "tool": "patch_file",
            "arguments": {"path": "a.rs", "find": "a".repeat(500), "replace": "b".repeat(500)},
            "result": compact_tool_result(&result, &CompactionLimits::default()),
        });

        let rendered = render_tool_payload(&payload, &small());
        let value: Value = serde_json::from_str(&rendered).expect("valid json");
        let verification = &value["result"]["verification"];
        assert_eq!(verification["edit_accepted"], false);
        assert_eq!(verification["report"]["steps"][0]["passed"], false);
        assert!(rendered.contains("E0425"));
    }

    #[test]
    fn non_object_payload_is_clipped_whole() {
        let rendered = render_tool_payload(&json!("x".repeat(100)), &small());
        assert!(rendered.ends_with(CLIP_MARKER));
        assert_eq!(rendered.chars().count(), 30 + CLIP_MARKER.len());
    }
}
