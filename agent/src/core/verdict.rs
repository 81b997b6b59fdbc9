//! Reviewer verdict extraction.
//!
//! The reviewer answers in free text. The verdict is read from the first line
//! that starts with the configured label; everything else is justification.
//! A missing or empty verdict line never counts as acceptance.

use serde::{Deserialize, Serialize};

use crate::core::types::ReviewVerdict;

/// Verdict reported when no usable verdict line exists.
pub const UNPARSEABLE: &str = "unparseable";

/// Label and accept token used to read the reviewer's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictRules {
    pub label: String,
    pub accept_token: String,
}

impl Default for VerdictRules {
    fn default() -> Self {
        Self {
            label: "Verdict:".to_string(),
            accept_token: "PASS".to_string(),
        }
    }
}

/// Extract a [`ReviewVerdict`] from reviewer text.
pub fn extract_verdict(text: &str, rules: &VerdictRules) -> ReviewVerdict {
    let mut verdict_line = None;
    let mut justification = Vec::new();
    for line in text.lines() {
        if verdict_line.is_none()
            && let Some(rest) = strip_label(line, &rules.label)
        {
            verdict_line = Some(rest);
            continue;
        }
        if !line.trim().is_empty() {
            justification.push(line.trim());
        }
    }

    let token = verdict_line.and_then(|rest| {
        rest.split_whitespace()
            .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
            .find(|token| !token.is_empty())
    });

    match token {
        Some(token) => ReviewVerdict {
            verdict: token.to_string(),
            accepted: token.eq_ignore_ascii_case(&rules.accept_token),
            justification: justification.join("\n"),
        },
        None => ReviewVerdict {
            verdict: UNPARSEABLE.to_string(),
            accepted: false,
            justification: justification.join("\n"),
        },
    }
}

/// Return the text after `label` if `line` starts with it.
///
/// Leading whitespace, list enumerators (`1)`, `2.`, `-`) and markdown emphasis
/// are skipped before the comparison, which ignores ASCII case.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let trimmed = line
        .trim_start()
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_start_matches([')', '.', '-', '*', '#', '>'])
        .trim_start();
    let head = trimmed.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then_some(&trimmed[label.len()..])
}
