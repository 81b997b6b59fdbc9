//! Deny-list filter for shell commands.
//!
//! Patterns are configuration data (regular expressions, matched
//! case-insensitively). Commands are normalized before matching: shell quotes
//! and backslash escapes are dropped and whitespace is collapsed, so
//! `rm   -rf\t/`, `rm -rf "/"` and `rm -rf /` are treated alike.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

/// Patterns applied when the config does not override them.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\brm\s+(-[a-z-]+\s+)*(-[a-z]*r[a-z]*|--recursive)\s+(-[a-z-]+\s+)*(--\s+)?[/~]",
    r"\bsudo\b",
    r"\bdoas\b",
    r"\bsu\s+(-|root\b)",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bhalt\b",
    r"\bpoweroff\b",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\s+if=",
    r"\bgit\s+reset\s+--hard\b",
    r"\bgit\s+checkout\s+--(\s|$)",
    r"\bgit\s+clean\s+-[a-z]*f",
    r":\(\)\s*\{\s*:\s*\|\s*:",
];

/// Result of checking one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SafetyVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Compiled deny-list. Stateless once built.
#[derive(Debug, Clone)]
pub struct SafetyFilter {
    patterns: Vec<Regex>,
}

impl SafetyFilter {
    /// Compile `patterns`; an invalid pattern is a configuration error.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("compile deny pattern `{pattern}`"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_DENY_PATTERNS)
    }

    /// Check a command against the deny-list. Any match rejects.
    pub fn check(&self, command: &str) -> SafetyVerdict {
        let normalized = normalize_command(command);
        if normalized.is_empty() {
            return SafetyVerdict::deny("shell command is empty".to_string());
        }
        match self.patterns.iter().find(|re| re.is_match(&normalized)) {
            Some(re) => SafetyVerdict::deny(format!("blocked shell command pattern: {}", re.as_str())),
            None => SafetyVerdict::allow(),
        }
    }
}

/// Drop quote and backslash characters, then collapse every run of whitespace
/// to a single space and trim the ends.
pub fn normalize_command(command: &str) -> String {
    let unquoted: String = command
        .chars()
        .filter(|c| !matches!(c, '\'' | '"' | '\\'))
        .collect();
    unquoted.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> SafetyFilter {
        SafetyFilter::with_defaults().expect("defaults compile")
    }

    #[test]
    fn blocks_destructive_commands() {
        let filter = filter();
        for command in [
            "rm -rf /",
            "rm -fr /home",
            "rm -r -f /",
            "rm -rf ~",
            "rm -rf \"/\"",
            "rm -rf '/'",
            "rm -rf \\/",
            "'rm' -rf /",
            "s\"ud\"o ls",
            "sudo reboot",
            "echo hi && sudo apt install x",
            "shutdown -h now",
            "reboot",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "git reset --hard HEAD~3",
            "git checkout -- .",
            "git clean -fdx",
        ] {
            let verdict = filter.check(command);
            assert!(!verdict.allowed, "expected `{command}` to be blocked");
            assert!(verdict.reason.is_some());
        }
    }

    #[test]
    fn matching_is_case_and_whitespace_insensitive() {
        let filter = filter();
        assert!(!filter.check("RM   -RF\t/").allowed);
        assert!(!filter.check("  SuDo\nls").allowed);
        assert!(!filter.check("git   reset\t--HARD").allowed);
    }

    #[test]
    fn normalization_drops_quotes_and_escapes() {
        assert_eq!(normalize_command("rm  -rf \"/\""), "rm -rf /");
        assert_eq!(normalize_command("rm -rf '/' \\\n && ls"), "rm -rf / && ls");
        assert_eq!(normalize_command("  \"\"  "), "");
    }

    #[test]
    fn allows_ordinary_commands() {
        let filter = filter();
        for command in [
            "ls -la",
            "cargo test --quiet",
            "rm -rf target/tmp",
            "rm build.log",
            "git status",
            "git checkout main",
            "grep -r pseudo src",
        ] {
            assert!(filter.check(command).allowed, "expected `{command}` to pass");
        }
    }

    #[test]
    fn rejects_empty_command() {
        let verdict = filter().check("   \n");
        assert!(!verdict.allowed);
        let verdict = filter().check(" '' ");
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason.as_deref(), Some("shell command is empty"));
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let filter = SafetyFilter::new(&["curl"]).expect("compile");
        assert!(!filter.check("CURL example.com").allowed);
        assert!(filter.check("sudo ls").allowed);
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = SafetyFilter::new(&["("]).unwrap_err();
        assert!(err.to_string().contains("compile deny pattern"));
    }
}
