//! Tool registry: the closed set of file and shell tools the model may call.
//!
//! Tool names form a closed enum validated at startup. Arguments are checked
//! against each tool's JSON Schema (`schemas/tools.json`) and then
//! deserialized into typed structs before dispatch. Every failure becomes a
//! [`ToolResult`] with an [`ErrorKind`]; the registry never panics on model
//! input.

pub mod fs;
pub mod search;
pub mod shell;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::types::{ErrorKind, ToolResult};
use crate::io::process::{CancelToken, Launcher};

pub use shell::ShellSettings;

const TOOL_CATALOGUE: &str = include_str!("../../../schemas/tools.json");

static CATALOGUE: LazyLock<Vec<ToolSpec>> = LazyLock::new(|| {
    serde_json::from_str(TOOL_CATALOGUE).expect("tool catalogue should be valid json")
});

/// Name, description and input schema of one tool, as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The closed set of tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ListFiles,
    ReadFile,
    WriteFile,
    PatchFile,
    SearchText,
    RunShell,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        ToolName::ListFiles,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::PatchFile,
        ToolName::SearchText,
        ToolName::RunShell,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ListFiles => "list_files",
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::PatchFile => "patch_file",
            ToolName::SearchText => "search_text",
            ToolName::RunShell => "run_shell",
        }
    }

    /// Edit tools trigger verification.
    pub fn is_edit(self) -> bool {
        matches!(self, ToolName::WriteFile | ToolName::PatchFile)
    }

    /// Only these tools run in the verify phase. `run_shell` can mutate the
    /// workspace, so it is not one of them.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            ToolName::ListFiles | ToolName::ReadFile | ToolName::SearchText
        )
    }

    pub fn spec(self) -> &'static ToolSpec {
        CATALOGUE
            .iter()
            .find(|spec| spec.name == self.as_str())
            .expect("every tool should have a catalogue entry")
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == name)
            .ok_or_else(|| anyhow!("unknown tool `{name}`"))
    }
}

/// Typed tool failure, converted into a failed [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecutionError, message)
    }
}

/// Enabled tools bound to one workspace.
pub struct ToolRegistry {
    workspace: PathBuf,
    enabled: Vec<ToolName>,
    validators: HashMap<ToolName, Validator>,
    shell: ShellSettings,
}

impl ToolRegistry {
    /// Build a registry for `workspace` with the given tools enabled.
    pub fn new(workspace: &Path, enabled: &[ToolName], shell: ShellSettings) -> Result<Self> {
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("resolve workspace {}", workspace.display()))?;
        let mut validators = HashMap::new();
        for tool in enabled {
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&tool.spec().input_schema)
                .with_context(|| format!("compile input schema for `{tool}`"))?;
            validators.insert(*tool, validator);
        }
        debug!(workspace = %workspace.display(), tools = enabled.len(), "tool registry ready");
        Ok(Self {
            workspace,
            enabled: enabled.to_vec(),
            validators,
            shell,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Specs of the enabled tools, in configuration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.enabled.iter().map(|tool| tool.spec().clone()).collect()
    }

    /// Resolve a model-supplied name to an enabled tool.
    pub fn lookup(&self, name: &str) -> Option<ToolName> {
        ToolName::from_str(name)
            .ok()
            .filter(|tool| self.enabled.contains(tool))
    }

    /// Execute one tool call. Never fails; errors are recorded in the result.
    #[instrument(skip_all, fields(tool = name))]
    pub fn execute<L: Launcher>(
        &self,
        launcher: &L,
        cancel: &CancelToken,
        name: &str,
        arguments: &Value,
    ) -> ToolResult {
        match self.dispatch(launcher, cancel, name, arguments) {
            Ok(output) => ToolResult::success(output),
            Err(err) => {
                debug!(kind = err.kind.as_str(), err = %err.message, "tool failed");
                ToolResult::failure(err.kind, err.message)
            }
        }
    }

    fn dispatch<L: Launcher>(
        &self,
        launcher: &L,
        cancel: &CancelToken,
        name: &str,
        arguments: &Value,
    ) -> Result<Value, ToolError> {
        let tool = self
            .lookup(name)
            .ok_or_else(|| ToolError::execution(format!("unknown tool `{name}`")))?;
        self.validate_arguments(tool, arguments)?;

        let root = self.workspace.as_path();
        match tool {
            ToolName::ListFiles => fs::list_files(root, &parse_args(tool, arguments)?),
            ToolName::ReadFile => fs::read_file(root, &parse_args(tool, arguments)?),
            ToolName::WriteFile => fs::write_file(root, &parse_args(tool, arguments)?),
            ToolName::PatchFile => fs::patch_file(root, &parse_args(tool, arguments)?),
            ToolName::SearchText => search::search_text(root, &parse_args(tool, arguments)?),
            ToolName::RunShell => shell::run_shell(
                root,
                &parse_args(tool, arguments)?,
                &self.shell,
                launcher,
                cancel,
            ),
        }
    }

    fn validate_arguments(&self, tool: ToolName, arguments: &Value) -> Result<(), ToolError> {
        let Some(validator) = self.validators.get(&tool) else {
            return Err(ToolError::execution(format!("tool `{tool}` is not enabled")));
        };
        let violations: Vec<String> = validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ToolError::execution(format!(
                "invalid arguments for `{tool}`: {}",
                violations.join("; ")
            )))
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, arguments: &Value) -> Result<T, ToolError> {
    T::deserialize(arguments)
        .map_err(|err| ToolError::execution(format!("invalid arguments for `{tool}`: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLauncher;
    use serde_json::json;
    use std::time::Duration;

    fn registry(root: &Path, tools: &[ToolName]) -> ToolRegistry {
        ToolRegistry::new(
            root,
            tools,
            ShellSettings {
                timeout: Duration::from_secs(5),
                output_limit_bytes: 10_000,
            },
        )
        .expect("registry")
    }

    #[test]
    fn every_tool_has_a_spec_with_matching_name() {
        for tool in ToolName::ALL {
            assert_eq!(tool.spec().name, tool.as_str());
            assert_eq!(ToolName::from_str(tool.as_str()).expect("parse"), tool);
        }
        assert_eq!(CATALOGUE.len(), ToolName::ALL.len());
    }

    #[test]
    fn only_write_and_patch_are_edits() {
        let edits: Vec<ToolName> = ToolName::ALL.into_iter().filter(|t| t.is_edit()).collect();
        assert_eq!(edits, vec![ToolName::WriteFile, ToolName::PatchFile]);
        let read_only: Vec<ToolName> =
            ToolName::ALL.into_iter().filter(|t| t.is_read_only()).collect();
        assert_eq!(
            read_only,
            vec![ToolName::ListFiles, ToolName::ReadFile, ToolName::SearchText]
        );
    }

    #[test]
    fn unknown_and_disabled_tools_fail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), &[ToolName::ReadFile]);
        let launcher = ScriptedLauncher::new();
        let cancel = CancelToken::new();

        let result = registry.execute(&launcher, &cancel, "delete_everything", &json!({}));
        assert!(!result.ok);
        assert_eq!(result.error, Some(ErrorKind::ToolExecutionError));

        let result = registry.execute(&launcher, &cancel, "list_files", &json!({}));
        assert!(!result.ok);
        assert_eq!(result.output, json!("unknown tool `list_files`"));
    }

    #[test]
    fn schema_violations_name_the_problem() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), &ToolName::ALL);
        let launcher = ScriptedLauncher::new();
        let cancel = CancelToken::new();

        let result = registry.execute(&launcher, &cancel, "read_file", &json!({"start": 1}));
        assert!(!result.ok);
        let message = result.output.as_str().expect("string");
        assert!(message.contains("read_file"), "{message}");
        assert!(message.contains("\"path\""), "{message}");

        let result = registry.execute(
            &launcher,
            &cancel,
            "write_file",
            &json!({"path": "a.txt", "content": "x", "mode": "0777"}),
        );
        assert!(!result.ok);
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn dispatches_to_file_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), &ToolName::ALL);
        let launcher = ScriptedLauncher::new();
        let cancel = CancelToken::new();

        let result = registry.execute(
            &launcher,
            &cancel,
            "write_file",
            &json!({"path": "src/a.txt", "content": "one\ntwo\n"}),
        );
        assert!(result.ok, "{result:?}");
        assert_eq!(result.output["path"], "src/a.txt");

        let result = registry.execute(
            &launcher,
            &cancel,
            "read_file",
            &json!({"path": "src/a.txt", "start": 2}),
        );
        assert!(result.ok, "{result:?}");
        assert_eq!(result.output["content"], "two");
        assert!(launcher.requests().is_empty());
    }
}
