//! `run_shell`: run a command through `sh -c` in the workspace.
//!
//! The safety filter is applied by the caller before this runs; this module
//! only launches, bounds and reports.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::ToolError;
use crate::core::compact::tail;
use crate::core::types::ErrorKind;
use crate::io::process::{CancelToken, LaunchRequest, Launcher};

/// Characters of stdout/stderr tail kept in the result.
pub const OUTPUT_TAIL_CHARS: usize = 8000;

#[derive(Debug, Deserialize)]
pub struct RunShellArgs {
    pub command: String,
}

/// Limits applied to every shell invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellSettings {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub fn run_shell<L: Launcher>(
    root: &Path,
    args: &RunShellArgs,
    settings: &ShellSettings,
    launcher: &L,
    cancel: &CancelToken,
) -> Result<Value, ToolError> {
    let request = LaunchRequest {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), args.command.clone()],
        workdir: root.to_path_buf(),
        timeout: settings.timeout,
        output_limit_bytes: settings.output_limit_bytes,
        cancel: cancel.clone(),
    };
    let output = launcher
        .run(&request)
        .map_err(|err| ToolError::execution(format!("failed to launch shell: {err:#}")))?;

    if output.cancelled {
        return Err(ToolError::new(ErrorKind::Cancelled, "command cancelled"));
    }
    if output.timed_out {
        return Err(ToolError::new(
            ErrorKind::Timeout,
            format!(
                "command timed out after {}s and was killed",
                settings.timeout.as_secs()
            ),
        ));
    }
    Ok(json!({
        "command": args.command,
        "returncode": output.exit_code,
        "stdout": tail(&output.stdout, OUTPUT_TAIL_CHARS),
        "stderr": tail(&output.stderr, OUTPUT_TAIL_CHARS),
    }))
}
