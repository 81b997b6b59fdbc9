//! Post-edit verification pipeline.
//!
//! After every successful edit the pipeline runs a fixed, ordered list of
//! checks (a project-wide static check, then a designated behavioral test)
//! and aggregates them into a [`VerificationReport`]. Checks never abort the
//! loop: launch failures and timeouts are recorded as failed steps. Nothing is
//! rolled back.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::compact::tail;
use crate::core::types::{VerificationReport, VerificationStep};
use crate::io::config::AgentConfig;
use crate::io::process::{CancelToken, LaunchRequest, Launcher};

pub const STATIC_CHECK: &str = "static_check";
pub const BEHAVIORAL_CHECK: &str = "behavioral_check";

/// One named command in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VerificationPipeline {
    checks: Vec<Check>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    detail_chars: usize,
}

impl VerificationPipeline {
    pub fn new(
        checks: Vec<Check>,
        workdir: PathBuf,
        timeout: Duration,
        output_limit_bytes: usize,
        detail_chars: usize,
    ) -> Self {
        Self {
            checks,
            workdir,
            timeout,
            output_limit_bytes,
            detail_chars,
        }
    }

    /// The static check followed by the behavioral check, from config.
    pub fn from_config(cfg: &AgentConfig, workdir: PathBuf) -> Self {
        let verification = &cfg.verification;
        Self::new(
            vec![
                Check {
                    name: STATIC_CHECK.to_string(),
                    command: verification.static_check.clone(),
                },
                Check {
                    name: BEHAVIORAL_CHECK.to_string(),
                    command: verification.behavioral_check.clone(),
                },
            ],
            workdir,
            Duration::from_secs(verification.timeout_secs),
            cfg.output_limit_bytes,
            verification.detail_chars,
        )
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    /// Run every check in order and aggregate the results.
    #[instrument(skip_all, fields(checks = self.checks.len()))]
    pub fn run<L: Launcher>(&self, launcher: &L, cancel: &CancelToken) -> VerificationReport {
        let steps = self
            .checks
            .iter()
            .map(|check| self.run_check(launcher, cancel, check))
            .collect();
        let report = VerificationReport::from_steps(steps);
        info!(overall = report.overall, "verification finished");
        report
    }

    fn run_check<L: Launcher>(
        &self,
        launcher: &L,
        cancel: &CancelToken,
        check: &Check,
    ) -> VerificationStep {
        let failed = |detail: String| VerificationStep {
            name: check.name.clone(),
            passed: false,
            detail,
        };
        let Some((program, args)) = check.command.split_first() else {
            return failed("check has no command".to_string());
        };
        let request = LaunchRequest {
            program: program.clone(),
            args: args.to_vec(),
            workdir: self.workdir.clone(),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
            cancel: cancel.clone(),
        };

        let output = match launcher.run(&request) {
            Ok(output) => output,
            Err(err) => {
                warn!(check = %check.name, err = %format!("{err:#}"), "check failed to launch");
                return failed(format!("failed to launch `{}`: {err:#}", request.display()));
            }
        };

        let transcript = tail(output.transcript().trim_end(), self.detail_chars);
        if output.cancelled {
            return failed(format!("cancelled\n{transcript}").trim_end().to_string());
        }
        if output.timed_out {
            return failed(
                format!("timed out after {}s\n{transcript}", self.timeout.as_secs())
                    .trim_end()
                    .to_string(),
            );
        }
        let passed = output.exit_code == Some(0);
        let detail = if !passed && transcript.is_empty() {
            match output.exit_code {
                Some(code) => format!("`{}` exited with code {code}", request.display()),
                None => format!("`{}` was terminated by a signal", request.display()),
            }
        } else {
            transcript
        };
        VerificationStep {
            name: check.name.clone(),
            passed,
            detail,
        }
    }
}
