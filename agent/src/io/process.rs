//! Running child processes with timeouts, cancellation and bounded output.
//!
//! The [`Launcher`] trait is the seam between the agent loop and real process
//! spawning. Tests use scripted launchers that record requests without
//! spawning anything.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to keep draining pipes after the child exits. Grandchildren that
/// inherited the pipes may keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Shared cancellation flag, set from a signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before the next request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// The underlying flag, for registration with `signal-hook`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Parameters for one process launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    pub cancel: CancelToken,
}

impl LaunchRequest {
    /// Human-readable command line, for logs and error details.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured child process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    /// Output of a process that ran to completion.
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Stdout followed by stderr, with truncation notices.
    pub fn transcript(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&self.stdout);
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&self.stderr);
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        buf
    }
}

/// Abstraction over process spawning.
pub trait Launcher {
    /// Run the request to completion, timeout or cancellation.
    ///
    /// `Err` means the process could not be launched (or its output could not
    /// be collected); a nonzero exit is still `Ok`.
    fn run(&self, request: &LaunchRequest) -> Result<CommandOutput>;
}

/// Launcher that spawns real child processes.
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn run(&self, request: &LaunchRequest) -> Result<CommandOutput> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).current_dir(&request.workdir);
        run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes, &request.cancel)
            .with_context(|| format!("run `{}`", request.display()))
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child is killed when the timeout elapses or `cancel` is set.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_capture = StreamCapture::spawn(stdout, output_limit_bytes);
    let stderr_capture = StreamCapture::spawn(stderr, output_limit_bytes);

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let now = Instant::now();
        let slice = deadline.saturating_duration_since(now).min(POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        child.kill().context("kill command")?;
        break child.wait().context("wait command after kill")?;
    };

    let (stdout, stdout_truncated) = stdout_capture.finish().context("collect stdout")?;
    let (stderr, stderr_truncated) = stderr_capture.finish().context("collect stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// Output collected by a background reader thread.
struct StreamCapture {
    collected: Arc<Mutex<(Vec<u8>, usize)>>,
    done: Receiver<Result<()>>,
}

impl StreamCapture {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let collected = Arc::new(Mutex::new((Vec::new(), 0usize)));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&collected);
        thread::spawn(move || {
            // The receiver may be gone if the caller stopped waiting.
            let _ = tx.send(read_stream_limited(reader, limit, &sink));
        });
        Self { collected, done }
    }

    fn finish(self) -> Result<(Vec<u8>, usize)> {
        match self.done.recv_timeout(DRAIN_GRACE) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                warn!("output pipe still open after exit, keeping partial output");
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
        let mut guard = self
            .collected
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let truncated = guard.1;
        Ok((std::mem::take(&mut guard.0), truncated))
    }
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    sink: &Mutex<(Vec<u8>, usize)>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut guard = sink
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let (buf, truncated) = &mut *guard;
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            *truncated += n.saturating_sub(keep);
        } else {
            *truncated += n;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration, limit: usize, cancel: CancelToken) -> LaunchRequest {
        LaunchRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: std::env::temp_dir(),
            timeout,
            output_limit_bytes: limit,
            cancel,
        }
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let output = ProcessLauncher
            .run(&sh(
                "echo out; echo err >&2; exit 3",
                Duration::from_secs(10),
                1024,
                CancelToken::new(),
            ))
            .expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());
        assert!(!output.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let started = Instant::now();
        let output = ProcessLauncher
            .run(&sh(
                "sleep 5",
                Duration::from_millis(200),
                1024,
                CancelToken::new(),
            ))
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn kills_when_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let output = ProcessLauncher
            .run(&sh("sleep 5", Duration::from_secs(10), 1024, cancel))
            .expect("run");
        assert!(output.cancelled);
        assert!(!output.timed_out);
    }

    #[test]
    fn bounds_captured_output() {
        let output = ProcessLauncher
            .run(&sh(
                "printf '0123456789'",
                Duration::from_secs(10),
                4,
                CancelToken::new(),
            ))
            .expect("run");
        assert_eq!(output.stdout, "0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.transcript().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn launch_failure_is_error() {
        let request = LaunchRequest {
            program: "definitely-not-a-real-binary-xyz".to_string(),
            args: Vec::new(),
            workdir: std::env::temp_dir(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1024,
            cancel: CancelToken::new(),
        };
        assert!(ProcessLauncher.run(&request).is_err());
    }

    #[test]
    fn cancel_token_resets() {
        let token = CancelToken::new();
        let flag = token.flag();
        flag.store(true, Ordering::SeqCst);
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }
}
