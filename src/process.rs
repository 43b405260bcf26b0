//! External process execution with a hard timeout.
//!
//! An invocation completes exactly once: the process exits, or the timeout
//! fires first and the process is killed. `run` and `spawn` are the async
//! modes used by the pipeline; `run_blocking` polls from a plain thread for
//! one-shot callers.

use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// How often `run_blocking` checks whether the child has exited.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long `run_blocking` waits for the output streams once the child is gone.
const BLOCKING_MARGIN: Duration = Duration::from_millis(200);

/// Exit code reported for timeouts, spawn failures and signal deaths.
pub const FAILURE_CODE: i32 = 1;

/// A single external command execution.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human-readable command line for log and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of an invocation. Streams have trailing whitespace trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("`{command}` timed out and was killed")]
    TimedOut { command: String },
    #[error("`{command}` exited with code {code}: {detail}")]
    Failed {
        command: String,
        code: i32,
        detail: String,
    },
}

impl Output {
    fn from_streams(code: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            code,
            stdout: String::from_utf8_lossy(stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(stderr).trim_end().to_string(),
            timed_out: false,
        }
    }

    fn timed_out() -> Self {
        Self {
            code: FAILURE_CODE,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            code: FAILURE_CODE,
            stdout: String::new(),
            stderr: message,
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0 && !self.timed_out
    }

    /// Apply the completion policy.
    ///
    /// A timeout or non-zero exit is an error. A zero exit with stderr output
    /// is logged as a warning and otherwise treated as success.
    pub fn check(self, command: &str) -> Result<Self, ProcessError> {
        if self.timed_out {
            return Err(ProcessError::TimedOut {
                command: command.to_string(),
            });
        }
        if self.code != 0 {
            let detail = [self.stderr.as_str(), self.stdout.as_str()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(ProcessError::Failed {
                command: command.to_string(),
                code: self.code,
                detail,
            });
        }
        if !self.stderr.is_empty() {
            tracing::warn!(command, stderr = %self.stderr, "command succeeded with warnings");
        }
        Ok(self)
    }
}

/// Run an invocation to completion or timeout.
///
/// On timeout the wait future is dropped, which drops the child; `kill_on_drop`
/// then kills the process. Only one of the two outcomes is ever produced.
pub async fn run(invocation: &Invocation) -> Output {
    let mut cmd = tokio::process::Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Output::failed(format!("failed to spawn {}: {e}", invocation.program)),
    };

    match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Output::from_streams(
            output.status.code().unwrap_or(FAILURE_CODE),
            &output.stdout,
            &output.stderr,
        ),
        Ok(Err(e)) => Output::failed(format!("failed to wait for {}: {e}", invocation.program)),
        Err(_) => Output::timed_out(),
    }
}

/// Run an invocation in the background and hand its output to `on_complete`.
pub fn spawn<F>(invocation: Invocation, on_complete: F) -> JoinHandle<()>
where
    F: FnOnce(Output) + Send + 'static,
{
    tokio::spawn(async move {
        let output = run(&invocation).await;
        on_complete(output);
    })
}

/// Run an invocation on the calling thread, polling for completion.
///
/// Gives up on the process at the timeout and on its output streams
/// `BLOCKING_MARGIN` after that.
pub fn run_blocking(invocation: &Invocation) -> Output {
    let spawned = std::process::Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => return Output::failed(format!("failed to spawn {}: {e}", invocation.program)),
    };

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + invocation.timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() >= deadline => break None,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Output::failed(format!("failed to wait for {}: {e}", invocation.program));
            }
        }
    };

    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        return Output::timed_out();
    };

    let streams_deadline = Instant::now() + BLOCKING_MARGIN;
    match (collect(&stdout, streams_deadline), collect(&stderr, streams_deadline)) {
        (Some(out), Some(err)) => {
            Output::from_streams(status.code().unwrap_or(FAILURE_CODE), &out, &err)
        }
        _ => Output::failed(format!(
            "output of {} did not close after exit",
            invocation.program
        )),
    }
}

/// Read a child stream to the end on a helper thread.
fn drain<R: Read + Send + 'static>(stream: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: &mpsc::Receiver<Vec<u8>>, deadline: Instant) -> Option<Vec<u8>> {
    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .ok()
}
