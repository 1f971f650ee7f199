//! External tool invocation.
//!
//! Every binary-format operation in this project (WIM extract/capture, hive
//! editing, external ISO authoring) goes through [`ToolRunner`], a small
//! capability interface. The pipeline only ever sees an [`ExitResult`], so
//! tests substitute a scripted runner and never touch real binaries.

use crate::error::PatchError;
use anyhow::Result;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between the pipeline and its host.
///
/// The pipeline checks it between stages and polls it while a child process
/// runs; on cancellation the child is killed before the workspace is
/// released.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Bail out with [`PatchError::Cancelled`] if the host signalled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(PatchError::Cancelled.into());
        }
        Ok(())
    }
}

/// One external tool invocation, fully described.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<T, I, A>(tool: T, args: I) -> Self
    where
        T: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            tool: tool.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Rendered command line for logs and failure reasons.
    pub fn command_line(&self) -> String {
        let mut line = self.tool.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured outcome of one external tool invocation.
///
/// A failure to even start the tool (not installed, not executable) is
/// reported as an unsuccessful `ExitResult`, not an `Err`: the authoring
/// pipeline treats it as one more strategy failure and moves on.
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ExitResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            code: Some(1),
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Verbatim reason for diagnostics: exit code plus whatever the tool
    /// printed on stderr (or stdout when stderr is empty).
    pub fn failure_reason(&self) -> String {
        let detail = if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        };
        match (self.code, detail.is_empty()) {
            (Some(code), false) => format!("exit code {}: {}", code, detail),
            (Some(code), true) => format!("exit code {}", code),
            (None, false) => format!("terminated by signal: {}", detail),
            (None, true) => "terminated by signal".to_string(),
        }
    }
}

/// Capability interface for running external tools.
pub trait ToolRunner {
    /// Run the tool to completion, capturing stdout/stderr.
    ///
    /// Returns `Err` only for fatal conditions (cancellation); tool-level
    /// failures come back as an unsuccessful [`ExitResult`].
    fn run(&self, inv: &Invocation, cancel: &CancelFlag, timeout: Duration) -> Result<ExitResult>;

    /// Whether `tool` can be invoked on this host. Preflight and the
    /// per-tool extraction fallbacks consult availability through the same
    /// seam as [`ToolRunner::run`], so a substitute runner controls both.
    fn is_available(&self, tool: &str) -> bool;
}

/// Poll interval while waiting on a child process.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// [`ToolRunner`] backed by real child processes.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for SystemRunner {
    fn is_available(&self, tool: &str) -> bool {
        crate::preflight::command_exists(tool)
    }

    fn run(&self, inv: &Invocation, cancel: &CancelFlag, timeout: Duration) -> Result<ExitResult> {
        cancel.check()?;

        let mut child = match Command::new(&inv.tool)
            .args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return Ok(ExitResult {
                    code: None,
                    success: false,
                    stdout: String::new(),
                    stderr: format!("failed to start '{}': {}", inv.tool, e),
                });
            }
        };

        // Drain pipes on threads so a chatty tool can't deadlock on a full
        // pipe buffer while we poll for exit.
        let stdout_handle = child.stdout.take().map(spawn_reader);
        let stderr_handle = child.stderr.take().map(spawn_reader);

        let started = Instant::now();
        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PatchError::Cancelled.into());
            }
            if started.elapsed() > timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ExitResult {
                    code: None,
                    success: false,
                    stdout: join_reader(stdout_handle),
                    stderr: format!(
                        "'{}' timed out after {}s",
                        inv.tool,
                        timeout.as_secs()
                    ),
                });
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(WAIT_POLL),
            }
        };

        Ok(ExitResult {
            code: status.code(),
            success: status.success(),
            stdout: join_reader(stdout_handle),
            stderr: join_reader(stderr_handle),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = source.read_to_string(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
