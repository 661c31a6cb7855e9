pub mod lines;
pub mod mock;
pub mod supervisor;

use crate::runner::notify::EventSink;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

pub use mock::MockRunner;
pub use supervisor::ProcessSupervisor;

/// Which external collaborator a process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    Agent,
    Verifier,
}

impl ProcessKind {
    pub fn label(self) -> &'static str {
        match self {
            ProcessKind::Agent => "agent",
            ProcessKind::Verifier => "verifier",
        }
    }
}

/// Everything needed to launch one external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub kind: ProcessKind,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// How a process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit code 0 and no spawn-level error.
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The process was terminated through `kill_current`.
    pub killed: bool,
    pub spawn_error: Option<String>,
}

impl ProcessOutcome {
    pub fn exited(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            success: code == 0,
            exit_code: Some(code),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn spawn_failed(error: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(error.into()),
            ..Default::default()
        }
    }

    /// stdout followed by stderr: the text the classifier inspects.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end_matches('\n'), self.stderr),
        }
    }

    /// Short reason for a failure, e.g. `exit code 2`.
    pub fn describe(&self) -> String {
        if let Some(err) = &self.spawn_error {
            return format!("spawn error: {err}");
        }
        if self.killed {
            return "terminated".into();
        }
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".into(),
        }
    }
}

/// Runs external processes one at a time and can kill the current one.
///
/// Implemented by [`ProcessSupervisor`] (real processes) and [`MockRunner`]
/// (scripted outcomes for tests).
#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `spec` to completion, forwarding each output line to `sink`.
    /// Never fails: spawn errors resolve to an unsuccessful outcome.
    ///
    /// `abort` is re-read once the process is current. A set flag terminates
    /// it at once, which covers a `kill_current` that arrived while the
    /// process was still being spawned.
    async fn run(&self, spec: &ProcessSpec, sink: &dyn EventSink, abort: &AtomicBool) -> ProcessOutcome;

    /// Terminate the current process group, if any. Idempotent.
    fn kill_current(&self);

    /// Pid of the current process, if one is running.
    fn current_pid(&self) -> Option<u32>;
}
