use super::lines::pump_lines;
use super::{ProcessKind, ProcessOutcome, ProcessRunner, ProcessSpec};
use crate::event::ProgressEvent;
use crate::runner::notify::EventSink;
use crate::state::machine::lock;
use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// The process currently owned by a [`ProcessSupervisor`].
struct CurrentProcess {
    generation: u64,
    pid: Option<u32>,
    cancel: CancellationToken,
}

/// Launches real processes, each in its own process group, and tracks the
/// one that is currently running.
///
/// `kill_current` only signals the task that owns the child. That task sends
/// SIGTERM to the whole group, waits `grace`, then sends SIGKILL. The kill
/// therefore always targets the process it was aimed at, even if the slot
/// has since moved on.
pub struct ProcessSupervisor {
    grace: Duration,
    current: Mutex<Option<CurrentProcess>>,
    next_generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            current: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    fn register(&self, pid: Option<u32>, cancel: CancellationToken) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut current = lock(&self.current);
        if let Some(prev) = current.as_ref() {
            tracing::warn!(prev_pid = ?prev.pid, "replacing a process that is still current");
        }
        *current = Some(CurrentProcess {
            generation,
            pid,
            cancel,
        });
        generation
    }

    /// Clear the slot, but only if it still holds our generation.
    fn release(&self, generation: u64) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|c| c.generation == generation) {
            *current = None;
        }
    }

    fn command(spec: &ProcessSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        if spec.kind == ProcessKind::Agent {
            // Allow nesting: these markers stop the agent CLI from starting
            cmd.env_remove("CLAUDE_CODE").env_remove("CLAUDECODE");
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

#[async_trait::async_trait]
impl ProcessRunner for ProcessSupervisor {
    async fn run(&self, spec: &ProcessSpec, sink: &dyn EventSink, abort: &AtomicBool) -> ProcessOutcome {
        let mut child = match Self::command(spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to start {} `{}`: {e}", spec.kind.label(), spec.program);
                tracing::warn!(program = %spec.program, error = %e, "spawn failed");
                sink.emit(ProgressEvent::error(&msg));
                return ProcessOutcome::spawn_failed(msg);
            }
        };

        let pid = child.id();
        let cancel = CancellationToken::new();
        let generation = self.register(pid, cancel.clone());
        tracing::info!(kind = spec.kind.label(), ?pid, "process started");
        // An abort that landed between the caller's check and `register`
        // found no current process to kill.
        if abort.load(Ordering::SeqCst) {
            tracing::info!(?pid, "abort already requested, terminating");
            cancel.cancel();
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdout_text = String::new();
        let mut stderr_text = String::new();
        let (status, killed) = {
            let pumps = async {
                tokio::join!(
                    pump_lines(stdout, sink, &mut stdout_text),
                    pump_lines(stderr, sink, &mut stderr_text)
                )
            };
            tokio::pin!(pumps);
            let wait = wait_or_terminate(&mut child, pid, &cancel, self.grace);
            tokio::pin!(wait);

            // The step ends when the process exits, not when its pipes close:
            // a background descendant can hold them open indefinitely.
            let mut drained = false;
            let exit = loop {
                tokio::select! {
                    exit = &mut wait => break exit,
                    _ = &mut pumps, if !drained => drained = true,
                }
            };
            self.release(generation);
            if !drained {
                drain_leftovers(pumps, pid, self.grace).await;
            }
            exit
        };

        let mut outcome = ProcessOutcome {
            stdout: stdout_text,
            stderr: stderr_text,
            killed,
            ..Default::default()
        };
        match status {
            Ok(status) => {
                outcome.exit_code = status.code();
                outcome.success = status.success() && !killed;
                tracing::info!(kind = spec.kind.label(), ?pid, code = ?status.code(), killed, "process exited");
            }
            Err(e) => {
                let msg = format!("waiting for {} failed: {e}", spec.kind.label());
                tracing::warn!(?pid, error = %e, "wait failed");
                sink.emit(ProgressEvent::error(&msg));
            }
        }
        outcome
    }

    fn kill_current(&self) {
        match lock(&self.current).as_ref() {
            Some(current) => {
                tracing::info!(pid = ?current.pid, "terminating current process");
                current.cancel.cancel();
            }
            None => tracing::debug!("kill requested with no current process"),
        }
    }

    fn current_pid(&self) -> Option<u32> {
        lock(&self.current).as_ref().and_then(|c| c.pid)
    }
}

/// Wait for the child, or terminate its group once `cancel` fires.
/// Returns the exit status and whether termination was requested.
async fn wait_or_terminate(
    child: &mut Child,
    pid: Option<u32>,
    cancel: &CancellationToken,
    grace: Duration,
) -> (std::io::Result<ExitStatus>, bool) {
    tokio::select! {
        status = child.wait() => (status, false),
        _ = cancel.cancelled() => (terminate(child, pid, grace).await, true),
    }
}

/// The process has exited but its output is still open, so a descendant
/// inherited the pipes. Give it `grace` to finish, then signal what is left
/// of the group. Output still open after SIGKILL is abandoned.
async fn drain_leftovers<F: Future>(mut pumps: Pin<&mut F>, pid: Option<u32>, grace: Duration) {
    if tokio::time::timeout(grace, pumps.as_mut()).await.is_ok() {
        return;
    }
    for signal in [Signal::Term, Signal::Kill] {
        tracing::warn!(?pid, ?signal, "output still open after exit, signalling leftover processes");
        signal_leftovers(pid, signal);
        if tokio::time::timeout(grace, pumps.as_mut()).await.is_ok() {
            return;
        }
    }
    tracing::warn!(?pid, "output never closed, keeping what was read");
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> std::io::Result<ExitStatus> {
    signal_group(child, pid, Signal::Term);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(?pid, "grace period expired, sending SIGKILL");
            signal_group(child, pid, Signal::Kill);
            child.wait().await
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn signal_group(child: &mut Child, pid: Option<u32>, signal: Signal) {
    // A missing pid means the child was already reaped.
    if pid.is_some_and(|pid| !killpg(pid, signal)) {
        let _ = child.start_kill();
    }
}

/// Signal the group of an already reaped child. The group id stays reserved
/// while any member is alive, so this only reaches the leftovers.
fn signal_leftovers(pid: Option<u32>, signal: Signal) {
    if let Some(pid) = pid {
        killpg(pid, signal);
    }
}

#[cfg(unix)]
fn killpg(pid: u32, signal: Signal) -> bool {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory effects. `pid` is the id of the group
    // created by process_group(0).
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signo) };
    if rc != 0 {
        tracing::debug!(pid, ?signal, error = %std::io::Error::last_os_error(), "killpg failed");
    }
    rc == 0
}

#[cfg(not(unix))]
fn killpg(_pid: u32, _signal: Signal) -> bool {
    false
}
