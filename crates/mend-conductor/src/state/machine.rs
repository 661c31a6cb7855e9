use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

// ── Status enum ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Idle,
    Running,
    Completed,
    Aborted,
    Errored,
}

// ── Valid transitions ──

const VALID_TRANSITIONS: &[(WorkflowStatus, &[WorkflowStatus])] = &[
    (WorkflowStatus::Idle, &[WorkflowStatus::Running]),
    (
        WorkflowStatus::Running,
        &[
            WorkflowStatus::Completed,
            WorkflowStatus::Aborted,
            WorkflowStatus::Errored,
        ],
    ),
    // A finished run is reset to Idle when the next one starts.
    (WorkflowStatus::Completed, &[WorkflowStatus::Idle]),
    (WorkflowStatus::Aborted, &[WorkflowStatus::Idle]),
    (WorkflowStatus::Errored, &[WorkflowStatus::Idle]),
];

fn is_valid_transition(from: WorkflowStatus, to: WorkflowStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

// ── Session state ──

/// Process-wide state of the single workflow slot.
///
/// `abort_requested` is monotonic within a run: once set it stays set until
/// the next run begins.
#[derive(Debug)]
pub struct SessionState {
    abort_requested: AtomicBool,
    running: AtomicBool,
    status: Mutex<WorkflowStatus>,
    run_id: Mutex<Option<String>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            abort_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            status: Mutex::new(WorkflowStatus::Idle),
            run_id: Mutex::new(None),
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// The raw flag, for process runners that must re-read it after spawning.
    pub fn abort_flag(&self) -> &AtomicBool {
        &self.abort_requested
    }

    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkflowStatus {
        *lock(&self.status)
    }

    pub fn run_id(&self) -> Option<String> {
        lock(&self.run_id).clone()
    }

    /// Claim the workflow slot. Returns `false` if another run holds it.
    /// Resets the abort flag before anything else observes the new run.
    pub fn begin(&self, run_id: &str) -> Result<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        self.abort_requested.store(false, Ordering::SeqCst);

        let mut status = lock(&self.status);
        let reset = if *status == WorkflowStatus::Idle {
            Ok(())
        } else {
            transition(&mut status, WorkflowStatus::Idle)
        };
        if let Err(e) = reset.and_then(|()| transition(&mut status, WorkflowStatus::Running)) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        *lock(&self.run_id) = Some(run_id.to_string());
        Ok(true)
    }

    /// Record the terminal status and release the slot.
    pub fn finish(&self, terminal: WorkflowStatus) -> Result<()> {
        let result = transition(&mut lock(&self.status), terminal);
        self.running.store(false, Ordering::SeqCst);
        result
    }
}

/// Apply a status transition, rejecting moves the lifecycle does not allow.
pub fn transition(current: &mut WorkflowStatus, to: WorkflowStatus) -> Result<()> {
    if !is_valid_transition(*current, to) {
        bail!("invalid workflow transition: {:?} → {:?}", current, to);
    }
    *current = to;
    Ok(())
}

/// Lock ignoring poison: the guarded values are plain data that a panicking
/// holder cannot leave half-written.
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
