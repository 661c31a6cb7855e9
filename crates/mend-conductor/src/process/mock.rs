use super::{ProcessKind, ProcessOutcome, ProcessRunner, ProcessSpec};
use crate::event::ProgressEvent;
use crate::runner::notify::EventSink;
use crate::state::machine::lock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

type Hook = Box<dyn Fn(usize, &ProcessSpec) + Send + Sync>;

/// Scripted runner for tests. Each kind pops outcomes from its own queue;
/// an exhausted queue yields a clean exit with no output.
///
/// Records every call, the peak number of overlapping runs, and how often
/// `kill_current` was called. A run that sees the abort flag set ends killed. A hook runs at the start of every call with
/// the call's index, which lets tests abort or disconnect mid-process.
#[derive(Default)]
pub struct MockRunner {
    scripts: Mutex<HashMap<ProcessKind, VecDeque<ProcessOutcome>>>,
    calls: Mutex<Vec<ProcessSpec>>,
    hook: Mutex<Option<Hook>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    kills: AtomicUsize,
    kill_pending: AtomicBool,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for `kind`, consumed in order.
    pub fn script(self, kind: ProcessKind, outcomes: Vec<ProcessOutcome>) -> Self {
        lock(&self.scripts)
            .entry(kind)
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn on_run(&self, hook: impl Fn(usize, &ProcessSpec) + Send + Sync + 'static) {
        *lock(&self.hook) = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<ProcessSpec> {
        lock(&self.calls).clone()
    }

    pub fn calls_of(&self, kind: ProcessKind) -> usize {
        lock(&self.calls).iter().filter(|c| c.kind == kind).count()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProcessRunner for MockRunner {
    async fn run(&self, spec: &ProcessSpec, sink: &dyn EventSink, abort: &AtomicBool) -> ProcessOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.kill_pending.store(false, Ordering::SeqCst);

        let index = {
            let mut calls = lock(&self.calls);
            calls.push(spec.clone());
            calls.len() - 1
        };
        if let Some(hook) = lock(&self.hook).as_ref() {
            hook(index, spec);
        }
        // Let other tasks observe the running process.
        tokio::task::yield_now().await;

        let mut outcome = lock(&self.scripts)
            .get_mut(&spec.kind)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| ProcessOutcome::exited(0, ""));
        for line in outcome.stdout.lines().chain(outcome.stderr.lines()) {
            sink.emit(ProgressEvent::output(line));
        }
        let killed = self.kill_pending.swap(false, Ordering::SeqCst);
        if killed || abort.load(Ordering::SeqCst) {
            outcome.killed = true;
            outcome.success = false;
            outcome.exit_code = None;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn kill_current(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.active.load(Ordering::SeqCst) > 0 {
            self.kill_pending.store(true, Ordering::SeqCst);
        }
    }

    fn current_pid(&self) -> Option<u32> {
        None
    }
}
