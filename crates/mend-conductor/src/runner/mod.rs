pub mod notify;
pub mod repair;
pub mod session;
pub mod verify;

use crate::config::WorkflowConfig;
use crate::output::answer::AnswerExtractor;
use crate::output::classify::OutputClassifier;
use crate::process::ProcessRunner;
use crate::runner::notify::EventSink;
use crate::state::SessionState;
use std::path::Path;

/// Everything a workflow step needs, borrowed for the duration of one run.
pub struct StepContext<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub sink: &'a dyn EventSink,
    pub state: &'a SessionState,
    pub config: &'a WorkflowConfig,
    pub classifier: &'a OutputClassifier,
    pub extractor: &'a dyn AnswerExtractor,
    /// Working directory for every spawned process; `None` inherits ours.
    pub cwd: Option<&'a Path>,
}
