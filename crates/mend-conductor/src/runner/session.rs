use crate::config::WorkflowConfig;
use crate::event::ProgressEvent;
use crate::output::answer::AnswerExtractor;
use crate::output::classify::OutputClassifier;
use crate::process::{ProcessRunner, ProcessSupervisor};
use crate::runner::notify::EventSink;
use crate::runner::repair::run_items;
use crate::runner::verify::{run_verification, VerifyOutcome};
use crate::runner::StepContext;
use crate::state::{SessionState, WorkflowStatus};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;

pub use crate::runner::repair::WorkItem;

// ── Request ──

/// One submitted finding. `ruleName` becomes the item label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
}

/// Parameters for one workflow run, as posted by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub base_prompt: String,
    #[serde(default)]
    pub items: Vec<RequestItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_path: Option<PathBuf>,
}

impl RunRequest {
    /// Work items in submission order. Unnamed items are labelled by position.
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let label = item
                    .rule_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("item {}", i + 1));
                WorkItem::new(label, item.text.clone())
            })
            .collect()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        non_empty(self.project_path.as_deref())
    }

    /// Verifier config; an empty path means "skip verification".
    pub fn verifier_config(&self) -> Option<&Path> {
        non_empty(self.conf_path.as_deref())
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

// ── Errors and outcomes ──

/// Reasons a run is refused before it starts.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no work items submitted")]
    EmptyItems,
    #[error("a workflow is already running")]
    AlreadyRunning,
    #[error(transparent)]
    State(#[from] anyhow::Error),
}

/// How a run ended. Sent to the client as the `status` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TerminalStatus {
    AbortedByUser,
    CompletedWithUrl(String),
    CompletedWithoutVerification,
    CompletedWithNonSyntaxFailure,
    Errored(String),
}

impl TerminalStatus {
    pub fn message(&self) -> String {
        match self {
            TerminalStatus::AbortedByUser => "aborted by user".into(),
            TerminalStatus::CompletedWithUrl(url) => format!("completed; verification result: {url}"),
            TerminalStatus::CompletedWithoutVerification => "completed without verification".into(),
            TerminalStatus::CompletedWithNonSyntaxFailure => {
                "completed; verification failed for a non-syntax reason".into()
            }
            TerminalStatus::Errored(msg) => format!("errored: {msg}"),
        }
    }

    pub fn workflow_status(&self) -> WorkflowStatus {
        match self {
            TerminalStatus::AbortedByUser => WorkflowStatus::Aborted,
            TerminalStatus::Errored(_) => WorkflowStatus::Errored,
            _ => WorkflowStatus::Completed,
        }
    }
}

/// Point-in-time view of the session, for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: WorkflowStatus,
    pub running: bool,
    pub abort_requested: bool,
    pub current_pid: Option<u32>,
    pub run_id: Option<String>,
}

// ── Controller ──

/// Owns the single workflow slot and drives runs through it.
///
/// A run is split in two so the HTTP layer can refuse a request before it
/// opens the event stream: [`begin`](Self::begin) validates and claims the
/// slot, [`execute`](Self::execute) does the work and always releases it.
pub struct SessionController {
    state: SessionState,
    runner: Arc<dyn ProcessRunner>,
    config: WorkflowConfig,
    classifier: OutputClassifier,
    extractor: Box<dyn AnswerExtractor>,
}

impl SessionController {
    pub fn new(config: WorkflowConfig, runner: Arc<dyn ProcessRunner>) -> Result<Self> {
        let classifier = config.classifier()?;
        let extractor = Box::new(config.answer_extractor());
        Ok(Self {
            state: SessionState::new(),
            runner,
            config,
            classifier,
            extractor,
        })
    }

    /// Controller backed by real processes.
    pub fn with_supervisor(config: WorkflowConfig) -> Result<Self> {
        let runner = Arc::new(ProcessSupervisor::new(config.kill_grace()));
        Self::new(config, runner)
    }

    pub fn with_extractor(mut self, extractor: Box<dyn AnswerExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Validate `request` and claim the slot. Returns the new run id.
    pub fn begin(&self, request: &RunRequest) -> Result<String, SessionError> {
        if request.items.is_empty() {
            return Err(SessionError::EmptyItems);
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        if !self.state.begin(&run_id)? {
            return Err(SessionError::AlreadyRunning);
        }
        tracing::info!(%run_id, items = request.items.len(), "run started");
        Ok(run_id)
    }

    /// Run a claimed workflow to its end. Always emits the terminal `status`
    /// event followed by exactly one `complete`, and releases the slot.
    pub async fn execute(&self, run_id: &str, request: &RunRequest, sink: &dyn EventSink) -> TerminalStatus {
        let span = tracing::info_span!("run", %run_id);
        let terminal = match self.drive(request, sink).instrument(span).await {
            Ok(terminal) => terminal,
            Err(e) => {
                tracing::error!(%run_id, error = %e, "run failed");
                sink.emit(ProgressEvent::error(format!("{e:#}")));
                TerminalStatus::Errored(e.to_string())
            }
        };
        self.conclude(run_id, &terminal, sink);
        terminal
    }

    /// `begin` then `execute`.
    pub async fn run(&self, request: &RunRequest, sink: &dyn EventSink) -> Result<TerminalStatus, SessionError> {
        let run_id = self.begin(request)?;
        Ok(self.execute(&run_id, request, sink).await)
    }

    /// Close a claimed run that could not be executed (its task died).
    pub fn fail(&self, run_id: &str, message: &str, sink: &dyn EventSink) -> TerminalStatus {
        sink.emit(ProgressEvent::error(message));
        let terminal = TerminalStatus::Errored(message.to_string());
        self.conclude(run_id, &terminal, sink);
        terminal
    }

    /// User abort: no further step starts and the current process is
    /// terminated. Safe at any time. Returns whether a run is active.
    pub fn request_abort(&self) -> bool {
        let running = self.state.is_running();
        tracing::info!(running, "abort requested");
        self.state.request_abort();
        self.runner.kill_current();
        running
    }

    /// The client stopped listening. The current process is terminated but
    /// the workflow carries on with the next step.
    pub fn client_disconnected(&self) {
        tracing::info!("client disconnected; terminating current process");
        self.runner.kill_current();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.state.status(),
            running: self.state.is_running(),
            abort_requested: self.state.abort_requested(),
            current_pid: self.runner.current_pid(),
            run_id: self.state.run_id(),
        }
    }

    async fn drive(&self, request: &RunRequest, sink: &dyn EventSink) -> Result<TerminalStatus> {
        let cwd = request.working_dir();
        match cwd {
            Some(dir) if !dir.is_dir() => {
                bail!("working directory {} does not exist", dir.display())
            }
            Some(dir) => sink.emit(ProgressEvent::info(format!("working directory: {}", dir.display()))),
            None => {}
        }

        let ctx = StepContext {
            runner: self.runner.as_ref(),
            sink,
            state: &self.state,
            config: &self.config,
            classifier: &self.classifier,
            extractor: self.extractor.as_ref(),
            cwd,
        };

        run_items(&ctx, &request.work_items(), &request.base_prompt).await;
        if self.state.abort_requested() {
            return Ok(TerminalStatus::AbortedByUser);
        }

        Ok(match run_verification(&ctx, request.verifier_config()).await {
            VerifyOutcome::Succeeded(url) => TerminalStatus::CompletedWithUrl(url),
            VerifyOutcome::Skipped => TerminalStatus::CompletedWithoutVerification,
            VerifyOutcome::Aborted => TerminalStatus::AbortedByUser,
            VerifyOutcome::FailedNonSyntax => TerminalStatus::CompletedWithNonSyntaxFailure,
        })
    }

    fn conclude(&self, run_id: &str, terminal: &TerminalStatus, sink: &dyn EventSink) {
        if let Err(e) = self.state.finish(terminal.workflow_status()) {
            tracing::warn!(%run_id, error = %e, "status transition rejected");
        }
        tracing::info!(%run_id, status = ?terminal.workflow_status(), "run finished");
        sink.emit(ProgressEvent::status(terminal.message()));
        sink.emit(ProgressEvent::complete(run_id));
    }
}
