//! Progress events pushed to the client while a workflow runs.
//!
//! Every event is a `{type, message}` pair. The HTTP layer wraps them with a
//! sequence number and timestamp before they go on the wire.

use serde::{Deserialize, Serialize};

// ── Event kinds ──

/// Event type. Serialized as snake_case (`"info"`, `"output"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Progress narration: step boundaries, working-directory notices.
    Info,
    /// A line of raw process output.
    Output,
    /// A failure notice.
    Error,
    /// A positive milestone.
    Success,
    /// The extracted verification result URL.
    Url,
    /// Workflow-level terminal status.
    Status,
    /// Last event of every run.
    Complete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Info => "info",
            EventKind::Output => "output",
            EventKind::Error => "error",
            EventKind::Success => "success",
            EventKind::Url => "url",
            EventKind::Status => "status",
            EventKind::Complete => "complete",
        }
    }
}

/// One event on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventKind::Info, message)
    }

    pub fn output(message: impl Into<String>) -> Self {
        Self::new(EventKind::Output, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(EventKind::Success, message)
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(EventKind::Url, url)
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::new(EventKind::Status, message)
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(EventKind::Complete, message)
    }

    pub fn is_complete(&self) -> bool {
        self.kind == EventKind::Complete
    }
}
