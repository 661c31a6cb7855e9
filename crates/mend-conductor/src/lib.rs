//! Repair-then-verify orchestration around an external fix agent and a
//! verification runner.
//!
//! The session controller ([`runner::session::SessionController`]) drives one
//! workflow at a time: every work item is handed to the agent in order, then
//! the verifier is rerun until it reports a result URL, fails for a
//! non-syntax reason, or the user aborts.

pub mod config;
pub mod event;
pub mod output;
pub mod process;
pub mod runner;
pub mod state;

pub use config::WorkflowConfig;
pub use event::{EventKind, ProgressEvent};
pub use runner::session::{
    RequestItem, RunRequest, SessionController, SessionError, SessionSnapshot, TerminalStatus,
    WorkItem,
};
