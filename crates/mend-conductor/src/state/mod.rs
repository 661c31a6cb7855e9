pub mod machine;

pub use machine::{SessionState, WorkflowStatus};
