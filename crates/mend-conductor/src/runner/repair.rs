use crate::event::ProgressEvent;
use crate::output::mask_secrets;
use crate::process::{ProcessKind, ProcessSpec};
use crate::runner::StepContext;
use serde::{Deserialize, Serialize};

/// One unit of repair work: a failed rule and the analysis of why it fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub label: String,
    pub detail: String,
}

impl WorkItem {
    pub fn new(label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            detail: detail.into(),
        }
    }
}

/// Hand every item to the agent, one at a time, in order.
///
/// A failed item is reported and the loop moves on. The abort flag is checked
/// before each item; once set, no further item starts. Returns one success
/// flag per item that was attempted.
pub async fn run_items(ctx: &StepContext<'_>, items: &[WorkItem], base_prompt: &str) -> Vec<bool> {
    let total = items.len();
    let mut results = Vec::with_capacity(total);

    for (index, item) in items.iter().enumerate() {
        let n = index + 1;
        if ctx.state.abort_requested() {
            tracing::info!(item = n, "abort requested, stopping repair loop");
            ctx.sink.emit(ProgressEvent::info(format!(
                "abort requested; {} item(s) not started",
                total - index
            )));
            break;
        }

        ctx.sink
            .emit(ProgressEvent::info(format!("[start {n}/{total}] {}", item.label)));
        tracing::info!(item = n, total, label = %item.label, "repair step started");

        let spec = ProcessSpec {
            kind: ProcessKind::Agent,
            program: ctx.config.agent.program.clone(),
            args: ctx.config.agent_args(&build_prompt(base_prompt, item)),
            cwd: ctx.cwd.map(|p| p.to_path_buf()),
        };
        let outcome = ctx.runner.run(&spec, ctx.sink, ctx.state.abort_flag()).await;

        if outcome.success {
            ctx.sink.emit(ProgressEvent::success(format!(
                "[done {n}/{total}] {}: fixed",
                item.label
            )));
            if let Some(answer) = ctx.extractor.extract(&outcome.stdout) {
                ctx.sink.emit(ProgressEvent::info(format!(
                    "agent answer: {}",
                    mask_secrets(&answer)
                )));
            }
        } else {
            ctx.sink.emit(ProgressEvent::error(format!(
                "[done {n}/{total}] {}: failed ({})",
                item.label,
                outcome.describe()
            )));
        }
        tracing::info!(item = n, success = outcome.success, "repair step finished");
        results.push(outcome.success);

        if let Some(next) = items.get(index + 1) {
            ctx.sink.emit(ProgressEvent::info(format!(
                "[next {}/{total}] {}",
                n + 1,
                next.label
            )));
        }
    }

    results
}

/// Instruction for one item: the shared base followed by the rule section.
pub fn build_prompt(base_prompt: &str, item: &WorkItem) -> String {
    let base = base_prompt.trim_end();
    let section = format!("## Rule: {}\n\n{}", item.label, item.detail.trim());
    if base.is_empty() {
        section
    } else {
        format!("{base}\n\n{section}")
    }
}
