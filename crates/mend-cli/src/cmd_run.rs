use anyhow::{bail, Context, Result};
use mend_conductor::runner::notify::{EventSink, StdoutSink};
use mend_conductor::{ProgressEvent, RunRequest, SessionController, TerminalStatus, WorkflowConfig};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

pub fn execute(request_path: &Path, config: Option<&Path>, json: bool) -> Result<()> {
    let request = read_request(request_path)?;
    let workflow = WorkflowConfig::load(config)?;
    let controller = Arc::new(SessionController::with_supervisor(workflow)?);

    // Ctrl+C aborts: no further step starts and the running process is killed
    ctrlc_abort(controller.clone());

    let sink: Box<dyn EventSink> = if json {
        Box::new(JsonLineSink)
    } else {
        Box::new(StdoutSink)
    };
    let rt = tokio::runtime::Runtime::new()?;
    let terminal = rt.block_on(controller.run(&request, sink.as_ref()))?;

    match terminal {
        TerminalStatus::CompletedWithUrl(_) | TerminalStatus::CompletedWithoutVerification => Ok(()),
        TerminalStatus::AbortedByUser => bail!("aborted"),
        TerminalStatus::CompletedWithNonSyntaxFailure => bail!("verification failed"),
        TerminalStatus::Errored(msg) => bail!("run failed: {msg}"),
    }
}

fn read_request(path: &Path) -> Result<RunRequest> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading run request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    parse_request(&content)
}

fn parse_request(content: &str) -> Result<RunRequest> {
    let request: RunRequest = serde_json::from_str(content).context("invalid run request")?;
    if request.items.is_empty() {
        bail!("run request has no items");
    }
    Ok(request)
}

fn ctrlc_abort(controller: Arc<SessionController>) {
    let _ = ctrlc::set_handler(move || {
        tracing::info!("interrupt received");
        controller.request_abort();
    });
}

/// One JSON object per event on stdout.
struct JsonLineSink;

impl EventSink for JsonLineSink {
    fn emit(&self, event: ProgressEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "event serialization failed"),
        }
    }
}
