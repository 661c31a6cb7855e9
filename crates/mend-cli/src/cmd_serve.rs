use anyhow::Result;
use mend_conductor::{SessionController, WorkflowConfig};
use mend_serve::ServeConfig;
use std::path::Path;
use std::sync::Arc;

pub fn execute(bind: Option<String>, port: Option<u16>, config: Option<&Path>) -> Result<()> {
    let mut serve_config = ServeConfig::from_env()?;
    if let Some(bind) = bind {
        serve_config.bind = bind;
    }
    if let Some(port) = port {
        serve_config.port = port;
    }

    let workflow = WorkflowConfig::load(config)?;
    let controller = Arc::new(SessionController::with_supervisor(workflow)?);

    tokio::runtime::Runtime::new()?.block_on(mend_serve::serve(controller, serve_config))
}
