use anyhow::Result;
use mend_conductor::WorkflowConfig;
use std::path::Path;

pub fn execute(config: Option<&Path>) -> Result<()> {
    let config = WorkflowConfig::load(config)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
