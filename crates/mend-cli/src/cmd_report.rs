use anyhow::{Context, Result};
use mend_report::{render_markdown, RuleAnalysis};
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize)]
#[serde(untagged)]
enum AnalysesDocument {
    List(Vec<RuleAnalysis>),
    Titled {
        #[serde(default)]
        title: Option<String>,
        analyses: Vec<RuleAnalysis>,
    },
}

pub fn execute(path: &Path, title: Option<&str>) -> Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    print!("{}", render(&content, title)?);
    Ok(())
}

/// A `--title` flag wins over a title in the document.
fn render(content: &str, title: Option<&str>) -> Result<String> {
    let doc: AnalysesDocument = serde_json::from_str(content).context("invalid analyses file")?;
    let (doc_title, analyses) = match doc {
        AnalysesDocument::List(analyses) => (None, analyses),
        AnalysesDocument::Titled { title, analyses } => (title, analyses),
    };
    let title = title.or(doc_title.as_deref()).unwrap_or_default();
    Ok(render_markdown(title, &analyses))
}
