use crate::tree::FailedRule;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// An analysis written for one failing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAnalysis {
    pub rule: String,
    pub analysis: String,
}

/// Markdown report with one section per analysed rule.
pub fn render_markdown(title: &str, analyses: &[RuleAnalysis]) -> String {
    let title = match title.trim() {
        "" => "Rule analysis",
        t => t,
    };
    let mut out = format!("# {title}\n\n");
    if analyses.is_empty() {
        out.push_str("_No failing rules._\n");
        return out;
    }

    let _ = writeln!(out, "{} rule(s) analysed.\n", analyses.len());
    for (i, a) in analyses.iter().enumerate() {
        let _ = writeln!(out, "## {}. {}\n", i + 1, a.rule.trim());
        let body = a.analysis.trim();
        if body.is_empty() {
            out.push_str("_No analysis._\n\n");
        } else {
            out.push_str(body);
            out.push_str("\n\n");
        }
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

/// One line per failing rule, for terminal output.
pub fn render_failed(rules: &[FailedRule]) -> String {
    let width = rules
        .iter()
        .map(|r| r.status.as_str().len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for r in rules {
        let _ = write!(out, "{:<width$}  {}", r.status.as_str(), r.label());
        if let Some(msg) = r.message.as_deref().filter(|m| !m.trim().is_empty()) {
            let first = msg.lines().next().unwrap_or_default();
            let _ = write!(out, ": {first}");
        }
        out.push('\n');
    }
    out
}
