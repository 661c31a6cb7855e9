use anyhow::{Context, Result};
use mend_conductor::WorkItem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ── Status ──

/// Verification status of one rule node, as reported by the prover UI.
///
/// Parsing is lenient: case, `-`/space separators and a few synonyms are
/// accepted; anything else becomes `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleStatus {
    Verified,
    Violated,
    Error,
    Timeout,
    SanityFailed,
    Running,
    Skipped,
    Unknown,
}

impl RuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleStatus::Verified => "verified",
            RuleStatus::Violated => "violated",
            RuleStatus::Error => "error",
            RuleStatus::Timeout => "timeout",
            RuleStatus::SanityFailed => "sanity_failed",
            RuleStatus::Running => "running",
            RuleStatus::Skipped => "skipped",
            RuleStatus::Unknown => "unknown",
        }
    }

    /// Statuses that need a repair.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RuleStatus::Violated | RuleStatus::Error | RuleStatus::Timeout | RuleStatus::SanityFailed
        )
    }
}

impl From<String> for RuleStatus {
    fn from(s: String) -> Self {
        let norm = s.trim().to_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "verified" | "passed" | "success" => RuleStatus::Verified,
            "violated" | "failed" | "failure" => RuleStatus::Violated,
            "error" => RuleStatus::Error,
            "timeout" | "timed_out" => RuleStatus::Timeout,
            "sanity_failed" | "sanity_fail" => RuleStatus::SanityFailed,
            "running" | "pending" => RuleStatus::Running,
            "skipped" => RuleStatus::Skipped,
            _ => RuleStatus::Unknown,
        }
    }
}

impl From<RuleStatus> for String {
    fn from(s: RuleStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tree ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleNode {
    pub name: String,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RuleNode>,
}

/// A failing rule, identified by its path from the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRule {
    pub path: Vec<String>,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FailedRule {
    pub fn label(&self) -> String {
        self.path.join(" / ")
    }

    pub fn to_work_item(&self) -> WorkItem {
        let mut detail = format!("Status: {}", self.status);
        if let Some(msg) = self.message.as_deref().filter(|m| !m.trim().is_empty()) {
            detail.push('\n');
            detail.push_str(msg.trim());
        }
        WorkItem::new(self.label(), detail)
    }
}

/// Failing rules in document order. Only the most specific failure of a
/// subtree is reported: a failing parent with failing descendants is
/// represented by those descendants.
pub fn failed_rules(roots: &[RuleNode]) -> Vec<FailedRule> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    for root in roots {
        collect_failed(root, &mut path, &mut out);
    }
    out
}

/// Returns whether anything in `node`'s subtree was reported.
fn collect_failed(node: &RuleNode, path: &mut Vec<String>, out: &mut Vec<FailedRule>) -> bool {
    path.push(node.name.clone());
    let mut reported = false;
    for child in &node.children {
        reported |= collect_failed(child, path, out);
    }
    if !reported && node.status.is_failure() {
        out.push(FailedRule {
            path: path.clone(),
            status: node.status,
            message: node.message.clone(),
        });
        reported = true;
    }
    path.pop();
    reported
}

/// Leaf counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub total: usize,
    pub verified: usize,
    pub violated: usize,
    pub error: usize,
    pub timeout: usize,
    pub sanity_failed: usize,
    pub running: usize,
    pub skipped: usize,
    pub unknown: usize,
}

impl RuleSummary {
    pub fn failed(&self) -> usize {
        self.violated + self.error + self.timeout + self.sanity_failed
    }

    fn count(&mut self, status: RuleStatus) {
        self.total += 1;
        let slot = match status {
            RuleStatus::Verified => &mut self.verified,
            RuleStatus::Violated => &mut self.violated,
            RuleStatus::Error => &mut self.error,
            RuleStatus::Timeout => &mut self.timeout,
            RuleStatus::SanityFailed => &mut self.sanity_failed,
            RuleStatus::Running => &mut self.running,
            RuleStatus::Skipped => &mut self.skipped,
            RuleStatus::Unknown => &mut self.unknown,
        };
        *slot += 1;
    }
}

pub fn summarize(roots: &[RuleNode]) -> RuleSummary {
    fn visit(node: &RuleNode, summary: &mut RuleSummary) {
        if node.children.is_empty() {
            summary.count(node.status);
        }
        for child in &node.children {
            visit(child, summary);
        }
    }
    let mut summary = RuleSummary::default();
    for root in roots {
        visit(root, &mut summary);
    }
    summary
}

// ── Loading ──

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleDocument {
    List(Vec<RuleNode>),
    Wrapped { rules: Vec<RuleNode> },
    Single(RuleNode),
}

/// Parse a rule tree: a JSON array of nodes, `{ "rules": [...] }`, or a
/// single root node.
pub fn parse_rules(content: &str) -> Result<Vec<RuleNode>> {
    let doc: RuleDocument = serde_json::from_str(content).context("invalid rule tree")?;
    Ok(match doc {
        RuleDocument::List(nodes) | RuleDocument::Wrapped { rules: nodes } => nodes,
        RuleDocument::Single(node) => vec![node],
    })
}

pub fn load_rules(path: &Path) -> Result<Vec<RuleNode>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_rules(&content).with_context(|| format!("loading {}", path.display()))
}
