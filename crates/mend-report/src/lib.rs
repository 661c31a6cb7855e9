mod render;
mod tree;

pub use render::{render_failed, render_markdown, RuleAnalysis};
pub use tree::{failed_rules, load_rules, parse_rules, summarize, FailedRule, RuleNode, RuleStatus, RuleSummary};
