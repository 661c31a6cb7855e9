use anyhow::Result;
use mend_conductor::{RequestItem, RunRequest};
use mend_report::{failed_rules, load_rules, render_failed, summarize, FailedRule};
use std::path::Path;

/// `base_prompt` set means "print a run request" instead of the list.
pub fn execute(tree: &Path, json: bool, base_prompt: Option<&str>) -> Result<()> {
    let roots = load_rules(tree)?;
    let failed = failed_rules(&roots);

    if let Some(base_prompt) = base_prompt {
        let request = build_request(&failed, base_prompt);
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    let summary = summarize(&roots);
    if json {
        let out = serde_json::json!({ "failed": failed, "summary": summary });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if failed.is_empty() {
        println!("No failing rules ({} checked).", summary.total);
        return Ok(());
    }
    print!("{}", render_failed(&failed));
    println!(
        "\n{} failing rule(s); {} of {} leaf rules failed.",
        failed.len(),
        summary.failed(),
        summary.total
    );
    Ok(())
}

fn build_request(failed: &[FailedRule], base_prompt: &str) -> RunRequest {
    RunRequest {
        base_prompt: base_prompt.to_string(),
        items: failed
            .iter()
            .map(|rule| {
                let item = rule.to_work_item();
                RequestItem {
                    text: item.detail,
                    rule_name: Some(item.label),
                }
            })
            .collect(),
        ..Default::default()
    }
}
