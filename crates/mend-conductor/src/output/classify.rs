use anyhow::{Context, Result};
use regex::Regex;

/// Default result-URL pattern: `[scheme://]host/output/<id>[?query]`.
pub const DEFAULT_RESULT_URL_PATTERN: &str =
    r"(?i)(?:https?://)?[a-z0-9][a-z0-9.\-]*\.[a-z]{2,}(?::\d+)?/output/[a-z0-9/_\-]*[a-z0-9](?:\?[a-z0-9=&_\-]+)?";

/// Default substrings (lowercase) that mark a parse/compile/syntax failure.
pub const DEFAULT_SYNTAX_MARKERS: &[&str] = &[
    "syntax error",
    "syntaxerror",
    "parse error",
    "parsing error",
    "failed to parse",
    "compilation error",
    "compile error",
    "failed to compile",
    "unexpected token",
    "type check",
    "typecheck",
];

/// Outcome of one verifier invocation, derived from its combined output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success { url: String },
    SyntaxError,
    OtherFailure,
}

/// Decides whether verifier output means success, a retryable syntax
/// failure, or anything else. A result URL always wins.
#[derive(Debug, Clone)]
pub struct OutputClassifier {
    url_pattern: Regex,
    syntax_markers: Vec<String>,
}

impl OutputClassifier {
    pub fn new(url_pattern: &str, syntax_markers: &[String]) -> Result<Self> {
        let url_pattern = Regex::new(&format!("(?i){url_pattern}"))
            .with_context(|| format!("invalid result URL pattern: {url_pattern}"))?;
        Ok(Self {
            url_pattern,
            syntax_markers: syntax_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        })
    }

    pub fn classify(&self, output: &str) -> Classification {
        if let Some(url) = self.find_result_url(output) {
            return Classification::Success { url };
        }
        if self.has_syntax_error(output) {
            Classification::SyntaxError
        } else {
            Classification::OtherFailure
        }
    }

    /// Last result URL in the text. Later output supersedes earlier output.
    pub fn find_result_url(&self, output: &str) -> Option<String> {
        self.url_pattern
            .find_iter(output)
            .last()
            .map(|m| m.as_str().to_string())
    }

    pub fn has_syntax_error(&self, output: &str) -> bool {
        let lower = output.to_lowercase();
        self.syntax_markers.iter().any(|m| lower.contains(m.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_classifier() -> OutputClassifier {
        let markers: Vec<String> = DEFAULT_SYNTAX_MARKERS.iter().map(|m| m.to_string()).collect();
        OutputClassifier::new(DEFAULT_RESULT_URL_PATTERN, &markers).unwrap()
    }

    #[test]
    fn url_wins_over_syntax_marker() {
        let c = default_classifier();
        let text = "...prover.example.com/output/abc123...\nSyntaxError: unexpected token";
        match c.classify(text) {
            Classification::Success { url } => assert!(url.ends_with("abc123"), "{url}"),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn last_url_wins() {
        let c = default_classifier();
        let text = "Job submitted: https://prover.example.com/output/111/aaa\n\
                    retrying...\n\
                    Job submitted: https://prover.example.com/output/222/bbb?anonymousKey=k1\n";
        assert_eq!(
            c.find_result_url(text).as_deref(),
            Some("https://prover.example.com/output/222/bbb?anonymousKey=k1")
        );
    }

    #[test]
    fn url_match_is_case_insensitive() {
        let c = default_classifier();
        let r = c.classify("see HTTPS://Prover.Example.COM/OUTPUT/42/Xyz for details");
        assert!(matches!(r, Classification::Success { .. }));
    }

    #[test]
    fn syntax_error_detected_case_insensitive() {
        let c = default_classifier();
        assert_eq!(
            c.classify("CVL specification: Syntax Error at line 12"),
            Classification::SyntaxError
        );
        assert_eq!(
            c.classify("Failed to Compile contract Vault.sol"),
            Classification::SyntaxError
        );
    }

    #[test]
    fn other_failure_when_nothing_matches() {
        let c = default_classifier();
        assert_eq!(
            c.classify("rule invariant_total violated\nprover timed out"),
            Classification::OtherFailure
        );
        assert_eq!(c.classify(""), Classification::OtherFailure);
    }

    #[test]
    fn custom_markers_replace_defaults() {
        let c = OutputClassifier::new(
            r"results\.local/run/\d+",
            &["  BAD GRAMMAR ".to_string(), String::new()],
        )
        .unwrap();
        assert_eq!(c.classify("bad grammar near `}`"), Classification::SyntaxError);
        assert_eq!(c.classify("syntax error"), Classification::OtherFailure);
        assert_eq!(
            c.classify("done: results.local/run/77"),
            Classification::Success {
                url: "results.local/run/77".into()
            }
        );
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let err = OutputClassifier::new("(unclosed", &[]).unwrap_err();
        assert!(err.to_string().contains("invalid result URL pattern"));
    }
}
