//! Workflow configuration: which programs to run and the heuristics used to
//! judge their output. Every field has a default, so an empty file is valid.

use crate::output::answer::TranscriptAnswerExtractor;
use crate::output::classify::{OutputClassifier, DEFAULT_RESULT_URL_PATTERN, DEFAULT_SYNTAX_MARKERS};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by the synthesized instruction in agent args.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";
/// Placeholder replaced by the verifier config path in verifier args.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// A program plus an argument template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    /// Substitute `placeholder` with `value` in every argument. When no
    /// argument mentions the placeholder, `value` is appended instead.
    pub fn render(&self, placeholder: &str, value: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(placeholder, value))
            .collect();
        if !self.args.iter().any(|a| a.contains(placeholder)) {
            args.push(value.to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// The analysis/fix agent. `{prompt}` receives the instruction.
    pub agent: CommandTemplate,
    /// The verification runner. `{config}` receives the config path.
    pub verifier: CommandTemplate,
    /// Grace window between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// How much trailing verifier output goes into a syntax-fix instruction.
    pub syntax_tail_chars: usize,
    /// How much trailing verifier output accompanies a non-syntax failure.
    pub failure_tail_chars: usize,
    /// Character budget for the extracted agent answer.
    pub answer_max_chars: usize,
    pub result_url_pattern: String,
    pub syntax_markers: Vec<String>,
    /// Base instruction for syntax-fix items.
    pub syntax_fix_prompt: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            agent: CommandTemplate {
                program: "claude".into(),
                args: vec![
                    "-p".into(),
                    PROMPT_PLACEHOLDER.into(),
                    "--permission-mode".into(),
                    "acceptEdits".into(),
                ],
            },
            verifier: CommandTemplate {
                program: "certoraRun".into(),
                args: vec![CONFIG_PLACEHOLDER.into()],
            },
            kill_grace_ms: 1500,
            syntax_tail_chars: 9000,
            failure_tail_chars: 2000,
            answer_max_chars: 600,
            result_url_pattern: DEFAULT_RESULT_URL_PATTERN.into(),
            syntax_markers: DEFAULT_SYNTAX_MARKERS.iter().map(|m| m.to_string()).collect(),
            syntax_fix_prompt: "The verifier rejected the specification or configuration \
                                before running any rule. Fix the syntax, type, or compilation \
                                errors shown below. Change only what is needed to make the \
                                files parse and compile; do not weaken any rule."
                .into(),
        }
    }
}

impl WorkflowConfig {
    /// Load from a YAML (or JSON) file, or defaults when `path` is `None`.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading {}", p.display()))?;
                Self::parse(&content).with_context(|| format!("loading {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML/JSON document. An empty document yields the defaults.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(content).context("invalid workflow config")?;
        config.validate()?;
        Ok(config)
    }

    /// `MEND_AGENT_BIN` / `MEND_VERIFIER_BIN` replace the program names.
    pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(bin) = get("MEND_AGENT_BIN").filter(|b| !b.trim().is_empty()) {
            self.agent.program = bin;
        }
        if let Some(bin) = get("MEND_VERIFIER_BIN").filter(|b| !b.trim().is_empty()) {
            self.verifier.program = bin;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.program.trim().is_empty() {
            bail!("agent.program must not be empty");
        }
        if self.verifier.program.trim().is_empty() {
            bail!("verifier.program must not be empty");
        }
        if self.syntax_tail_chars == 0 {
            bail!("syntax_tail_chars must be greater than zero");
        }
        self.classifier()?;
        Ok(())
    }

    pub fn classifier(&self) -> Result<OutputClassifier> {
        OutputClassifier::new(&self.result_url_pattern, &self.syntax_markers)
    }

    pub fn answer_extractor(&self) -> TranscriptAnswerExtractor {
        TranscriptAnswerExtractor::new(self.answer_max_chars)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn agent_args(&self, prompt: &str) -> Vec<String> {
        self.agent.render(PROMPT_PLACEHOLDER, prompt)
    }

    pub fn verifier_args(&self, config_path: &Path) -> Vec<String> {
        self.verifier
            .render(CONFIG_PLACEHOLDER, &config_path.display().to_string())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yml::to_string(self).context("serializing workflow config")
    }
}

/// Resolve `path` against `cwd` when it is relative.
pub fn resolve_in(cwd: Option<&Path>, path: &Path) -> PathBuf {
    match cwd {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}
