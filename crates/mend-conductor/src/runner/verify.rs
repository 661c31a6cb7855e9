use crate::config::resolve_in;
use crate::event::ProgressEvent;
use crate::output::classify::Classification;
use crate::output::{masked_tail, prompt_tail};
use crate::process::{ProcessKind, ProcessSpec};
use crate::runner::repair::{run_items, WorkItem};
use crate::runner::StepContext;
use std::path::Path;

/// How the verification phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Succeeded(String),
    Skipped,
    Aborted,
    FailedNonSyntax,
}

/// Rerun the verifier until it reports a result URL, fails for a reason
/// other than syntax, or the user aborts. Syntax failures are handed to the
/// agent as a single synthetic repair item before the next attempt.
///
/// `config_path` is resolved against the working directory; an empty path
/// is treated as absent.
pub async fn run_verification(ctx: &StepContext<'_>, config_path: Option<&Path>) -> VerifyOutcome {
    let Some(config_path) = config_path.filter(|p| !p.as_os_str().is_empty()) else {
        ctx.sink
            .emit(ProgressEvent::info("no verifier config given; skipping verification"));
        return VerifyOutcome::Skipped;
    };
    let config_path = resolve_in(ctx.cwd, config_path);
    let cfg = ctx.config;
    let mut attempt = 0u32;

    while !ctx.state.abort_requested() {
        attempt += 1;
        ctx.sink.emit(ProgressEvent::info(format!(
            "[verify {attempt}] running {} on {}",
            cfg.verifier.program,
            config_path.display()
        )));
        tracing::info!(attempt, config = %config_path.display(), "verification attempt");

        let spec = ProcessSpec {
            kind: ProcessKind::Verifier,
            program: cfg.verifier.program.clone(),
            args: cfg.verifier_args(&config_path),
            cwd: ctx.cwd.map(|p| p.to_path_buf()),
        };
        let outcome = ctx.runner.run(&spec, ctx.sink, ctx.state.abort_flag()).await;

        // A verifier killed by an abort leaves partial output; don't judge it.
        if ctx.state.abort_requested() {
            break;
        }

        let output = outcome.combined_output();
        match ctx.classifier.classify(&output) {
            Classification::Success { url } => {
                tracing::info!(attempt, %url, "verification produced a result");
                ctx.sink.emit(ProgressEvent::url(&url));
                ctx.sink.emit(ProgressEvent::success(format!(
                    "verification finished on attempt {attempt}"
                )));
                return VerifyOutcome::Succeeded(url);
            }
            Classification::SyntaxError => {
                tracing::info!(attempt, "syntax error, requesting a fix");
                ctx.sink.emit(ProgressEvent::error(format!(
                    "[verify {attempt}] syntax error in specification; asking the agent to fix it"
                )));
                let item = WorkItem::new(
                    format!("syntax fix (attempt {attempt})"),
                    format!(
                        "Verifier output:\n\n```\n{}\n```",
                        prompt_tail(&output, cfg.syntax_tail_chars)
                    ),
                );
                run_items(ctx, &[item], &cfg.syntax_fix_prompt).await;
            }
            Classification::OtherFailure => {
                tracing::warn!(attempt, reason = %outcome.describe(), "verification failed");
                ctx.sink.emit(ProgressEvent::error(format!(
                    "[verify {attempt}] verification failed ({}):\n{}",
                    outcome.describe(),
                    masked_tail(&output, cfg.failure_tail_chars)
                )));
                return VerifyOutcome::FailedNonSyntax;
            }
        }
    }

    ctx.sink
        .emit(ProgressEvent::info("abort requested; verification stopped"));
    VerifyOutcome::Aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::event::EventKind;
    use crate::output::answer::TranscriptAnswerExtractor;
    use crate::output::classify::OutputClassifier;
    use crate::process::{MockRunner, ProcessOutcome};
    use crate::runner::notify::CollectSink;
    use crate::state::SessionState;
    use std::path::PathBuf;
    use std::sync::Arc;

    const URL: &str = "https://prover.example.com/output/12345/abcdef?anonymousKey=k1";

    struct Fixture {
        config: WorkflowConfig,
        classifier: OutputClassifier,
        extractor: TranscriptAnswerExtractor,
        state: SessionState,
        sink: CollectSink,
    }

    impl Fixture {
        fn new() -> Self {
            let config = WorkflowConfig::default();
            Self {
                classifier: config.classifier().unwrap(),
                extractor: config.answer_extractor(),
                config,
                state: SessionState::new(),
                sink: CollectSink::new(),
            }
        }

        fn ctx<'a>(&'a self, runner: &'a MockRunner, cwd: Option<&'a Path>) -> StepContext<'a> {
            StepContext {
                runner,
                sink: &self.sink,
                state: &self.state,
                config: &self.config,
                classifier: &self.classifier,
                extractor: &self.extractor,
                cwd,
            }
        }
    }

    fn syntax_error() -> ProcessOutcome {
        ProcessOutcome::exited(1, "CRITICAL: Syntax error in spec file at line 12")
    }

    #[tokio::test]
    async fn no_config_skips() {
        let fx = Fixture::new();
        let runner = MockRunner::new();
        let outcome = run_verification(&fx.ctx(&runner, None), None).await;
        assert_eq!(outcome, VerifyOutcome::Skipped);

        let empty = PathBuf::new();
        let outcome = run_verification(&fx.ctx(&runner, None), Some(&empty)).await;
        assert_eq!(outcome, VerifyOutcome::Skipped);
        assert!(runner.calls().is_empty());
        assert!(fx.sink.messages()[0].contains("skipping verification"));
    }

    #[tokio::test]
    async fn syntax_errors_are_repaired_until_success() {
        let fx = Fixture::new();
        let runner = MockRunner::new().script(
            ProcessKind::Verifier,
            vec![
                syntax_error(),
                syntax_error(),
                ProcessOutcome::exited(0, format!("Job submitted.\nReport: {URL}\n")),
            ],
        );
        let conf = Path::new("run.conf");
        let outcome = run_verification(&fx.ctx(&runner, None), Some(conf)).await;

        assert_eq!(outcome, VerifyOutcome::Succeeded(URL.to_string()));
        assert_eq!(runner.calls_of(ProcessKind::Verifier), 3);
        assert_eq!(runner.calls_of(ProcessKind::Agent), 2);
        assert_eq!(fx.sink.of_kind(EventKind::Url), vec![URL]);

        // Each fix prompt carries the verifier output.
        let agent_calls: Vec<ProcessSpec> = runner
            .calls()
            .into_iter()
            .filter(|c| c.kind == ProcessKind::Agent)
            .collect();
        assert!(agent_calls[0].args[1].contains("Syntax error in spec file"));
        assert!(agent_calls[0].args[1].starts_with(&fx.config.syntax_fix_prompt));
    }

    #[tokio::test]
    async fn fix_prompt_keeps_verifier_text_verbatim() {
        let fx = Fixture::new();
        let runner = MockRunner::new().script(
            ProcessKind::Verifier,
            vec![
                ProcessOutcome::exited(1, "Syntax error: unexpected token=EOF near key=value"),
                ProcessOutcome::exited(0, format!("Report: {URL}")),
            ],
        );
        run_verification(&fx.ctx(&runner, None), Some(Path::new("run.conf"))).await;

        let prompt = runner
            .calls()
            .into_iter()
            .find(|c| c.kind == ProcessKind::Agent)
            .map(|c| c.args[1].clone())
            .unwrap();
        assert!(prompt.contains("unexpected token=EOF near key=value"));
    }

    #[tokio::test]
    async fn other_failure_stops_without_repair() {
        let fx = Fixture::new();
        let runner = MockRunner::new().script(
            ProcessKind::Verifier,
            vec![ProcessOutcome::exited(2, "ERROR: license server unreachable")],
        );
        let outcome = run_verification(&fx.ctx(&runner, None), Some(Path::new("a.conf"))).await;

        assert_eq!(outcome, VerifyOutcome::FailedNonSyntax);
        assert_eq!(runner.calls_of(ProcessKind::Agent), 0);
        let errors = fx.sink.of_kind(EventKind::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exit code 2"));
        assert!(errors[0].contains("license server unreachable"));
    }

    #[tokio::test]
    async fn failure_tail_is_bounded_and_masked() {
        let mut fx = Fixture::new();
        fx.config.failure_tail_chars = 40;
        let long = format!("{}\nfatal: token=abc123 rejected", "x".repeat(500));
        let runner =
            MockRunner::new().script(ProcessKind::Verifier, vec![ProcessOutcome::exited(1, long)]);
        run_verification(&fx.ctx(&runner, None), Some(Path::new("a.conf"))).await;

        let error = &fx.sink.of_kind(EventKind::Error)[0];
        assert!(error.contains("token=[MASKED]"));
        assert!(!error.contains("abc123"));
        assert!(!error.contains(&"x".repeat(100)));
    }

    #[tokio::test]
    async fn url_wins_over_syntax_marker() {
        let fx = Fixture::new();
        let output = format!("warning: parse error in comment ignored\n{URL}");
        let runner =
            MockRunner::new().script(ProcessKind::Verifier, vec![ProcessOutcome::exited(0, output)]);
        let outcome = run_verification(&fx.ctx(&runner, None), Some(Path::new("a.conf"))).await;

        assert_eq!(outcome, VerifyOutcome::Succeeded(URL.to_string()));
        assert_eq!(runner.calls_of(ProcessKind::Agent), 0);
    }

    #[tokio::test]
    async fn abort_during_verifier_is_not_classified() {
        let fx = Arc::new(Fixture::new());
        let runner = MockRunner::new().script(ProcessKind::Verifier, vec![syntax_error()]);
        {
            let fx = fx.clone();
            runner.on_run(move |_, _| fx.state.request_abort());
        }
        let outcome = run_verification(&fx.ctx(&runner, None), Some(Path::new("a.conf"))).await;

        assert_eq!(outcome, VerifyOutcome::Aborted);
        assert_eq!(runner.calls_of(ProcessKind::Agent), 0);
        assert_eq!(runner.calls_of(ProcessKind::Verifier), 1);
    }

    #[tokio::test]
    async fn abort_during_syntax_fix_stops_loop() {
        let fx = Arc::new(Fixture::new());
        let runner = MockRunner::new().script(ProcessKind::Verifier, vec![syntax_error()]);
        {
            let fx = fx.clone();
            runner.on_run(move |_, spec| {
                if spec.kind == ProcessKind::Agent {
                    fx.state.request_abort();
                }
            });
        }
        let outcome = run_verification(&fx.ctx(&runner, None), Some(Path::new("a.conf"))).await;

        assert_eq!(outcome, VerifyOutcome::Aborted);
        assert_eq!(runner.calls_of(ProcessKind::Verifier), 1);
    }

    #[tokio::test]
    async fn relative_config_resolved_against_working_dir() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new()
            .script(ProcessKind::Verifier, vec![ProcessOutcome::exited(0, URL)]);
        run_verification(&fx.ctx(&runner, Some(dir.path())), Some(Path::new("certora/run.conf")))
            .await;

        let call = &runner.calls()[0];
        let expected = dir.path().join("certora/run.conf");
        assert_eq!(call.args, vec![expected.display().to_string()]);
        assert_eq!(call.cwd.as_deref(), Some(dir.path()));
    }
}
