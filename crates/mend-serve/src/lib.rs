use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use mend_conductor::runner::notify::ChannelSink;
use mend_conductor::{ProgressEvent, RunRequest, SessionController, SessionError, SessionSnapshot};
use mend_report::{failed_rules, render_markdown, summarize, FailedRule, RuleAnalysis, RuleNode, RuleSummary};

// ── Config ──

pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7676,
        }
    }
}

impl ServeConfig {
    /// Defaults overridden by `MEND_HOST` / `MEND_PORT`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(host) = get("MEND_HOST").filter(|h| !h.trim().is_empty()) {
            config.bind = host;
        }
        if let Some(port) = get("MEND_PORT").filter(|p| !p.trim().is_empty()) {
            config.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid MEND_PORT {port:?}: {e}"))?;
        }
        Ok(config)
    }
}

// ── App State ──

struct AppState {
    controller: Arc<SessionController>,
}

// ── Error Handling ──

struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.error.to_string() });
        (self.status, Json(body)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

fn session_error(err: SessionError) -> AppError {
    let status = match err {
        SessionError::EmptyItems => StatusCode::BAD_REQUEST,
        SessionError::AlreadyRunning => StatusCode::CONFLICT,
        SessionError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    AppError {
        status,
        error: err.into(),
    }
}

// ── Entrypoint ──

pub async fn serve(controller: Arc<SessionController>, config: ServeConfig) -> anyhow::Result<()> {
    let app = router(controller.clone());

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "mend HTTP server listening");
    eprintln!("mend HTTP server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                controller.request_abort();
            }
        })
        .await?;
    Ok(())
}

/// Build the router (for testing without binding to a port).
pub fn router(controller: Arc<SessionController>) -> Router {
    let state = Arc::new(AppState { controller });
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/run", post(post_run))
        .route("/api/abort", post(post_abort))
        .route("/api/rules/failed", post(post_failed_rules))
        .route("/api/report", post(post_report))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

// ── GET /api/status ──

async fn get_status(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.controller.snapshot())
}

// ── POST /api/run ──

/// Wire form of a progress event: the event plus its position in the run.
#[derive(Serialize)]
struct WireEvent<'a> {
    seq: u64,
    ts: String,
    #[serde(flatten)]
    event: &'a ProgressEvent,
}

async fn post_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Response, AppError> {
    let controller = state.controller.clone();
    let run_id = controller.begin(&request).map_err(session_error)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let done = CancellationToken::new();

    tokio::spawn(watch_disconnect(controller.clone(), tx.clone(), done.clone()));
    tokio::spawn(drive_run(controller, run_id, request, tx, done.clone()));

    let stream = event_stream(rx, done);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

/// Execute the run on its own task so a panic still closes it properly.
async fn drive_run(
    controller: Arc<SessionController>,
    run_id: String,
    request: RunRequest,
    tx: UnboundedSender<ProgressEvent>,
    done: CancellationToken,
) {
    let task = {
        let controller = controller.clone();
        let run_id = run_id.clone();
        let sink = ChannelSink::new(tx.clone());
        tokio::spawn(async move { controller.execute(&run_id, &request, &sink).await })
    };
    if let Err(e) = task.await {
        tracing::error!(%run_id, error = %e, "run task failed");
        controller.fail(&run_id, &format!("internal error: {e}"), &ChannelSink::new(tx));
    }
    done.cancel();
}

/// Terminate the current process when the client goes away. The run itself
/// keeps going; it ends on its own or through an explicit abort.
async fn watch_disconnect(
    controller: Arc<SessionController>,
    tx: UnboundedSender<ProgressEvent>,
    done: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = done.cancelled() => {}
        _ = tx.closed() => controller.client_disconnected(),
    }
}

/// SSE stream of one run. Ends right after the `complete` event.
fn event_stream(
    mut rx: UnboundedReceiver<ProgressEvent>,
    done: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut seq = 0u64;
        while let Some(event) = rx.recv().await {
            let last = event.is_complete();
            if last {
                // Closing the stream after this is not a disconnect.
                done.cancel();
            }
            yield Ok(to_sse(seq, &event));
            seq += 1;
            if last {
                break;
            }
        }
    }
}

fn to_sse(seq: u64, event: &ProgressEvent) -> Event {
    let wire = WireEvent {
        seq,
        ts: now_rfc3339(),
        event,
    };
    match Event::default().event(event.kind.as_str()).json_data(&wire) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::warn!(error = %e, "event serialization failed");
            Event::default()
                .event(event.kind.as_str())
                .data(event.message.as_str())
        }
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

// ── POST /api/abort ──

async fn post_abort(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let running = state.controller.request_abort();
    Json(serde_json::json!({ "ok": true, "running": running }))
}

// ── POST /api/rules/failed ──

#[derive(Deserialize)]
struct FailedRulesBody {
    rules: Vec<RuleNode>,
}

#[derive(Serialize)]
struct FailedRulesResponse {
    failed: Vec<FailedRule>,
    summary: RuleSummary,
}

async fn post_failed_rules(Json(body): Json<FailedRulesBody>) -> Json<FailedRulesResponse> {
    Json(FailedRulesResponse {
        failed: failed_rules(&body.rules),
        summary: summarize(&body.rules),
    })
}

// ── POST /api/report ──

#[derive(Deserialize)]
struct ReportBody {
    #[serde(default)]
    title: Option<String>,
    analyses: Vec<RuleAnalysis>,
}

async fn post_report(Json(body): Json<ReportBody>) -> Json<serde_json::Value> {
    let markdown = render_markdown(body.title.as_deref().unwrap_or_default(), &body.analyses);
    Json(serde_json::json!({ "markdown": markdown }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mend_conductor::process::{MockRunner, ProcessKind, ProcessOutcome};
    use mend_conductor::WorkflowConfig;
    use tower::ServiceExt;

    fn controller(runner: MockRunner) -> (Arc<SessionController>, Arc<MockRunner>) {
        let runner = Arc::new(runner);
        let ctl = SessionController::new(WorkflowConfig::default(), runner.clone()).unwrap();
        (Arc::new(ctl), runner)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// (event name, data json) pairs from an SSE body.
    fn parse_sse(text: &str) -> Vec<(String, serde_json::Value)> {
        text.split("\n\n")
            .filter_map(|frame| {
                let mut name = None;
                let mut data = None;
                for line in frame.lines() {
                    if let Some(v) = line.strip_prefix("event: ") {
                        name = Some(v.to_string());
                    } else if let Some(v) = line.strip_prefix("data: ") {
                        data = serde_json::from_str(v).ok();
                    }
                }
                Some((name?, data?))
            })
            .collect()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (ctl, _) = controller(MockRunner::new());
        let app = router(ctl);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["ok"], true);
    }

    #[tokio::test]
    async fn status_when_idle() {
        let (ctl, _) = controller(MockRunner::new());
        let app = router(ctl);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "idle");
        assert_eq!(json["running"], false);
        assert!(json["run_id"].is_null());
    }

    #[tokio::test]
    async fn run_with_no_items_is_bad_request() {
        let (ctl, runner) = controller(MockRunner::new());
        let app = router(ctl);

        let resp = app
            .oneshot(post_json(
                "/api/run",
                serde_json::json!({ "basePrompt": "fix", "items": [] }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("no work items"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn run_while_busy_is_conflict() {
        let (ctl, _) = controller(MockRunner::new());
        let busy = RunRequest {
            items: vec![mend_conductor::RequestItem {
                text: "x".into(),
                rule_name: None,
            }],
            ..Default::default()
        };
        ctl.begin(&busy).unwrap();
        let app = router(ctl);

        let resp = app
            .oneshot(post_json(
                "/api/run",
                serde_json::json!({ "basePrompt": "fix", "items": [{ "text": "a" }] }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn run_streams_events_until_complete() {
        let url = "https://prover.example.com/output/1/2?anonymousKey=z";
        let (ctl, runner) = controller(
            MockRunner::new().script(ProcessKind::Verifier, vec![ProcessOutcome::exited(0, url)]),
        );
        let app = router(ctl.clone());

        let resp = app
            .oneshot(post_json(
                "/api/run",
                serde_json::json!({
                    "basePrompt": "Fix the rule.",
                    "items": [
                        { "text": "analysis A", "ruleName": "A" },
                        { "text": "analysis B", "ruleName": "B" }
                    ],
                    "confPath": "run.conf"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let events = parse_sse(&String::from_utf8_lossy(&body));

        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names.first(), Some(&"info"));
        assert_eq!(names.last(), Some(&"complete"));
        assert_eq!(names.iter().filter(|n| **n == "complete").count(), 1);
        assert!(names.contains(&"url"));
        for (i, (name, data)) in events.iter().enumerate() {
            assert_eq!(data["seq"], i as u64);
            assert_eq!(data["type"], name.as_str());
            assert!(data["ts"].is_string());
        }
        assert_eq!(events[0].1["message"], "[start 1/2] A");
        assert_eq!(runner.calls().len(), 3);
        assert!(!ctl.state().is_running());
    }

    #[tokio::test]
    async fn abort_reports_running_flag() {
        let (ctl, runner) = controller(MockRunner::new());
        let app = router(ctl.clone());

        let resp = app
            .oneshot(post_json("/api/abort", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["running"], false);
        assert!(ctl.state().abort_requested());
        assert_eq!(runner.kill_count(), 1);
    }

    #[tokio::test]
    async fn dropped_stream_kills_current_process() {
        let (ctl, runner) = controller(MockRunner::new());
        let (tx, rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let done = CancellationToken::new();
        let watcher = tokio::spawn(watch_disconnect(ctl.clone(), tx, done));

        drop(rx);
        watcher.await.unwrap();
        assert_eq!(runner.kill_count(), 1);
        assert!(!ctl.state().abort_requested());
    }

    #[tokio::test]
    async fn finished_run_is_not_a_disconnect() {
        let (ctl, runner) = controller(MockRunner::new());
        let (tx, rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let done = CancellationToken::new();
        let watcher = tokio::spawn(watch_disconnect(ctl, tx, done.clone()));

        done.cancel();
        drop(rx);
        watcher.await.unwrap();
        assert_eq!(runner.kill_count(), 0);
    }

    #[tokio::test]
    async fn failed_rules_and_summary() {
        let (ctl, _) = controller(MockRunner::new());
        let app = router(ctl);

        let resp = app
            .oneshot(post_json(
                "/api/rules/failed",
                serde_json::json!({
                    "rules": [
                        { "name": "transfer", "status": "violated", "children": [
                            { "name": "toSelf", "status": "violated", "message": "balance drift" },
                            { "name": "toOther", "status": "verified" }
                        ]},
                        { "name": "mint", "status": "verified" }
                    ]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let failed = json["failed"].as_array().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["path"], serde_json::json!(["transfer", "toSelf"]));
        assert_eq!(failed[0]["status"], "violated");
        assert_eq!(json["summary"]["total"], 3);
        assert_eq!(json["summary"]["verified"], 2);
    }

    #[tokio::test]
    async fn report_renders_markdown() {
        let (ctl, _) = controller(MockRunner::new());
        let app = router(ctl);

        let resp = app
            .oneshot(post_json(
                "/api/report",
                serde_json::json!({
                    "title": "Audit",
                    "analyses": [{ "rule": "transfer", "analysis": "Off by one." }]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let md = body_json(resp).await["markdown"].as_str().unwrap().to_string();
        assert!(md.starts_with("# Audit\n"));
        assert!(md.contains("## 1. transfer"));
        assert!(md.contains("Off by one."));
    }

    #[test]
    fn serve_config_env_overrides() {
        let cfg = ServeConfig::from_lookup(|key| match key {
            "MEND_HOST" => Some("0.0.0.0".into()),
            "MEND_PORT" => Some("9000".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.port, 9000);

        let cfg = ServeConfig::from_lookup(|_| None).unwrap();
        assert_eq!((cfg.bind.as_str(), cfg.port), ("127.0.0.1", 7676));

        assert!(ServeConfig::from_lookup(|k| (k == "MEND_PORT").then(|| "http".into())).is_err());
    }
}
