#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode};
use axum::Router;
use chat_relay::config::RelayConfig;
use chat_relay::engine::Engine;
use chat_relay::registry::RequestRegistry;
use chat_relay::restore::RestoreReport;
use chat_relay::router::{build_router_with_state, AppState};
use chat_relay::stream_log::StreamLog;
use chat_relay_protocol::LogEntry;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const CANCEL_GRACE: Duration = Duration::from_millis(500);

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub log_dir: TempDir,
}

impl TestApp {
    pub async fn new(engine: impl Engine) -> Self {
        let log_dir = tempfile::tempdir().expect("create temp log dir");
        let log = StreamLog::open(log_dir.path()).await.expect("open stream log");
        let state = AppState::new(
            Arc::new(RequestRegistry::new()),
            log,
            Arc::new(engine),
            CANCEL_GRACE,
        );
        let (app, state) = build_router_with_state(Arc::new(state));
        Self {
            app,
            state,
            log_dir,
        }
    }

    /// Starts over an existing log directory, the way a restarted server does.
    pub async fn reopen(log_dir: TempDir, engine: impl Engine) -> (Self, RestoreReport) {
        let config = RelayConfig {
            log_dir: log_dir.path().to_path_buf(),
            cancel_grace: CANCEL_GRACE,
            ..RelayConfig::default()
        };
        let (state, report) = AppState::open(&config, Arc::new(engine))
            .await
            .expect("open app state");
        let (app, state) = build_router_with_state(Arc::new(state));
        (
            Self {
                app,
                state,
                log_dir,
            },
            report,
        )
    }
}

pub fn chat_body(request_id: &str, message: &str) -> Value {
    json!({ "requestId": request_id, "message": message })
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

/// Posts a chat request and returns as soon as headers are available.
pub async fn start_chat(app: &Router, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    app.clone()
        .oneshot(request)
        .await
        .expect("request handled")
}

/// Reads an NDJSON body to its end.
pub async fn read_entries(response: Response<Body>) -> Vec<LogEntry> {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).expect("log entry line"))
        .collect()
}

pub async fn run_to_completion(app: &Router, request_id: &str, message: &str) -> Vec<LogEntry> {
    let response = start_chat(app, chat_body(request_id, message)).await;
    assert_eq!(response.status(), StatusCode::OK);
    read_entries(response).await
}
