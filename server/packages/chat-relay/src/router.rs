use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chat_relay_error::{ErrorType, ProblemDetails, RelayError};
use chat_relay_protocol::{
    AbortRequest, AbortResponse, ChatRequest, LogEntry, ReportedStatus, RequestStatus,
    ResumeQuery, ResumeResponse, StatusResponse, NDJSON_CONTENT_TYPE,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::cancellation::CancellationCoordinator;
use crate::config::RelayConfig;
use crate::controller::{ControllerError, SessionController, StartedRun};
use crate::engine::Engine;
use crate::registry::RequestRegistry;
use crate::restore::{restore_from_disk, RestoreReport};
use crate::service::ResumeService;
use crate::stream_log::{StreamLog, StreamLogError};
use crate::sweeper::CleanupSweeper;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const IDLE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct AppState {
    registry: Arc<RequestRegistry>,
    coordinator: Arc<CancellationCoordinator>,
    log: StreamLog,
    controller: SessionController,
    resume: ResumeService,
}

impl AppState {
    pub fn new(
        registry: Arc<RequestRegistry>,
        log: StreamLog,
        engine: Arc<dyn Engine>,
        cancel_grace: Duration,
    ) -> Self {
        let coordinator = Arc::new(CancellationCoordinator::new());
        let controller = SessionController::new(
            registry.clone(),
            coordinator.clone(),
            log.clone(),
            engine,
            cancel_grace,
        );
        let resume = ResumeService::new(registry.clone(), log.clone());
        Self {
            registry,
            coordinator,
            log,
            controller,
            resume,
        }
    }

    /// Opens the log directory and re-registers whatever the previous
    /// process left there.
    pub async fn open(
        config: &RelayConfig,
        engine: Arc<dyn Engine>,
    ) -> Result<(Self, RestoreReport), StreamLogError> {
        let log = StreamLog::open(config.log_dir.clone()).await?;
        let registry = Arc::new(RequestRegistry::new());
        let report = restore_from_disk(&log, &registry).await?;
        Ok((Self::new(registry, log, engine, config.cancel_grace), report))
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<CancellationCoordinator> {
        &self.coordinator
    }

    pub fn log(&self) -> &StreamLog {
        &self.log
    }

    pub fn sweeper(&self, retention: Duration, interval: Duration) -> CleanupSweeper {
        CleanupSweeper::new(self.registry.clone(), self.log.clone(), retention, interval)
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_requests: usize,
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/chat", post(post_chat))
        .route("/status/:request_id", get(get_status))
        .route("/resume/:request_id", get(get_resume))
        .route("/abort", post(post_abort))
        .with_state(shared.clone());

    let mut router = Router::new()
        .nest("/v1", v1_router)
        .fallback(not_found);

    let http_logging = match std::env::var("CHAT_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Cancels every in-flight run and waits, up to `timeout`, for their
/// terminal entries to reach the log.
pub async fn shutdown_runs(state: &Arc<AppState>, timeout: Duration) {
    let cancelled = state.coordinator.cancel_all();
    if cancelled == 0 {
        return;
    }
    tracing::info!(cancelled, "cancelling in-flight requests");
    let deadline = tokio::time::Instant::now() + timeout;
    while state.coordinator.active_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                remaining = state.coordinator.active_count(),
                "requests still settling at shutdown"
            );
            return;
        }
        tokio::time::sleep(IDLE_POLL).await;
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_chat, get_status, get_resume, post_abort),
    components(
        schemas(
            HealthResponse,
            ChatRequest,
            StatusResponse,
            ReportedStatus,
            RequestStatus,
            ResumeQuery,
            ResumeResponse,
            AbortRequest,
            AbortResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "requests", description = "Streaming requests")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2470")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl From<StreamLogError> for ApiError {
    fn from(err: StreamLogError) -> Self {
        let relay = match err {
            StreamLogError::InvalidRequestId { .. } => RelayError::InvalidRequest {
                message: err.to_string(),
            },
            StreamLogError::AlreadyExists { request_id, .. } => {
                RelayError::DuplicateRequest { request_id }
            }
            other => RelayError::StorageFailure {
                request_id: None,
                message: other.to_string(),
            },
        };
        ApiError::Relay(relay)
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::DuplicateRequest { request_id } => {
                ApiError::Relay(RelayError::DuplicateRequest { request_id })
            }
            ControllerError::Log(err) => err.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = rejection.body_text();
        let relay = match rejection {
            JsonRejection::MissingJsonContentType(_) => {
                RelayError::UnsupportedMediaType { message }
            }
            _ => RelayError::InvalidRequest { message },
        };
        ApiError::Relay(relay)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(problem)).into_response()
    }
}

async fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "404 Not Found".to_string())
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_requests: state.coordinator.active_count(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "NDJSON stream of log entries, ending with a terminal entry"),
        (status = 400, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 415, body = ProblemDetails)
    ),
    tag = "requests"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let StartedRun {
        request_id, live, ..
    } = state.controller.start(request).await?;

    let body = Body::from_stream(UnboundedReceiverStream::new(live).map(|entry| encode_line(&entry)));
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}

fn encode_line(entry: &LogEntry) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

#[utoipa::path(
    get,
    path = "/v1/status/{request_id}",
    params(("request_id" = String, Path, description = "Request id")),
    responses((status = 200, body = StatusResponse)),
    tag = "requests"
)]
async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Json<StatusResponse> {
    Json(state.resume.status(&request_id).await)
}

#[utoipa::path(
    get,
    path = "/v1/resume/{request_id}",
    params(
        ("request_id" = String, Path, description = "Request id"),
        ("fromIndex" = Option<u64>, Query, description = "First index to return (inclusive)")
    ),
    responses(
        (status = 200, body = ResumeResponse),
        (status = 500, body = ProblemDetails)
    ),
    tag = "requests"
)]
async fn get_resume(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Query(query): Query<ResumeQuery>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let from_index = query.from_index.unwrap_or(0);
    let response = state
        .resume
        .resume(&request_id, from_index)
        .await
        .map_err(|err| {
            ApiError::Relay(RelayError::StorageFailure {
                request_id: Some(request_id.clone()),
                message: err.to_string(),
            })
        })?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/abort",
    request_body = AbortRequest,
    responses(
        (status = 200, body = AbortResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "requests"
)]
async fn post_abort(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AbortRequest>, JsonRejection>,
) -> Result<Json<AbortResponse>, ApiError> {
    let Json(request) = payload?;
    let aborted = state.coordinator.cancel(&request.request_id);
    tracing::info!(request_id = %request.request_id, aborted, "abort requested");
    Ok(Json(AbortResponse {
        request_id: request.request_id,
        aborted,
    }))
}
