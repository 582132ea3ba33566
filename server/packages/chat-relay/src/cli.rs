use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chat_relay_client::client::DEFAULT_ENDPOINT;
use chat_relay_client::{ChatClient, ChatSession, ClientError, RetryPolicy, TurnError, TurnOutcome};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use chat_relay_protocol::{ChatRequest, LogEntry, RequestStatus};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{
    default_log_dir, RelayConfig, DEFAULT_CANCEL_GRACE_MS, DEFAULT_HOST, DEFAULT_PORT,
    DEFAULT_RETENTION_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
};
use crate::engine::{Engine, MockEngine, ProcessEngine, ProcessEngineConfig};
use crate::router::{build_router_with_state, shutdown_runs, AppState, REQUEST_ID_HEADER};
use crate::stream_log::StreamLogError;

const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "chat-relay", bin_name = "chat-relay")]
#[command(about = "Resumable, cancellable streaming requests", version)]
#[command(arg_required_else_help = true)]
pub struct ChatRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat-relay HTTP server.
    Server(ServerArgs),
    /// Send a message and print its entries as NDJSON, resuming after dropped connections.
    Chat(ChatArgs),
    /// Print the status of a request.
    Status(RequestArgs),
    /// Print the entries of a request from an index.
    Resume(ResumeArgs),
    /// Cancel an in-flight request.
    Abort(RequestArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Echo the prompt back word by word.
    Mock,
    /// Run an external command that prints one JSON value per line.
    Process,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "CHAT_RELAY_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "CHAT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "CHAT_RELAY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_RETENTION_SECS)]
    retention_secs: u64,

    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_CANCEL_GRACE_MS)]
    cancel_grace_ms: u64,

    #[arg(long, value_enum, default_value_t = EngineKind::Mock)]
    engine: EngineKind,

    #[arg(long)]
    engine_command: Option<PathBuf>,

    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_arg: Vec<String>,

    #[arg(long, default_value_t = 30)]
    mock_word_delay_ms: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

impl ServerArgs {
    fn config(&self) -> RelayConfig {
        RelayConfig {
            host: self.host.clone(),
            port: self.port,
            log_dir: self.log_dir.clone().unwrap_or_else(default_log_dir),
            retention: Duration::from_secs(self.retention_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
        }
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, short = 'e', env = "CHAT_RELAY_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[command(flatten)]
    client: ClientArgs,

    message: String,

    /// Defaults to a freshly generated id.
    #[arg(long)]
    request_id: Option<String>,

    #[arg(long)]
    session_id: Option<String>,

    #[arg(long = "allowed-tool")]
    allowed_tools: Vec<String>,

    #[arg(long)]
    working_directory: Option<String>,

    #[arg(long, default_value_t = chat_relay_client::backoff::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    #[arg(long, default_value_t = chat_relay_client::backoff::DEFAULT_INITIAL_DELAY_MS)]
    initial_delay_ms: u64,

    #[arg(long, default_value_t = chat_relay_client::backoff::DEFAULT_MAX_DELAY_MS)]
    max_delay_ms: u64,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    #[command(flatten)]
    client: ClientArgs,

    request_id: String,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    #[command(flatten)]
    client: ClientArgs,

    request_id: String,

    #[arg(long, default_value_t = 0)]
    from_index: u64,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("--engine process requires --engine-command")]
    MissingEngineCommand,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("stream log error: {0}")]
    Log(#[from] StreamLogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("request {request_id} ended {}", .status.as_str())]
    Unsuccessful {
        request_id: String,
        status: RequestStatus,
    },
}

pub fn run_chat_relay() -> Result<(), CliError> {
    let cli = ChatRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Chat(args) => run_chat(args),
        Command::Status(args) => run_status(args),
        Command::Resume(args) => run_resume(args),
        Command::Abort(args) => run_abort(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = server.config();
    let engine = build_engine(server)?;
    let cors = build_cors_layer(&server.cors_allow_origin)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let engine_name = engine.name();
        let (state, report) = AppState::open(&config, engine).await?;
        tracing::info!(
            log_dir = %config.log_dir.display(),
            settled = report.settled,
            interrupted = report.interrupted,
            discarded = report.discarded,
            "restored stream logs"
        );

        let (router, state) = build_router_with_state(Arc::new(state));
        let router = match cors {
            Some(cors) => router.layer(cors),
            None => router,
        };

        let sweeper_shutdown = CancellationToken::new();
        let sweeper = state
            .sweeper(config.retention, config.sweep_interval)
            .spawn(sweeper_shutdown.clone());

        let addr = config.addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, engine = engine_name, "server listening");

        let shutdown_state = state.clone();
        let settle_timeout = config.cancel_grace + SHUTDOWN_SLACK;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                sweeper_shutdown.cancel();
                shutdown_runs(&shutdown_state, settle_timeout).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;

        if let Err(err) = sweeper.await {
            tracing::warn!(error = %err, "sweeper task ended abnormally");
        }
        Ok(())
    })
}

fn build_engine(server: &ServerArgs) -> Result<Arc<dyn Engine>, CliError> {
    match server.engine {
        EngineKind::Mock => Ok(Arc::new(MockEngine::echo(Duration::from_millis(
            server.mock_word_delay_ms,
        )))),
        EngineKind::Process => {
            let program = server
                .engine_command
                .clone()
                .ok_or(CliError::MissingEngineCommand)?;
            let mut config = ProcessEngineConfig::new(program);
            config.args = server.engine_arg.clone();
            Ok(Arc::new(ProcessEngine::new(config)))
        }
    }
}

/// Lets browser clients on the listed origins call the API and read the
/// request id header. No origins, no CORS layer.
fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, CliError> {
    if origins.is_empty() {
        return Ok(None);
    }
    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([CONTENT_TYPE, ACCEPT])
            .expose_headers([REQUEST_ID_HEADER]),
    ))
}

fn client_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_chat(args: &ChatArgs) -> Result<(), CliError> {
    let client = ChatClient::new(args.client.endpoint.clone())?;
    let request_id = args.request_id.clone().unwrap_or_else(generate_request_id);
    let mut request = ChatRequest::new(request_id.clone(), args.message.clone());
    request.session_id = args.session_id.clone();
    if !args.allowed_tools.is_empty() {
        request.allowed_tools = Some(args.allowed_tools.clone());
    }
    request.working_directory = args.working_directory.clone();

    let policy = RetryPolicy {
        max_retries: args.max_retries,
        initial_delay: Duration::from_millis(args.initial_delay_ms),
        max_delay: Duration::from_millis(args.max_delay_ms),
        ..RetryPolicy::default()
    };

    client_runtime()?.block_on(async move {
        let session = ChatSession::new(client.clone(), policy);
        let mut write_error = None;
        let mut processor = |entry: &LogEntry| {
            if write_error.is_none() {
                if let Err(err) = write_entry(entry) {
                    write_error = Some(err);
                }
            }
        };

        tracing::debug!(request_id = %request_id, "sending message");
        let outcome = tokio::select! {
            outcome = session.send(request, &mut processor) => Some(outcome),
            _ = tokio::signal::ctrl_c() => None,
        };
        if let Some(err) = write_error {
            return Err(err);
        }

        match outcome {
            Some(Ok(TurnOutcome::Finished {
                status, recovered, ..
            })) => {
                tracing::debug!(request_id = %request_id, status = status.as_str(), recovered, "request settled");
                if status == RequestStatus::Completed {
                    Ok(())
                } else {
                    Err(CliError::Unsuccessful { request_id, status })
                }
            }
            Some(Ok(TurnOutcome::Cancelled { .. })) => Ok(()),
            Some(Err(err)) => Err(err.into()),
            None => {
                match client.abort(&request_id).await {
                    Ok(response) => {
                        tracing::info!(request_id = %request_id, aborted = response.aborted, "interrupted")
                    }
                    Err(err) => {
                        tracing::warn!(request_id = %request_id, error = %err, "abort failed")
                    }
                }
                Ok(())
            }
        }
    })
}

fn run_status(args: &RequestArgs) -> Result<(), CliError> {
    let client = ChatClient::new(args.client.endpoint.clone())?;
    let response = client_runtime()?.block_on(client.status(&args.request_id))?;
    write_json(&response)
}

fn run_resume(args: &ResumeArgs) -> Result<(), CliError> {
    let client = ChatClient::new(args.client.endpoint.clone())?;
    let response =
        client_runtime()?.block_on(client.resume(&args.request_id, args.from_index))?;
    write_json(&response)
}

fn run_abort(args: &RequestArgs) -> Result<(), CliError> {
    let client = ChatClient::new(args.client.endpoint.clone())?;
    let response = client_runtime()?.block_on(client.abort(&args.request_id))?;
    write_json(&response)
}

fn generate_request_id() -> String {
    format!(
        "req-{}-{:08x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

fn write_entry(entry: &LogEntry) -> Result<(), CliError> {
    write_stdout_line(&serde_json::to_string(entry)?)
}

fn write_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    write_stdout_line(&serde_json::to_string_pretty(value)?)
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
