use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{Engine, EngineError, EngineStream, RunOptions};

const STDERR_TAIL_LINES: usize = 20;
const RAW_PREVIEW_BYTES: usize = 200;

/// Command line for an engine that prints one JSON message per stdout line.
#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ProcessEngineConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Runs the configured command once per request. The prompt is passed as
/// the last argument; request metadata travels in `CHAT_RELAY_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: ProcessEngineConfig,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self { config }
    }
}

impl Engine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    fn start_run(
        &self,
        prompt: String,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> EngineStream {
        let (tx, rx) = mpsc::channel(64);
        let config = self.config.clone();
        tokio::spawn(run_process(config, prompt, options, cancel, tx));
        ReceiverStream::new(rx).boxed()
    }
}

type Sender = mpsc::Sender<Result<Value, EngineError>>;

async fn run_process(
    config: ProcessEngineConfig,
    prompt: String,
    options: RunOptions,
    cancel: CancellationToken,
    tx: Sender,
) {
    let spawn_start = Instant::now();
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .arg(&prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &config.env {
        command.env(key, value);
    }
    command.env("CHAT_RELAY_REQUEST_ID", &options.request_id);
    if let Some(session_id) = &options.session_id {
        command.env("CHAT_RELAY_SESSION_ID", session_id);
    }
    if let Some(tools) = &options.allowed_tools {
        command.env("CHAT_RELAY_ALLOWED_TOOLS", tools.join(","));
    }
    if let Some(dir) = &options.working_directory {
        command.current_dir(dir);
    }

    let command_for_display = format_command_for_display(&config.program, &config.args);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(
                request_id = %options.request_id,
                command = %command_for_display,
                error = %err,
                "failed to spawn engine process"
            );
            let _ = tx
                .send(Err(EngineError::Spawn {
                    command: command_for_display,
                    source: err,
                }))
                .await;
            return;
        }
    };

    tracing::info!(
        request_id = %options.request_id,
        pid = child.id().unwrap_or(0),
        elapsed_ms = spawn_start.elapsed().as_millis() as u64,
        "engine process spawned"
    );

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = tx
            .send(Err(EngineError::Failed {
                message: "engine process pipes were not available".to_string(),
            }))
            .await;
        kill(&mut child).await;
        return;
    };

    let stderr_task = tokio::spawn(collect_stderr(stderr, options.request_id.clone()));
    let mut stdout = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut line_count: u64 = 0;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(request_id = %options.request_id, "engine process: cancelling run");
                kill(&mut child).await;
                let _ = tx.send(Err(EngineError::Cancelled)).await;
                return;
            }
            read = stdout.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                line_count += 1;
                let payload = parse_stdout_line(trimmed, line_count, &options.request_id);
                if tx.send(Ok(payload)).await.is_err() {
                    tracing::debug!(
                        request_id = %options.request_id,
                        "engine process: consumer went away, stopping run"
                    );
                    kill(&mut child).await;
                    return;
                }
            }
            Err(err) => {
                kill(&mut child).await;
                let _ = tx.send(Err(EngineError::Io(err))).await;
                return;
            }
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            kill(&mut child).await;
            let _ = tx.send(Err(EngineError::Cancelled)).await;
            return;
        }
        status = child.wait() => status,
    };
    let stderr_tail = stderr_task.await.unwrap_or_default();

    match status {
        Ok(status) if status.success() => {
            tracing::info!(
                request_id = %options.request_id,
                total_lines = line_count,
                elapsed_ms = spawn_start.elapsed().as_millis() as u64,
                "engine process finished"
            );
        }
        Ok(status) => {
            tracing::warn!(
                request_id = %options.request_id,
                code = status.code(),
                "engine process exited unsuccessfully"
            );
            let _ = tx
                .send(Err(EngineError::Exited {
                    code: status.code(),
                    stderr_tail: (!stderr_tail.is_empty()).then(|| stderr_tail.join("\n")),
                }))
                .await;
        }
        Err(err) => {
            let _ = tx.send(Err(EngineError::Io(err))).await;
        }
    }
}

fn parse_stdout_line(trimmed: &str, line_number: u64, request_id: &str) -> Value {
    match serde_json::from_str::<Value>(trimmed) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(
                request_id,
                line_number,
                error = %err,
                raw = %preview(trimmed),
                "engine stdout: invalid JSON"
            );
            json!({
                "kind": "invalid_stdout",
                "error": err.to_string(),
                "raw": trimmed,
            })
        }
    }
}

async fn collect_stderr(stderr: tokio::process::ChildStderr, request_id: String) -> Vec<String> {
    let mut stderr = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while matches!(stderr.read_until(b'\n', &mut buf).await, Ok(read) if read > 0) {
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        buf.clear();
        tracing::debug!(request_id = %request_id, "engine stderr: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

async fn kill(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        Ok(None) => {
            let _ = child.kill().await;
        }
        Err(_) => {
            let _ = child.start_kill();
        }
    }
}

fn preview(raw: &str) -> String {
    if raw.len() <= RAW_PREVIEW_BYTES {
        return raw.to_string();
    }
    let mut end = RAW_PREVIEW_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

fn format_command_for_display(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
