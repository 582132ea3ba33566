//! Drives one request end to end.
//!
//! `start` registers the request and spawns a drive task that owns the
//! request's [`LogWriter`]. For every engine message the task appends to
//! the log, accounts for it in the registry, and only then forwards the
//! entry over an unbounded channel to whoever holds the live receiver.
//! Dropping the receiver (client disconnect) switches the task to
//! persistence-only mode; nothing else changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chat_relay_protocol::{ChatRequest, LogEntry, RequestStatus, StreamMessage};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancellation::{CancellationCoordinator, EndOnDrop};
use crate::engine::{Engine, EngineError, EngineStream, RunOptions};
use crate::registry::{RegistryError, RequestRegistry};
use crate::stream_log::{LogWriter, StreamLog, StreamLogError};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("request already registered: {request_id}")]
    DuplicateRequest { request_id: String },
    #[error(transparent)]
    Log(#[from] StreamLogError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub request_id: String,
    pub status: RequestStatus,
    pub total_messages: u64,
}

/// A started request: the live feed of its entries and a handle that
/// resolves once the request has settled.
#[derive(Debug)]
pub struct StartedRun {
    pub request_id: String,
    pub live: mpsc::UnboundedReceiver<LogEntry>,
    pub completion: JoinHandle<RunSummary>,
}

#[derive(Clone)]
pub struct SessionController {
    registry: Arc<RequestRegistry>,
    coordinator: Arc<CancellationCoordinator>,
    log: StreamLog,
    engine: Arc<dyn Engine>,
    cancel_grace: Duration,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("engine", &self.engine.name())
            .field("log_root", &self.log.root())
            .field("cancel_grace", &self.cancel_grace)
            .finish()
    }
}

impl SessionController {
    pub fn new(
        registry: Arc<RequestRegistry>,
        coordinator: Arc<CancellationCoordinator>,
        log: StreamLog,
        engine: Arc<dyn Engine>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            registry,
            coordinator,
            log,
            engine,
            cancel_grace,
        }
    }

    pub async fn start(&self, request: ChatRequest) -> Result<StartedRun, ControllerError> {
        let request_id = request.request_id.clone();
        crate::stream_log::validate_request_id(&request_id)?;

        let cancel = self
            .coordinator
            .begin(&request_id)
            .map_err(|_| ControllerError::DuplicateRequest {
                request_id: request_id.clone(),
            })?;
        // From here on every exit path releases the handle.
        let guard = EndOnDrop::new(self.coordinator.clone(), request_id.clone());

        let writer = match self.log.create(&request_id).await {
            Ok(writer) => writer,
            Err(StreamLogError::AlreadyExists { .. }) => {
                return Err(ControllerError::DuplicateRequest { request_id });
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(RegistryError::AlreadyRegistered { .. }) = self
            .registry
            .register(&request_id, writer.path().to_path_buf())
            .await
        {
            let path = writer.path().to_path_buf();
            drop(writer);
            if let Err(err) = self.log.delete(&request_id).await {
                tracing::warn!(request_id = %request_id, path = %path.display(), error = %err, "failed to remove log of rejected request");
            }
            return Err(ControllerError::DuplicateRequest { request_id });
        }

        tracing::info!(
            request_id = %request_id,
            engine = self.engine.name(),
            session_id = ?request.session_id,
            "request started"
        );

        let options = RunOptions {
            request_id: request_id.clone(),
            session_id: request.session_id,
            allowed_tools: request.allowed_tools,
            working_directory: request.working_directory.map(PathBuf::from),
        };
        let stream = self
            .engine
            .start_run(request.message, options, cancel.clone());

        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let drive = Drive {
            registry: self.registry.clone(),
            writer,
            cancel,
            cancel_grace: self.cancel_grace,
            live: Some(live_tx),
            total_messages: 0,
            _guard: guard,
        };

        let registry = self.registry.clone();
        let supervised_id = request_id.clone();
        let completion = tokio::spawn(async move {
            match tokio::spawn(drive.run(stream)).await {
                Ok(summary) => summary,
                Err(err) => {
                    tracing::error!(request_id = %supervised_id, error = %err, "drive task aborted");
                    let record = registry.mark_failed(&supervised_id).await.ok();
                    RunSummary {
                        request_id: supervised_id,
                        status: RequestStatus::Failed,
                        total_messages: record.map(|record| record.total_messages).unwrap_or(0),
                    }
                }
            }
        });

        Ok(StartedRun {
            request_id,
            live: live_rx,
            completion,
        })
    }
}

/// State owned by one request's drive task.
struct Drive {
    registry: Arc<RequestRegistry>,
    writer: LogWriter,
    cancel: CancellationToken,
    cancel_grace: Duration,
    live: Option<mpsc::UnboundedSender<LogEntry>>,
    total_messages: u64,
    _guard: EndOnDrop,
}

impl Drive {
    async fn run(mut self, mut stream: EngineStream) -> RunSummary {
        let started = Instant::now();
        let mut cancel_deadline: Option<tokio::time::Instant> = None;

        let terminal = loop {
            let next = match cancel_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(
                            request_id = %self.writer.request_id(),
                            grace_ms = self.cancel_grace.as_millis() as u64,
                            "engine ignored cancellation; abandoning run"
                        );
                        break StreamMessage::Aborted;
                    }
                },
                None => tokio::select! {
                    next = stream.next() => next,
                    _ = self.cancel.cancelled() => {
                        cancel_deadline = Some(tokio::time::Instant::now() + self.cancel_grace);
                        continue;
                    }
                },
            };

            match next {
                Some(Ok(_)) if self.cancel.is_cancelled() => {
                    cancel_deadline.get_or_insert_with(|| {
                        tokio::time::Instant::now() + self.cancel_grace
                    });
                    tracing::debug!(
                        request_id = %self.writer.request_id(),
                        "dropping engine output produced after cancellation"
                    );
                }
                Some(Ok(payload)) => {
                    if let Err(err) = self.persist(StreamMessage::Data { payload }).await {
                        tracing::error!(
                            request_id = %self.writer.request_id(),
                            error = %err,
                            "failed to persist message; failing request"
                        );
                        self.cancel.cancel();
                        break StreamMessage::error(format!("failed to persist output: {err}"));
                    }
                }
                Some(Err(EngineError::Cancelled)) => break StreamMessage::Aborted,
                Some(Err(_)) | None if self.cancel.is_cancelled() => break StreamMessage::Aborted,
                Some(Err(err)) => {
                    tracing::warn!(
                        request_id = %self.writer.request_id(),
                        error = %err,
                        "engine failed"
                    );
                    break StreamMessage::error(err.to_string());
                }
                None => break StreamMessage::Done,
            }
        };
        drop(stream);

        let status = terminal
            .terminal_status()
            .unwrap_or(RequestStatus::Failed);
        let status = match self.persist(terminal).await {
            Ok(()) => status,
            Err(err) => {
                tracing::error!(
                    request_id = %self.writer.request_id(),
                    error = %err,
                    "failed to persist terminal entry"
                );
                match self.registry.mark_failed(self.writer.request_id()).await {
                    Ok(record) => record.status,
                    Err(_) => RequestStatus::Failed,
                }
            }
        };

        tracing::info!(
            request_id = %self.writer.request_id(),
            status = status.as_str(),
            total_messages = self.total_messages,
            elapsed_ms = started.elapsed().as_millis() as u64,
            live_client = self.live.is_some(),
            "request finished"
        );

        RunSummary {
            request_id: self.writer.request_id().to_string(),
            status,
            total_messages: self.total_messages,
        }
    }

    /// Durability before delivery: append, account, then forward.
    async fn persist(&mut self, message: StreamMessage) -> Result<(), StreamLogError> {
        let index = self.writer.append(&message).await?;
        self.total_messages += 1;
        if let Err(err) = self
            .registry
            .record_append(self.writer.request_id(), &message)
            .await
        {
            tracing::warn!(
                request_id = %self.writer.request_id(),
                index,
                error = %err,
                "registry rejected appended entry"
            );
        }

        if let Some(live) = &self.live {
            if live.send(LogEntry::new(index, message)).is_err() {
                tracing::info!(
                    request_id = %self.writer.request_id(),
                    index,
                    "live client detached; continuing in persistence mode"
                );
                self.live = None;
            }
        }
        Ok(())
    }
}
