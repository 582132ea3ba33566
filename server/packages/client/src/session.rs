use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chat_relay_protocol::{ChatRequest, RequestStatus};
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::client::{ChatClient, ClientError, LiveEntries};
use crate::recovery::{Accepted, MessageProcessor, RecoveryAgent, RecoveryError, ResumeApi};

/// Everything a session needs from the server.
pub trait ChatTransport: ResumeApi + Clone + 'static {
    fn chat(
        &self,
        request: &ChatRequest,
    ) -> impl Future<Output = Result<LiveEntries, ClientError>> + Send;
}

impl ChatTransport for ChatClient {
    async fn chat(&self, request: &ChatRequest) -> Result<LiveEntries, ClientError> {
        ChatClient::chat(self, request).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Finished {
        status: RequestStatus,
        /// Whether the tail of the turn came from resume rather than the live stream.
        recovered: bool,
        next_index: u64,
    },
    /// Stopped locally. The server-side run is untouched.
    Cancelled { next_index: u64 },
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("request rejected: {0}")]
    Rejected(#[source] ClientError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
}

/// Frees the active slot when a turn ends, including when the caller
/// drops the `send` future. A newer turn's slot is left alone.
struct TurnSlot<'a> {
    active: &'a Mutex<Option<ActiveTurn>>,
    id: u64,
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|turn| turn.id == self.id) {
            *active = None;
        }
    }
}

/// One conversation's worth of turns. At most one turn is in flight;
/// starting another cancels the local side of the previous one.
pub struct ChatSession<T = ChatClient> {
    transport: T,
    policy: RetryPolicy,
    active: Mutex<Option<ActiveTurn>>,
    turns: AtomicU64,
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            active: Mutex::new(None),
            turns: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_active(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Cancels the in-flight turn, live stream and any pending retry timer
    /// included. Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        match self.lock_active().take() {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn send<P>(
        &self,
        request: ChatRequest,
        processor: &mut P,
    ) -> Result<TurnOutcome, TurnError>
    where
        P: MessageProcessor + ?Sized,
    {
        let (turn, cancel) = self.begin_turn();
        let _slot = TurnSlot {
            active: &self.active,
            id: turn,
        };
        self.run_turn(request, processor, &cancel).await
    }

    async fn run_turn<P>(
        &self,
        request: ChatRequest,
        processor: &mut P,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError>
    where
        P: MessageProcessor + ?Sized,
    {
        let mut agent = RecoveryAgent::new(
            self.transport.clone(),
            request.request_id.clone(),
            self.policy.clone(),
        );

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TurnOutcome::Cancelled { next_index: 0 }),
            started = self.transport.chat(&request) => started,
        };

        let failure = match started {
            Ok(mut live) => loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Ok(TurnOutcome::Cancelled {
                            next_index: agent.state().next_expected_index,
                        });
                    }
                    next = live.next() => next,
                };
                match next {
                    Some(Ok(entry)) => match agent.accept_live(entry, processor) {
                        Accepted::Delivered => {
                            if let Some(status) = agent.terminal() {
                                return Ok(TurnOutcome::Finished {
                                    status,
                                    recovered: false,
                                    next_index: agent.state().next_expected_index,
                                });
                            }
                        }
                        Accepted::Duplicate => {}
                        Accepted::Gap { expected, received } => {
                            break ClientError::Disconnected {
                                reason: format!("expected entry {expected}, got {received}"),
                            };
                        }
                    },
                    Some(Err(err)) if err.is_network() => break err,
                    Some(Err(err)) => return Err(TurnError::Rejected(err)),
                    None => {
                        break ClientError::Disconnected {
                            reason: "stream ended before a terminal entry".to_string(),
                        };
                    }
                }
            },
            Err(err) if err.is_network() => err,
            Err(err) => return Err(TurnError::Rejected(err)),
        };

        tracing::info!(
            request_id = %request.request_id,
            next_index = agent.state().next_expected_index,
            error = %failure,
            "live stream interrupted, recovering"
        );
        agent.note_failure(&failure);

        match agent.recover(processor, cancel).await {
            Ok(outcome) => Ok(TurnOutcome::Finished {
                status: outcome.status,
                recovered: true,
                next_index: agent.state().next_expected_index,
            }),
            Err(RecoveryError::Cancelled) => Ok(TurnOutcome::Cancelled {
                next_index: agent.state().next_expected_index,
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn begin_turn(&self) -> (u64, CancellationToken) {
        let id = self.turns.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.lock_active().replace(ActiveTurn {
            id,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            tracing::debug!(turn = previous.id, "cancelling previous turn");
            previous.cancel.cancel();
        }
        (id, cancel)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveTurn>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_relay_error::{ErrorType, ProblemDetails};
    use chat_relay_protocol::{LogEntry, ReportedStatus, ResumeResponse, StatusResponse, StreamMessage};
    use futures::stream;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum LiveEnd {
        Disconnect,
        Hang,
        Clean,
    }

    struct Script {
        live: Vec<LogEntry>,
        live_end: LiveEnd,
        log: Vec<LogEntry>,
        status: ReportedStatus,
        reject: Option<u16>,
        resume_calls: AtomicU32,
    }

    #[derive(Clone)]
    struct FakeTransport(Arc<Script>);

    impl FakeTransport {
        fn new(live: Vec<LogEntry>, live_end: LiveEnd, log: Vec<LogEntry>) -> Self {
            Self(Arc::new(Script {
                live,
                live_end,
                log,
                status: ReportedStatus::Completed,
                reject: None,
                resume_calls: AtomicU32::new(0),
            }))
        }

        fn rejecting(status: u16) -> Self {
            Self(Arc::new(Script {
                live: Vec::new(),
                live_end: LiveEnd::Clean,
                log: Vec::new(),
                status: ReportedStatus::NotFound,
                reject: Some(status),
                resume_calls: AtomicU32::new(0),
            }))
        }
    }

    impl ResumeApi for FakeTransport {
        async fn status(&self, request_id: &str) -> Result<StatusResponse, ClientError> {
            Ok(StatusResponse {
                request_id: request_id.to_string(),
                status: self.0.status,
                total_messages: self.0.log.len() as u64,
                last_updated: None,
            })
        }

        async fn resume(
            &self,
            _request_id: &str,
            from_index: u64,
        ) -> Result<ResumeResponse, ClientError> {
            self.0.resume_calls.fetch_add(1, Ordering::SeqCst);
            let start = (from_index as usize).min(self.0.log.len());
            Ok(ResumeResponse {
                messages: self.0.log[start..].to_vec(),
                total_messages: self.0.log.len() as u64,
                is_complete: self.0.status.is_terminal(),
            })
        }
    }

    impl ChatTransport for FakeTransport {
        async fn chat(&self, _request: &ChatRequest) -> Result<LiveEntries, ClientError> {
            if let Some(status) = self.0.reject {
                return Err(ClientError::Http {
                    status,
                    problem: Some(ProblemDetails::new(ErrorType::DuplicateRequest, None)),
                    body: String::new(),
                });
            }
            let live = stream::iter(self.0.live.clone().into_iter().map(Ok));
            Ok(match self.0.live_end {
                LiveEnd::Clean => live.boxed(),
                LiveEnd::Disconnect => live
                    .chain(stream::iter([Err(ClientError::Disconnected {
                        reason: "reset by peer".to_string(),
                    })]))
                    .boxed(),
                LiveEnd::Hang => live.chain(stream::pending()).boxed(),
            })
        }
    }

    fn log() -> Vec<LogEntry> {
        vec![
            LogEntry::new(0, StreamMessage::data("a")),
            LogEntry::new(1, StreamMessage::data("b")),
            LogEntry::new(2, StreamMessage::data("c")),
            LogEntry::new(3, StreamMessage::Done),
        ]
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn uninterrupted_turn_needs_no_recovery() {
        let transport = FakeTransport::new(log(), LiveEnd::Clean, log());
        let session = ChatSession::new(transport.clone(), policy());
        let mut seen = Vec::new();

        let outcome = session
            .send(ChatRequest::new("r1", "hi"), &mut |entry: &LogEntry| {
                seen.push(entry.index)
            })
            .await
            .expect("turn");

        assert_eq!(
            outcome,
            TurnOutcome::Finished {
                status: RequestStatus::Completed,
                recovered: false,
                next_index: 4,
            }
        );
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(transport.0.resume_calls.load(Ordering::SeqCst), 0);
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_is_completed_from_resume_without_duplicates() {
        let live = log()[..2].to_vec();
        let transport = FakeTransport::new(live, LiveEnd::Disconnect, log());
        let session = ChatSession::new(transport.clone(), policy());
        let mut seen = Vec::new();

        let outcome = session
            .send(ChatRequest::new("r1", "hi"), &mut |entry: &LogEntry| {
                seen.push(entry.index)
            })
            .await
            .expect("turn");

        assert_eq!(
            outcome,
            TurnOutcome::Finished {
                status: RequestStatus::Completed,
                recovered: true,
                next_index: 4,
            }
        );
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(transport.0.resume_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_ending_without_terminal_entry_recovers() {
        let live = log()[..3].to_vec();
        let transport = FakeTransport::new(live, LiveEnd::Clean, log());
        let session = ChatSession::new(transport, policy());
        let mut seen = Vec::new();

        let outcome = session
            .send(ChatRequest::new("r1", "hi"), &mut |entry: &LogEntry| {
                seen.push(entry.index)
            })
            .await
            .expect("turn");

        assert!(matches!(
            outcome,
            TurnOutcome::Finished {
                recovered: true,
                ..
            }
        ));
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn rejected_request_is_not_retried() {
        let transport = FakeTransport::rejecting(409);
        let session = ChatSession::new(transport.clone(), policy());

        let err = session
            .send(ChatRequest::new("r1", "hi"), &mut |_: &LogEntry| {})
            .await
            .expect_err("rejected");

        match err {
            TurnError::Rejected(err) => assert_eq!(err.status(), Some(409)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.0.resume_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_turn_cancels_the_previous_one() {
        let hanging = FakeTransport::new(log()[..1].to_vec(), LiveEnd::Hang, log());
        let session = ChatSession::new(hanging, policy());
        let mut first_seen = Vec::new();
        let mut second_seen = Vec::new();

        let mut on_first = |entry: &LogEntry| first_seen.push(entry.index);
        let (first, second) = tokio::join!(
            session.send(ChatRequest::new("r1", "one"), &mut on_first),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let outcome = tokio::time::timeout(
                    Duration::from_millis(50),
                    session.send(ChatRequest::new("r2", "two"), &mut |entry: &LogEntry| {
                        second_seen.push(entry.index)
                    }),
                )
                .await;
                outcome
            }
        );

        assert_eq!(
            first.expect("first turn"),
            TurnOutcome::Cancelled { next_index: 1 }
        );
        assert!(second.is_err(), "second turn hangs until its caller gives up");
        assert!(!session.is_active());
        assert!(!session.stop());
        assert_eq!(first_seen, vec![0]);
        assert_eq!(second_seen, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_active_turn() {
        let hanging = FakeTransport::new(Vec::new(), LiveEnd::Hang, Vec::new());
        let session = ChatSession::new(hanging, policy());

        let mut on_entry = |_: &LogEntry| {};
        let (outcome, stopped) = tokio::join!(
            session.send(ChatRequest::new("r1", "hi"), &mut on_entry),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                session.stop()
            }
        );

        assert!(stopped);
        assert_eq!(
            outcome.expect("turn"),
            TurnOutcome::Cancelled { next_index: 0 }
        );
        assert!(!session.stop());
    }
}
