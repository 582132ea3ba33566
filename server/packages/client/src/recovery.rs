//! Reconnection after a live stream breaks.
//!
//! The agent keeps a cursor, the next index it expects, and only hands an
//! entry to the processor when its index matches. Entries therefore reach
//! the caller exactly once and in order, however many times the live stream
//! and the resume endpoint overlap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chat_relay_protocol::{
    LogEntry, ReportedStatus, RequestStatus, ResumeResponse, StatusResponse,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::client::{ChatClient, ClientError};

/// The two queries recovery needs from the server.
pub trait ResumeApi: Send + Sync {
    fn status(
        &self,
        request_id: &str,
    ) -> impl Future<Output = Result<StatusResponse, ClientError>> + Send;

    fn resume(
        &self,
        request_id: &str,
        from_index: u64,
    ) -> impl Future<Output = Result<ResumeResponse, ClientError>> + Send;
}

impl ResumeApi for ChatClient {
    async fn status(&self, request_id: &str) -> Result<StatusResponse, ClientError> {
        ChatClient::status(self, request_id).await
    }

    async fn resume(
        &self,
        request_id: &str,
        from_index: u64,
    ) -> Result<ResumeResponse, ClientError> {
        ChatClient::resume(self, request_id, from_index).await
    }
}

impl<T: ResumeApi> ResumeApi for Arc<T> {
    fn status(
        &self,
        request_id: &str,
    ) -> impl Future<Output = Result<StatusResponse, ClientError>> + Send {
        self.as_ref().status(request_id)
    }

    fn resume(
        &self,
        request_id: &str,
        from_index: u64,
    ) -> impl Future<Output = Result<ResumeResponse, ClientError>> + Send {
        self.as_ref().resume(request_id, from_index)
    }
}

/// Receives every entry of a turn once, in index order.
pub trait MessageProcessor: Send {
    fn process(&mut self, entry: &LogEntry);
}

impl<F> MessageProcessor for F
where
    F: FnMut(&LogEntry) + Send,
{
    fn process(&mut self, entry: &LogEntry) {
        self(entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Streaming,
    Recovering,
    Completed,
    RecoveryFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryState {
    pub is_recovering: bool,
    /// Consecutive failed attempts; reset whenever the server answers.
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_expected_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Delivered,
    Duplicate,
    Gap { expected: u64, received: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub status: RequestStatus,
    /// Status/resume rounds made, successful or not.
    pub attempts: u32,
    /// Backoff waits taken after failed attempts, in order.
    pub delays: Vec<Duration>,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("request {request_id} is unknown to the server")]
    NotFound { request_id: String },
    #[error("gave up on request {request_id} after {attempts} failed attempts: {last_error}")]
    Exhausted {
        request_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("recovery cancelled")]
    Cancelled,
}

enum Attempt {
    Finished(RequestStatus),
    Pending,
}

enum AttemptError {
    NotFound,
    Client(ClientError),
}

pub struct RecoveryAgent<A> {
    api: A,
    policy: RetryPolicy,
    request_id: String,
    state: RecoveryState,
    phase: RecoveryPhase,
    terminal: Option<RequestStatus>,
}

impl<A: ResumeApi> RecoveryAgent<A> {
    pub fn new(api: A, request_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            api,
            policy,
            request_id: request_id.into(),
            state: RecoveryState::default(),
            phase: RecoveryPhase::Streaming,
            terminal: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn state(&self) -> &RecoveryState {
        &self.state
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Status of the terminal entry, once one has been delivered.
    pub fn terminal(&self) -> Option<RequestStatus> {
        self.terminal
    }

    /// Takes an entry from the live stream. A gap means the stream lost
    /// something and the caller should switch to recovery.
    pub fn accept_live<P>(&mut self, entry: LogEntry, processor: &mut P) -> Accepted
    where
        P: MessageProcessor + ?Sized,
    {
        let expected = self.state.next_expected_index;
        if entry.index < expected {
            return Accepted::Duplicate;
        }
        if entry.index > expected {
            return Accepted::Gap {
                expected,
                received: entry.index,
            };
        }
        self.deliver(entry, processor);
        Accepted::Delivered
    }

    /// Records why the live stream had to be abandoned.
    pub fn note_failure(&mut self, error: &ClientError) {
        self.state.last_error = Some(error.to_string());
    }

    /// Polls status and resume until the request settles, the server
    /// forgets it, retries run out, or `cancel` fires.
    pub async fn recover<P>(
        &mut self,
        processor: &mut P,
        cancel: &CancellationToken,
    ) -> Result<RecoveryOutcome, RecoveryError>
    where
        P: MessageProcessor + ?Sized,
    {
        if let Some(status) = self.terminal {
            return Ok(RecoveryOutcome {
                status,
                attempts: 0,
                delays: Vec::new(),
            });
        }

        self.phase = RecoveryPhase::Recovering;
        self.state.is_recovering = true;
        self.state.retry_count = 0;
        let mut attempts = 0u32;
        let mut delays = Vec::new();

        loop {
            if cancel.is_cancelled() {
                self.state.is_recovering = false;
                return Err(RecoveryError::Cancelled);
            }
            attempts += 1;

            let wait = match self.attempt(processor).await {
                Ok(Attempt::Finished(status)) => {
                    self.phase = RecoveryPhase::Completed;
                    self.state.is_recovering = false;
                    self.state.retry_count = 0;
                    tracing::info!(
                        request_id = %self.request_id,
                        status = status.as_str(),
                        attempts,
                        next_index = self.state.next_expected_index,
                        "recovered request"
                    );
                    return Ok(RecoveryOutcome {
                        status,
                        attempts,
                        delays,
                    });
                }
                Ok(Attempt::Pending) => {
                    self.state.retry_count = 0;
                    self.policy.poll_interval
                }
                Err(AttemptError::NotFound) => {
                    self.fail("request not found");
                    return Err(RecoveryError::NotFound {
                        request_id: self.request_id.clone(),
                    });
                }
                Err(AttemptError::Client(err)) => {
                    let delay = self.policy.next_delay(self.state.retry_count);
                    self.state.retry_count += 1;
                    self.state.last_error = Some(err.to_string());
                    if self.state.retry_count >= self.policy.max_retries {
                        let last_error = err.to_string();
                        self.fail(&last_error);
                        return Err(RecoveryError::Exhausted {
                            request_id: self.request_id.clone(),
                            attempts,
                            last_error,
                        });
                    }
                    tracing::warn!(
                        request_id = %self.request_id,
                        retry = self.state.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "recovery attempt failed"
                    );
                    delays.push(delay);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state.is_recovering = false;
                    return Err(RecoveryError::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn attempt<P>(&mut self, processor: &mut P) -> Result<Attempt, AttemptError>
    where
        P: MessageProcessor + ?Sized,
    {
        let status = self
            .api
            .status(&self.request_id)
            .await
            .map_err(AttemptError::Client)?;
        if status.status == ReportedStatus::NotFound {
            return Err(AttemptError::NotFound);
        }

        let page = self
            .api
            .resume(&self.request_id, self.state.next_expected_index)
            .await
            .map_err(AttemptError::Client)?;
        for entry in page.messages {
            self.accept_resumed(entry, processor);
        }

        if let Some(status) = self.terminal {
            return Ok(Attempt::Finished(status));
        }
        if page.is_complete {
            tracing::warn!(
                request_id = %self.request_id,
                reported = ?status.status,
                "request settled without a readable terminal entry"
            );
            return Ok(Attempt::Finished(settled_status(status.status)));
        }
        Ok(Attempt::Pending)
    }

    fn accept_resumed<P>(&mut self, entry: LogEntry, processor: &mut P)
    where
        P: MessageProcessor + ?Sized,
    {
        let expected = self.state.next_expected_index;
        if entry.index < expected {
            return;
        }
        if entry.index > expected {
            // The server skips entries it cannot read; nothing will fill the hole.
            tracing::warn!(
                request_id = %self.request_id,
                expected,
                received = entry.index,
                "resume skipped entries"
            );
        }
        self.deliver(entry, processor);
    }

    fn deliver<P>(&mut self, entry: LogEntry, processor: &mut P)
    where
        P: MessageProcessor + ?Sized,
    {
        processor.process(&entry);
        self.state.next_expected_index = entry.index + 1;
        if let Some(status) = entry.message.terminal_status() {
            self.terminal = Some(status);
            self.phase = RecoveryPhase::Completed;
        }
    }

    fn fail(&mut self, error: &str) {
        self.phase = RecoveryPhase::RecoveryFailed;
        self.state.is_recovering = false;
        self.state.last_error = Some(error.to_string());
    }
}

fn settled_status(reported: ReportedStatus) -> RequestStatus {
    match reported {
        ReportedStatus::Completed => RequestStatus::Completed,
        ReportedStatus::Aborted => RequestStatus::Aborted,
        _ => RequestStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_relay_protocol::StreamMessage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Serves `log` through status/resume. Each successful status call
    /// advances one step along `timeline`, which says how far the run has
    /// progressed and what status it reports.
    struct FakeApi {
        log: Vec<LogEntry>,
        failures: AtomicU32,
        status_calls: AtomicU32,
        timeline: Mutex<VecDeque<(ReportedStatus, usize)>>,
        current: Mutex<(ReportedStatus, usize)>,
    }

    impl FakeApi {
        fn new(log: Vec<LogEntry>, timeline: Vec<(ReportedStatus, usize)>) -> Arc<Self> {
            Arc::new(Self {
                log,
                failures: AtomicU32::new(0),
                status_calls: AtomicU32::new(0),
                timeline: Mutex::new(timeline.into()),
                current: Mutex::new((ReportedStatus::InProgress, 0)),
            })
        }

        fn failing_first(self: Arc<Self>, failures: u32) -> Arc<Self> {
            self.failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    impl ResumeApi for FakeApi {
        async fn status(&self, request_id: &str) -> Result<StatusResponse, ClientError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ClientError::Disconnected {
                    reason: "connection refused".to_string(),
                });
            }
            let mut timeline = self.timeline.lock().unwrap();
            let (status, visible) = *timeline.front().expect("timeline");
            if timeline.len() > 1 {
                timeline.pop_front();
            }
            *self.current.lock().unwrap() = (status, visible);
            if status == ReportedStatus::NotFound {
                return Ok(StatusResponse::not_found(request_id));
            }
            Ok(StatusResponse {
                request_id: request_id.to_string(),
                status,
                total_messages: visible as u64,
                last_updated: None,
            })
        }

        async fn resume(
            &self,
            _request_id: &str,
            from_index: u64,
        ) -> Result<ResumeResponse, ClientError> {
            let (status, visible) = *self.current.lock().unwrap();
            let start = (from_index as usize).min(visible);
            Ok(ResumeResponse {
                messages: self.log[start..visible].to_vec(),
                total_messages: visible as u64,
                is_complete: status.is_terminal(),
            })
        }
    }

    fn finished_log() -> Vec<LogEntry> {
        vec![
            LogEntry::new(0, StreamMessage::data("a")),
            LogEntry::new(1, StreamMessage::data("b")),
            LogEntry::new(2, StreamMessage::data("c")),
            LogEntry::new(3, StreamMessage::Done),
        ]
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            max_jitter: Duration::ZERO,
            poll_interval: Duration::from_secs(1),
        }
    }

    fn collector() -> (Arc<Mutex<Vec<u64>>>, impl FnMut(&LogEntry) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |entry: &LogEntry| {
            sink.lock().unwrap().push(entry.index)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn failures_then_success_back_off_with_capped_delays() {
        let api = FakeApi::new(finished_log(), vec![(ReportedStatus::Completed, 4)])
            .failing_first(3);
        let mut agent = RecoveryAgent::new(api.clone(), "r1", policy(5));
        let (seen, mut processor) = collector();

        agent.accept_live(LogEntry::new(0, StreamMessage::data("a")), &mut processor);
        let outcome = agent
            .recover(&mut processor, &CancellationToken::new())
            .await
            .expect("recovered");

        assert_eq!(outcome.status, RequestStatus::Completed);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(
            outcome.delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
            ]
        );
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 4);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(agent.phase(), RecoveryPhase::Completed);
        assert!(!agent.state().is_recovering);
        assert_eq!(agent.state().next_expected_index, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let api = FakeApi::new(finished_log(), vec![(ReportedStatus::Completed, 4)])
            .failing_first(10);
        let mut agent = RecoveryAgent::new(api.clone(), "r1", policy(3));
        let (seen, mut processor) = collector();

        let err = agent
            .recover(&mut processor, &CancellationToken::new())
            .await
            .expect_err("exhausted");

        match err {
            RecoveryError::Exhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 3);
        assert_eq!(agent.phase(), RecoveryPhase::RecoveryFailed);
        assert_eq!(agent.state().retry_count, 3);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_request_fails_without_retrying() {
        let api = FakeApi::new(Vec::new(), vec![(ReportedStatus::NotFound, 0)]);
        let mut agent = RecoveryAgent::new(api.clone(), "gone", policy(5));
        let (_, mut processor) = collector();

        let err = agent
            .recover(&mut processor, &CancellationToken::new())
            .await
            .expect_err("not found");

        assert!(matches!(err, RecoveryError::NotFound { .. }));
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.phase(), RecoveryPhase::RecoveryFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_running_request_until_it_settles() {
        let api = FakeApi::new(
            finished_log(),
            vec![
                (ReportedStatus::InProgress, 1),
                (ReportedStatus::InProgress, 1),
                (ReportedStatus::InProgress, 3),
                (ReportedStatus::Completed, 4),
            ],
        )
        .failing_first(1);
        let mut agent = RecoveryAgent::new(api.clone(), "r1", policy(2));
        let (seen, mut processor) = collector();

        let outcome = agent
            .recover(&mut processor, &CancellationToken::new())
            .await
            .expect("recovered");

        assert_eq!(outcome.status, RequestStatus::Completed);
        assert_eq!(outcome.attempts, 5);
        assert_eq!(outcome.delays, vec![Duration::from_millis(100)]);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_backoff_timer() {
        let api = FakeApi::new(finished_log(), vec![(ReportedStatus::Completed, 4)])
            .failing_first(10);
        let mut agent = RecoveryAgent::new(api.clone(), "r1", policy(10));
        let (_, mut processor) = collector();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        let (result, _) = tokio::join!(agent.recover(&mut processor, &cancel), async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        assert!(matches!(result, Err(RecoveryError::Cancelled)));
        // Attempts at 0ms and 100ms; the 200ms wait is interrupted.
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 2);
        assert!(!agent.state().is_recovering);
    }

    #[test]
    fn live_entries_are_deduplicated_by_index() {
        let api = FakeApi::new(Vec::new(), vec![(ReportedStatus::InProgress, 0)]);
        let mut agent = RecoveryAgent::new(api, "r1", policy(1));
        let (seen, mut processor) = collector();

        let first = LogEntry::new(0, StreamMessage::data("a"));
        assert_eq!(
            agent.accept_live(first.clone(), &mut processor),
            Accepted::Delivered
        );
        assert_eq!(agent.accept_live(first, &mut processor), Accepted::Duplicate);
        assert_eq!(
            agent.accept_live(LogEntry::new(2, StreamMessage::Done), &mut processor),
            Accepted::Gap {
                expected: 1,
                received: 2
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(agent.terminal(), None);
        assert_eq!(
            agent.accept_live(LogEntry::new(1, StreamMessage::Aborted), &mut processor),
            Accepted::Delivered
        );
        assert_eq!(agent.terminal(), Some(RequestStatus::Aborted));
    }
}
