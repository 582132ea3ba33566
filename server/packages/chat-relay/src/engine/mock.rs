use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Engine, EngineError, EngineStream, RunOptions};

const MOCK_WORD_DELAY_MS: u64 = 30;

#[derive(Debug, Clone)]
pub enum MockStep {
    Emit(Value),
    Delay(Duration),
    /// Blocks until the notify is signalled, or the run is cancelled.
    WaitFor(Arc<Notify>),
    Fail(String),
    /// Blocks until the run is cancelled, then acknowledges.
    AwaitCancel,
}

/// Scripted engine for tests and demos. Without a script it echoes the
/// prompt back one word at a time.
#[derive(Debug, Clone)]
pub struct MockEngine {
    script: Option<Vec<MockStep>>,
    word_delay: Duration,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::echo(Duration::from_millis(MOCK_WORD_DELAY_MS))
    }
}

impl MockEngine {
    pub fn echo(word_delay: Duration) -> Self {
        Self {
            script: None,
            word_delay,
        }
    }

    pub fn scripted(steps: Vec<MockStep>) -> Self {
        Self {
            script: Some(steps),
            word_delay: Duration::ZERO,
        }
    }

    fn steps_for(&self, prompt: &str) -> VecDeque<MockStep> {
        if let Some(script) = &self.script {
            return script.iter().cloned().collect();
        }
        let mut steps = VecDeque::new();
        for word in prompt.split_whitespace() {
            if !self.word_delay.is_zero() {
                steps.push_back(MockStep::Delay(self.word_delay));
            }
            steps.push_back(MockStep::Emit(json!({ "kind": "text", "text": word })));
        }
        steps
    }
}

struct MockRun {
    steps: VecDeque<MockStep>,
    cancel: CancellationToken,
    finished: bool,
}

impl Engine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn start_run(
        &self,
        prompt: String,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> EngineStream {
        tracing::debug!(request_id = %options.request_id, "mock engine: run started");
        let run = MockRun {
            steps: self.steps_for(&prompt),
            cancel,
            finished: false,
        };

        stream::unfold(run, |mut run| async move {
            if run.finished {
                return None;
            }
            while let Some(step) = run.steps.pop_front() {
                match step {
                    MockStep::Emit(value) => {
                        if run.cancel.is_cancelled() {
                            run.finished = true;
                            return Some((Err(EngineError::Cancelled), run));
                        }
                        return Some((Ok(value), run));
                    }
                    MockStep::Delay(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = run.cancel.cancelled() => {
                                run.finished = true;
                                return Some((Err(EngineError::Cancelled), run));
                            }
                        }
                    }
                    MockStep::WaitFor(notify) => {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = run.cancel.cancelled() => {
                                run.finished = true;
                                return Some((Err(EngineError::Cancelled), run));
                            }
                        }
                    }
                    MockStep::Fail(message) => {
                        run.finished = true;
                        return Some((Err(EngineError::Failed { message }), run));
                    }
                    MockStep::AwaitCancel => {
                        run.cancel.cancelled().await;
                        run.finished = true;
                        return Some((Err(EngineError::Cancelled), run));
                    }
                }
            }
            None
        })
        .boxed()
    }
}
