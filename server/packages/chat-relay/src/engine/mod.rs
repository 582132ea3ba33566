//! The external message producer a request drives.
//!
//! An engine turns a prompt into a lazy sequence of domain messages. The
//! sequence ends on completion, yields an [`EngineError`] on failure, and
//! yields [`EngineError::Cancelled`] once it has honoured the run's
//! cancellation token.

use std::path::PathBuf;

use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod mock;
pub mod process;

pub use mock::{MockEngine, MockStep};
pub use process::{ProcessEngine, ProcessEngineConfig};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub request_id: String,
    pub session_id: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run cancelled")]
    Cancelled,
    #[error("failed to spawn engine `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine exited with {}{}", describe_code(.code), describe_stderr(.stderr_tail))]
    Exited {
        code: Option<i32>,
        stderr_tail: Option<String>,
    },
    #[error("engine I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{message}")]
    Failed { message: String },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (killed by signal)".to_string(),
    }
}

fn describe_stderr(stderr_tail: &Option<String>) -> String {
    match stderr_tail {
        Some(tail) if !tail.is_empty() => format!(": {tail}"),
        _ => String::new(),
    }
}

pub type EngineStream = BoxStream<'static, Result<Value, EngineError>>;

pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn start_run(
        &self,
        prompt: String,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> EngineStream;
}
