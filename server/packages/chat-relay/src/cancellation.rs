use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("request already has an active run: {request_id}")]
    AlreadyActive { request_id: String },
}

/// One cancellation token per in-flight request. Cancellation is
/// cooperative: the engine observes the token at its own checkpoints.
///
/// Uses a blocking lock so [`EndOnDrop`] can release a handle from `Drop`;
/// no critical section awaits.
#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    handles: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self, request_id: &str) -> Result<CancellationToken, CoordinatorError> {
        let mut handles = self.handles();
        if handles.contains_key(request_id) {
            return Err(CoordinatorError::AlreadyActive {
                request_id: request_id.to_string(),
            });
        }
        let token = CancellationToken::new();
        handles.insert(request_id.to_string(), token.clone());
        Ok(token)
    }

    /// Signals the request's token. Returns whether a live request was found.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.handles().get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn end(&self, request_id: &str) {
        self.handles().remove(request_id);
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        self.handles().contains_key(request_id)
    }

    pub fn active_count(&self) -> usize {
        self.handles().len()
    }

    /// Signals every live request, e.g. on shutdown. Returns how many.
    pub fn cancel_all(&self) -> usize {
        let handles = self.handles();
        for token in handles.values() {
            token.cancel();
        }
        handles.len()
    }
}

/// Releases a request's handle when dropped, whatever path the owner
/// leaves by.
#[derive(Debug)]
pub struct EndOnDrop {
    coordinator: Arc<CancellationCoordinator>,
    request_id: String,
}

impl EndOnDrop {
    pub fn new(coordinator: Arc<CancellationCoordinator>, request_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            request_id: request_id.into(),
        }
    }
}

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        self.coordinator.end(&self.request_id);
    }
}
