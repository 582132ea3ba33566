use std::sync::Arc;

use chat_relay_protocol::{ResumeResponse, StatusResponse};

use crate::registry::RequestRegistry;
use crate::stream_log::{validate_request_id, StreamLog, StreamLogError};

/// Read-only answers about a request, valid at any point of its life,
/// including after it has been swept.
#[derive(Debug, Clone)]
pub struct ResumeService {
    registry: Arc<RequestRegistry>,
    log: StreamLog,
}

impl ResumeService {
    pub fn new(registry: Arc<RequestRegistry>, log: StreamLog) -> Self {
        Self { registry, log }
    }

    pub async fn status(&self, request_id: &str) -> StatusResponse {
        match self.registry.get(request_id).await {
            Some(record) => StatusResponse {
                request_id: record.request_id,
                status: record.status.into(),
                total_messages: record.total_messages,
                last_updated: Some(record.last_updated),
            },
            None => StatusResponse::not_found(request_id),
        }
    }

    /// Entries from `from_index` as of one registry snapshot. The log may
    /// already hold entries the registry has not accounted for yet; those
    /// are left for the next call so `messages`, `total_messages` and
    /// `is_complete` always agree.
    pub async fn resume(
        &self,
        request_id: &str,
        from_index: u64,
    ) -> Result<ResumeResponse, StreamLogError> {
        if validate_request_id(request_id).is_err() {
            return Ok(empty_resume());
        }
        let Some(snapshot) = self.registry.get(request_id).await else {
            return Ok(empty_resume());
        };

        let mut messages = if from_index >= snapshot.total_messages {
            Vec::new()
        } else {
            self.log.read(request_id, from_index).await?
        };
        messages.retain(|entry| entry.index < snapshot.total_messages);

        tracing::debug!(
            request_id,
            from_index,
            returned = messages.len(),
            total_messages = snapshot.total_messages,
            status = snapshot.status.as_str(),
            "resume served"
        );

        Ok(ResumeResponse {
            messages,
            total_messages: snapshot.total_messages,
            is_complete: snapshot.status.is_terminal(),
        })
    }
}

/// Unknown or evicted requests resume as empty and complete: there is
/// nothing left to wait for.
fn empty_resume() -> ResumeResponse {
    ResumeResponse {
        messages: Vec::new(),
        total_messages: 0,
        is_complete: true,
    }
}
