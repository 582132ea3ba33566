use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chat_relay_protocol::{RequestStatus, StreamMessage};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub request_id: String,
    pub status: RequestStatus,
    pub total_messages: u64,
    pub last_updated: DateTime<Utc>,
    pub log_location: PathBuf,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("request already registered: {request_id}")]
    AlreadyRegistered { request_id: String },
    #[error("request not registered: {request_id}")]
    NotFound { request_id: String },
    #[error("request {request_id} already settled as {}", .status.as_str())]
    AlreadyTerminal {
        request_id: String,
        status: RequestStatus,
    },
}

/// In-memory directory of requests. Every mutation goes through one lock,
/// and readers get cloned snapshots, so status and message count are never
/// observed torn.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: Mutex<HashMap<String, RequestRecord>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        request_id: &str,
        log_location: PathBuf,
    ) -> Result<RequestRecord, RegistryError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(request_id) {
            return Err(RegistryError::AlreadyRegistered {
                request_id: request_id.to_string(),
            });
        }
        let record = RequestRecord {
            request_id: request_id.to_string(),
            status: RequestStatus::InProgress,
            total_messages: 0,
            last_updated: Utc::now(),
            log_location,
        };
        entries.insert(request_id.to_string(), record.clone());
        Ok(record)
    }

    /// Inserts a record rebuilt from disk after a restart.
    pub async fn restore(&self, record: RequestRecord) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&record.request_id) {
            return Err(RegistryError::AlreadyRegistered {
                request_id: record.request_id,
            });
        }
        entries.insert(record.request_id.clone(), record);
        Ok(())
    }

    /// Accounts for one entry that is already durable in the request's log.
    pub async fn record_append(
        &self,
        request_id: &str,
        message: &StreamMessage,
    ) -> Result<RequestRecord, RegistryError> {
        let mut entries = self.entries.lock().await;
        let record = entries
            .get_mut(request_id)
            .ok_or_else(|| RegistryError::NotFound {
                request_id: request_id.to_string(),
            })?;
        if record.status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal {
                request_id: request_id.to_string(),
                status: record.status,
            });
        }

        record.total_messages += 1;
        record.last_updated = Utc::now();
        if let Some(status) = message.terminal_status() {
            record.status = status;
        }
        Ok(record.clone())
    }

    /// Settles a request whose terminal entry could not be persisted, so
    /// status queries do not report it in progress forever.
    pub async fn mark_failed(&self, request_id: &str) -> Result<RequestRecord, RegistryError> {
        let mut entries = self.entries.lock().await;
        let record = entries
            .get_mut(request_id)
            .ok_or_else(|| RegistryError::NotFound {
                request_id: request_id.to_string(),
            })?;
        if !record.status.is_terminal() {
            record.status = RequestStatus::Failed;
            record.last_updated = Utc::now();
        }
        Ok(record.clone())
    }

    pub async fn get(&self, request_id: &str) -> Option<RequestRecord> {
        self.entries.lock().await.get(request_id).cloned()
    }

    pub async fn evict(&self, request_id: &str) -> Option<RequestRecord> {
        self.entries.lock().await.remove(request_id)
    }

    /// Removes and returns every terminal record last updated more than
    /// `retention` before `now`. In-progress records are never returned.
    pub async fn evict_expired(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Vec<RequestRecord> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .values()
            .filter(|record| record.status.is_terminal())
            .filter(|record| now.signed_duration_since(record.last_updated) > retention)
            .map(|record| record.request_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|request_id| entries.remove(&request_id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
