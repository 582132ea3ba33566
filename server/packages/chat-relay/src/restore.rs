//! Rebuilds the registry from the stream log directory after a restart.

use chat_relay_protocol::{RequestStatus, StreamMessage};
use chrono::{DateTime, Utc};

use crate::registry::{RequestRecord, RequestRegistry};
use crate::stream_log::{StreamLog, StreamLogError};

pub const INTERRUPTED_REASON: &str = "interrupted by server restart";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub settled: usize,
    pub interrupted: usize,
    pub discarded: usize,
}

/// Registers every log on disk. Logs that end in a terminal entry come back
/// with that status; logs without one lost their producer with the previous
/// process and are settled as failed.
pub async fn restore_from_disk(
    log: &StreamLog,
    registry: &RequestRegistry,
) -> Result<RestoreReport, StreamLogError> {
    let mut report = RestoreReport::default();

    for request_id in log.list().await? {
        match restore_one(log, registry, &request_id).await {
            Ok(true) => report.settled += 1,
            Ok(false) => report.interrupted += 1,
            Err(err) => {
                tracing::warn!(
                    request_id = %request_id,
                    error = %err,
                    "restore: discarding unreadable stream log"
                );
                if let Err(err) = log.delete(&request_id).await {
                    tracing::warn!(request_id = %request_id, error = %err, "restore: delete failed");
                }
                report.discarded += 1;
            }
        }
    }

    if report != RestoreReport::default() {
        tracing::info!(
            settled = report.settled,
            interrupted = report.interrupted,
            discarded = report.discarded,
            "restored requests from stream logs"
        );
    }
    Ok(report)
}

/// Returns whether the log was already settled.
async fn restore_one(
    log: &StreamLog,
    registry: &RequestRegistry,
    request_id: &str,
) -> Result<bool, StreamLogError> {
    let entries = log.read(request_id, 0).await?;
    let location = log.location(request_id);

    let settled = entries
        .last()
        .and_then(|entry| entry.message.terminal_status().map(|status| (entry.index, status)));

    let (status, total_messages, last_updated) = match settled {
        Some((last_index, status)) => {
            let modified = tokio::fs::metadata(&location)
                .await
                .and_then(|metadata| metadata.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            (status, last_index + 1, modified)
        }
        None => {
            let mut writer = log.reopen(request_id).await?;
            let index = writer
                .append(&StreamMessage::error(INTERRUPTED_REASON))
                .await?;
            (RequestStatus::Failed, index + 1, Utc::now())
        }
    };

    let record = RequestRecord {
        request_id: request_id.to_string(),
        status,
        total_messages,
        last_updated,
        log_location: location,
    };
    if let Err(err) = registry.restore(record).await {
        tracing::warn!(request_id, error = %err, "restore: request already registered");
    }
    Ok(settled.is_some())
}
