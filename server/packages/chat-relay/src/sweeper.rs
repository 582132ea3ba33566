use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::RequestRegistry;
use crate::stream_log::StreamLog;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub failed_deletions: Vec<String>,
}

/// Reclaims settled requests once they have been idle for the retention
/// window. In-progress requests are never touched.
#[derive(Debug, Clone)]
pub struct CleanupSweeper {
    registry: Arc<RequestRegistry>,
    log: StreamLog,
    retention: Duration,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(
        registry: Arc<RequestRegistry>,
        log: StreamLog,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            log,
            retention,
            interval,
        }
    }

    /// Evicts expired entries, then deletes their logs. A failed deletion
    /// is logged and left for the next startup scan.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let expired = self.registry.evict_expired(now, self.retention).await;
        let mut report = SweepReport::default();

        for record in expired {
            if let Err(err) = self.log.delete(&record.request_id).await {
                tracing::warn!(
                    request_id = %record.request_id,
                    path = %record.log_location.display(),
                    error = %err,
                    "sweeper: failed to delete stream log"
                );
                report.failed_deletions.push(record.request_id.clone());
            }
            report.evicted.push(record.request_id);
        }

        if !report.evicted.is_empty() {
            tracing::info!(
                evicted = report.evicted.len(),
                failed_deletions = report.failed_deletions.len(),
                "sweeper: reclaimed settled requests"
            );
        }
        report
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once(Utc::now()).await;
                    }
                }
            }
            tracing::debug!("sweeper stopped");
        })
    }
}
