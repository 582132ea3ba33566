use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2470;
pub const DEFAULT_RETENTION_SECS: u64 = 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;

/// Server settings after CLI and environment resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub log_dir: PathBuf,
    /// How long a settled request stays resumable after its last update.
    pub retention: Duration,
    pub sweep_interval: Duration,
    /// How long a cancelled run may take to acknowledge before it is
    /// recorded as aborted anyway.
    pub cancel_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_dir: default_log_dir(),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
        }
    }
}

impl RelayConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("chat-relay").join("streams"))
        .unwrap_or_else(|| PathBuf::from(".").join(".chat-relay").join("streams"))
}
