use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Workspace-level scheduler configuration.
///
/// Embedded in the persisted manifest so a restarted workspace comes back
/// with the same policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Directory holding the manifest, hook records, logs and the ledger db
    pub state_dir: PathBuf,
    /// Ledger backend selection
    pub ledger_backend: LedgerBackend,
    /// Interval between scheduling ticks
    pub tick_interval_ms: u64,
    /// Default attempt cap for beads that do not override it
    pub default_max_attempts: u32,
    /// Base delay before a requeued bead becomes eligible again
    pub retry_base_delay_ms: u64,
    /// Cap on the exponential requeue backoff
    pub retry_max_delay_ms: u64,
    /// A session missing heartbeats for this long is considered crashed
    pub heartbeat_timeout_secs: u64,
    /// Hard cap on a single runtime invocation
    pub invoke_timeout_ms: u64,
    /// Bounded local retries for workspace-layer (git) failures
    pub workspace_retry_limit: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    Memory,
    Sqlite,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./.rigyard"),
            ledger_backend: LedgerBackend::Memory,
            tick_interval_ms: 500,
            default_max_attempts: 3,
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 300_000,
            heartbeat_timeout_secs: 120,
            invoke_timeout_ms: 3_600_000,
            workspace_retry_limit: 2,
        }
    }
}

impl Config {
    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir.join("manifest.json")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.state_dir.join("hooks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn database_url(&self) -> String {
        format!(
            "sqlite:{}?mode=rwc",
            self.state_dir.join("ledger.db").display()
        )
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    /// Exponential requeue backoff: `base * 2^(attempt - 1)`, capped.
    /// Immediate re-dispatch is deliberately not the default.
    pub fn requeue_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}
