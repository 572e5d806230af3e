use std::time::Duration;

use apm_core::Address;
use serde::{Deserialize, Serialize};

/// Node-level configuration for aggregation, dispatch, and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectorConfig {
    /// Address this node is reachable at. Membership events carrying this
    /// address instantiate local workers instead of remote references.
    pub local_address: Address,
    /// Interval between scheduled flushes of every aggregation window.
    pub persistence_interval_ms: u64,
    /// Active-generation size that triggers an early flush.
    pub backlog_threshold: usize,
    /// Upper bound on `ask` round trips, local or remote.
    pub remote_timeout_ms: u64,
    /// Bounded inbox capacity of every local worker.
    pub inbox_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            local_address: Address::new("127.0.0.1", 11800),
            persistence_interval_ms: 3_000,
            backlog_threshold: 10_000,
            remote_timeout_ms: 5_000,
            inbox_capacity: 1_024,
        }
    }
}

impl CollectorConfig {
    /// Flush interval, at least one millisecond.
    #[must_use]
    pub fn persistence_interval(&self) -> Duration {
        Duration::from_millis(self.persistence_interval_ms.max(1))
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}
