//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and recovery knobs shared by the store, its timelines and queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the background sync. Default: 3500ms.
    pub sync_interval_ms: u64,
    /// Minimum spacing between two non-forced syncs. Default: 1750ms.
    pub throttle_ms: u64,
    /// Delay before retrying a failed sync. Default: 2500ms.
    pub retry_interval_ms: u64,
    /// Window during which same-target mergeable pushes collapse into one
    /// transaction. Default: 500ms.
    pub merge_window_ms: u64,
    /// Re-push pending edits discarded by a reload on top of the fresh
    /// history. Default: true.
    pub rebase_on_reload: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 3500,
            throttle_ms: 1750,
            retry_interval_ms: 2500,
            merge_window_ms: 500,
            rebase_on_reload: true,
        }
    }
}

impl SyncConfig {
    /// Config for testing (short timers, same merge window).
    pub fn for_testing() -> Self {
        Self {
            sync_interval_ms: 100,
            throttle_ms: 50,
            retry_interval_ms: 80,
            merge_window_ms: 500,
            rebase_on_reload: true,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn merge_window(&self) -> Duration {
        Duration::from_millis(self.merge_window_ms)
    }
}
