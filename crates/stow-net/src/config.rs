use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts and limits for one graph exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Longest stretch without any byte of progress before a read or write
    /// fails.
    pub timeout_ms: u64,
    /// How long a single read or write attempt waits before the progress
    /// check runs again.
    pub poll_interval_ms: u64,
    /// Largest payload a peer may announce.
    pub max_frame_size: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            poll_interval_ms: 10,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
