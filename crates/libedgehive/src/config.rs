use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capacity of every module mailbox.
pub const MAILBOX_CAPACITY: usize = 1024;

/// Timeout applied to synchronous operations called with a zero timeout.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Rewrites a zero timeout to the default.
pub fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_MESSAGE_TIMEOUT
    } else {
        timeout
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub mailbox_capacity: usize,
    pub default_timeout_ms: u64,
}

impl BusConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Like [`effective_timeout`] but using this bus's default.
    pub fn timeout_or_default(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            self.default_timeout()
        } else {
            timeout
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: MAILBOX_CAPACITY,
            default_timeout_ms: DEFAULT_MESSAGE_TIMEOUT.as_millis() as u64,
        }
    }
}
