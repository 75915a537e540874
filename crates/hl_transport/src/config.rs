//! Transport tunables. All durations are milliseconds so the structs map
//! one-to-one onto JSON/TOML settings files.

use std::time::Duration;

use hl_proto::PaddingMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// How long a send waits for a peer's public key before failing.
    pub key_request_timeout_ms: u64,
    /// A received `typing` expires after this long without a stop.
    pub typing_timeout_ms: u64,
    pub padding: PaddingMode,
    pub backoff: BackoffConfig,
    pub queue: QueueLimits,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            key_request_timeout_ms: 5_000,
            typing_timeout_ms: 3_000,
            padding: PaddingMode::Buckets,
            backoff: BackoffConfig::default(),
            queue: QueueLimits::default(),
        }
    }
}

impl TransportConfig {
    pub fn key_request_timeout(&self) -> Duration {
        Duration::from_millis(self.key_request_timeout_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

/// Reconnection schedule: `initial_ms * 2^attempt`, capped at `max_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            max_attempts: 8,
        }
    }
}

impl BackoffConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }
}

/// Outbound queue capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueLimits {
    pub max_total: usize,
    pub max_per_recipient: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_total: 1_000,
            max_per_recipient: 200,
        }
    }
}
