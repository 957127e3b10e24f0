use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {0}")]
    Invalid(&'static str),
}

/// Process-wide engine settings, built once and handed to every component.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Rebuilds allowed after a roster change. `0` still reconciles the cache but never retries.
    pub max_roster_reconciliations: u32,
    pub transmit_timeout_ms: u64,
    pub worker_queue_depth: usize,
    pub retry_backoff_initial_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub retry_window_secs: u64,
    pub retry_batch: usize,
    pub retry_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_roster_reconciliations: 3,
            transmit_timeout_ms: 15_000,
            worker_queue_depth: 64,
            retry_backoff_initial_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            retry_window_secs: 24 * 60 * 60,
            retry_batch: 16,
            retry_tick_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_queue_depth == 0 {
            return Err(ConfigError::Invalid("worker_queue_depth"));
        }
        if self.transmit_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transmit_timeout_ms"));
        }
        if self.retry_tick_ms == 0 {
            return Err(ConfigError::Invalid("retry_tick_ms"));
        }
        if self.retry_batch == 0 {
            return Err(ConfigError::Invalid("retry_batch"));
        }
        if self.retry_backoff_initial_ms > self.retry_backoff_max_ms {
            return Err(ConfigError::Invalid("retry_backoff_initial_ms"));
        }
        Ok(())
    }

    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_timeout_ms)
    }

    pub fn retry_tick(&self) -> Duration {
        Duration::from_millis(self.retry_tick_ms)
    }

    /// Delay before try number `tries` (1-based), before jitter.
    pub fn backoff_for(&self, tries: u32) -> u64 {
        let factor = 1u64 << (tries.saturating_sub(1).min(16));
        self.retry_backoff_initial_ms
            .saturating_mul(factor)
            .min(self.retry_backoff_max_ms)
    }
}
