//! Retry configuration with exponential backoff.
//!
//! Used by the filter runtime's `Retry` error policy. Attempt numbering
//! is zero-based: attempt 0 is the first try, so a config with
//! `max_retries = 2` allows three attempts total.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
}

/// Delays are capped so a misconfigured policy cannot stall a batch.
const MAX_DELAY: Duration = Duration::from_secs(30);

impl RetryConfig {
    /// Total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (zero-based): `base * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(ms).min(MAX_DELAY)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
        }
    }
}
