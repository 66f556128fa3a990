//! Bounded retry with exponential backoff for effect attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry bounds applied to executor and validation failures of one effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per effect, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// No retries and no waiting.
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    /// Retry up to `max_attempts` without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before attempt `next_attempt` (2-based; the first attempt never waits).
    pub fn backoff_before(&self, next_attempt: u32) -> Duration {
        if next_attempt <= 1 || self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (next_attempt - 2) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err("retry.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err("retry.max_backoff_ms must be >= retry.initial_backoff_ms".to_string());
        }
        Ok(())
    }
}
