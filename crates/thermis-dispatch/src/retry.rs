// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry policy: exponential backoff with bounded random jitter.
//
// The delay only decides when a failed job is put back at the tail of its
// device queue.  It never blocks a queue loop.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use thermis_core::config::DispatchConfig;
use thermis_core::types::FailureReason;

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay; attempt `n` waits `base * 2^n`.
    pub base_delay: Duration,
    /// Ceiling for a single delay, jitter included.
    pub max_delay: Duration,
    /// Jitter is drawn uniformly from `[0, jitter]`.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after this delay.
    RetryAfter(Duration),
    /// The reason is terminal.
    GiveUp,
    /// Retryable, but the budget is spent.
    Exhausted,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    /// Decide on a job that failed with `reason` after `attempt_count`
    /// previous retries.
    pub fn decide(&self, reason: FailureReason, attempt_count: u32, max_retries: u32) -> RetryDecision {
        if !reason.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if attempt_count >= max_retries {
            debug!(attempt_count, max_retries, %reason, "retry budget exhausted");
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAfter(self.delay(attempt_count))
    }

    /// `min(base * 2^attempt + jitter, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(jitter))
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(16));
        let total_ms = exp_ms.saturating_add(jitter.as_millis() as u64);
        Duration::from_millis(total_ms.min(self.max_delay.as_millis() as u64))
    }
}
