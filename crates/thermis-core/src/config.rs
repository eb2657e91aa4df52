// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dispatcher configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThermisError};
use crate::types::OperationKind;

/// Range the settle delay must fall in for the physical device to be ready.
const SETTLE_DELAY_RANGE_MS: std::ops::RangeInclusive<u64> = 300..=1000;

/// Dispatch, retry, and timeout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retry budget for each job.
    pub max_retries: u32,
    /// Backoff base; attempt `n` waits `base * 2^n` plus jitter.
    pub base_retry_delay_ms: u64,
    /// Ceiling for a single backoff.
    pub max_retry_delay_ms: u64,
    /// Upper bound of the random jitter added to each backoff.
    pub retry_jitter_ms: u64,
    /// Mandatory pause between consecutive interactions with one device.
    pub settle_delay_ms: u64,
    pub print_timeout_ms: u64,
    pub drawer_timeout_ms: u64,
    pub cut_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub close_timeout_ms: u64,
    /// Drop the retry of a job that was in flight when its queue was cleared.
    pub suppress_retry_after_clear: bool,
    /// Length of a LAN discovery window.
    pub discovery_window_ms: u64,
    /// TCP port assumed for LAN addresses given without one.
    pub lan_port: u16,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 3_000,
            max_retry_delay_ms: 60_000,
            retry_jitter_ms: 500,
            settle_delay_ms: 500,
            print_timeout_ms: 30_000,
            drawer_timeout_ms: 10_000,
            cut_timeout_ms: 10_000,
            probe_timeout_ms: 5_000,
            close_timeout_ms: 5_000,
            suppress_retry_after_clear: true,
            discovery_window_ms: 10_000,
            lan_port: 9100,
        }
    }
}

impl DispatchConfig {
    /// Load a JSON config file.  Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !SETTLE_DELAY_RANGE_MS.contains(&self.settle_delay_ms) {
            return Err(ThermisError::Config(format!(
                "settle_delay_ms must be within {}..={}, got {}",
                SETTLE_DELAY_RANGE_MS.start(),
                SETTLE_DELAY_RANGE_MS.end(),
                self.settle_delay_ms
            )));
        }
        if self.base_retry_delay_ms == 0 {
            return Err(ThermisError::Config("base_retry_delay_ms must be positive".into()));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ThermisError::Config(
                "max_retry_delay_ms must not be below base_retry_delay_ms".into(),
            ));
        }
        let timeouts = [
            ("print_timeout_ms", self.print_timeout_ms),
            ("drawer_timeout_ms", self.drawer_timeout_ms),
            ("cut_timeout_ms", self.cut_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("close_timeout_ms", self.close_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ThermisError::Config(format!("{name} must be positive")));
        }
        Ok(())
    }

    /// Time bound for one attempt of the given operation, gate included.
    pub fn operation_timeout(&self, kind: OperationKind) -> Duration {
        let ms = match kind {
            OperationKind::Print => self.print_timeout_ms,
            OperationKind::OpenDrawer => self.drawer_timeout_ms,
            OperationKind::CutPaper => self.cut_timeout_ms,
            OperationKind::CheckConnection => self.probe_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }
}
