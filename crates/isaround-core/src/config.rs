// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connector configuration.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};

/// Persistent connector settings.
///
/// Missing fields fall back to their defaults, so a config file only needs
/// the service URL, credentials and printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Base URL of the Is Around service, e.g. `https://isaround.example.org`.
    pub app_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Target printer (ipp:// or ipps:// URI).
    pub printer_uri: Option<String>,
    /// Copies per printed document.
    pub copies: u32,
    /// Seconds between poll cycles.
    pub poll_interval_secs: u64,
    /// Maximum print submissions per occurrence.
    pub retry_budget: u32,
    /// Occurrences older than this are still printed but logged as late.
    pub grace_window_secs: u64,
    /// Occurrences older than this are never printed.
    pub max_staleness_secs: u64,
    /// Per-call timeout for the observance source and the printer.
    pub request_timeout_secs: u64,
    /// Settled dispatch records older than this are pruned.
    pub retention_days: u32,
    pub max_concurrent_dispatches: usize,
    /// Consecutive failed fetches before health turns degraded.
    pub source_failure_threshold: u32,
    /// Consecutive printer failures before the circuit breaker opens.
    pub printer_failure_threshold: u32,
    /// Horizon for listing upcoming occurrences.
    pub recurrence_lookahead_days: u32,
    pub max_occurrences_per_observance: usize,
    pub log_level: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            app_url: String::new(),
            username: None,
            password: None,
            printer_uri: None,
            copies: 1,
            poll_interval_secs: 30,
            retry_budget: 3,
            grace_window_secs: 15 * 60,
            max_staleness_secs: 24 * 60 * 60,
            request_timeout_secs: 30,
            retention_days: 90,
            max_concurrent_dispatches: 1,
            source_failure_threshold: 3,
            printer_failure_threshold: 3,
            recurrence_lookahead_days: 14,
            max_occurrences_per_observance: 64,
            log_level: "info".into(),
        }
    }
}

impl ConnectorConfig {
    /// Reject settings the poll loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.app_url.trim().is_empty() {
            return Err(ConnectorError::Config("app_url must be set".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConnectorError::Config("poll_interval_secs must be > 0".into()));
        }
        if self.retry_budget == 0 {
            return Err(ConnectorError::Config("retry_budget must be > 0".into()));
        }
        if self.max_staleness_secs < self.grace_window_secs {
            return Err(ConnectorError::Config(
                "max_staleness_secs must not be shorter than grace_window_secs".into(),
            ));
        }
        if self.copies == 0 {
            return Err(ConnectorError::Config("copies must be > 0".into()));
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(ConnectorError::Config(
                "max_concurrent_dispatches must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn grace_window(&self) -> TimeDelta {
        secs_delta(self.grace_window_secs)
    }

    pub fn max_staleness(&self) -> TimeDelta {
        secs_delta(self.max_staleness_secs)
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.retention_days))
    }

    pub fn lookahead(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.recurrence_lookahead_days))
    }

    /// Copy of this config with the password masked, for display.
    pub fn redacted(&self) -> Self {
        Self {
            password: self.password.as_ref().map(|_| "********".into()),
            ..self.clone()
        }
    }
}

fn secs_delta(secs: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}
