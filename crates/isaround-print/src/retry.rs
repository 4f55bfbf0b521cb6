// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error classification and poll backoff.
//
// Print failures are classified into Transient (retry next cycle), UserAction
// (retry next cycle, someone has to fix the printer) and Permanent (stop now).
// Source failures drive an exponential backoff on the poll loop so an
// unreachable service is not hammered every interval.

use std::time::Duration;

use isaround_core::error::ConnectorError;
use isaround_core::types::ErrorClass;
use tracing::debug;

/// Classify a `ConnectorError` for retry decisions.
pub fn classify_error(err: &ConnectorError) -> ErrorClass {
    match err {
        ConnectorError::PrintSubmissionFailed(detail) => classify_print_detail(detail),
        ConnectorError::SourceUnavailable(_) => ErrorClass::Transient,
        ConnectorError::Timeout { .. } => ErrorClass::Transient,
        ConnectorError::StoreUnavailable(_) => ErrorClass::Transient,

        ConnectorError::NoPrinterConfigured => ErrorClass::UserAction,

        ConnectorError::SourceMalformed(_) => ErrorClass::Permanent,
        ConnectorError::UnknownKey(_) => ErrorClass::Permanent,
        ConnectorError::Config(_) => ErrorClass::Permanent,
        ConnectorError::Serialization(_) => ErrorClass::Permanent,

        ConnectorError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorClass::UserAction
            }
            _ => ErrorClass::Transient,
        },
    }
}

/// Classify a print submission error detail string.
fn classify_print_detail(detail: &str) -> ErrorClass {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("server-error")
    {
        return ErrorClass::Transient;
    }

    // Printer physical state.
    if lower.contains("media-empty")
        || lower.contains("toner-empty")
        || lower.contains("door-open")
        || lower.contains("cover-open")
        || lower.contains("paper-jam")
        || lower.contains("media-jam")
        || lower.contains("marker-supply")
    {
        return ErrorClass::UserAction;
    }

    // The document itself is the problem; resending it cannot help.
    if lower.contains("client-error-document-format")
        || lower.contains("client-error-not-possible")
        || lower.contains("document not found")
        || lower.contains("status 404")
        || lower.contains("status 410")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Transient
}

/// Backoff applied to the poll loop after consecutive source failures.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure (normally the poll interval).
    pub base_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl BackoffConfig {
    /// Backoff anchored on the poll interval, capped at 32 intervals.
    pub fn for_interval(interval: Duration) -> Self {
        Self {
            base_delay: interval,
            max_delay: interval.saturating_mul(32),
        }
    }
}

/// Delay before the next fetch after `failures` consecutive failures.
///
/// delay = min(base * 2^(failures-1) + jitter, max_delay); zero when healthy.
pub fn backoff_delay(failures: u32, config: &BackoffConfig) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let attempt = failures - 1;
    let base_ms = config.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(10));
    let total_ms = exp_ms.saturating_add(jitter(base_ms, attempt));
    let capped_ms = total_ms.min(config.max_delay.as_millis() as u64);

    debug!(failures, delay_ms = capped_ms, "poll backoff");
    Duration::from_millis(capped_ms)
}

/// Deterministic spread in [0, base/4) so several connectors pointed at the
/// same service do not retry in lockstep.
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64 + 1).wrapping_mul(6364136223846793005);
    hash % (base_ms / 4).max(1)
}
