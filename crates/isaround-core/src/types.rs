// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for observance polling and print dispatch.

use chrono::{DateTime, NaiveDate, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of an observance on the Is Around service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservanceId(pub String);

impl ObservanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObservanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an observance repeats after its anchor occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Recurrence {
    /// One-off observance.
    #[default]
    Once,
    Daily,
    Weekly,
    /// Repeats every `n` days.
    EveryDays(u32),
}

impl Recurrence {
    /// Distance between consecutive occurrences, `None` for one-off entries.
    pub fn period(&self) -> Option<TimeDelta> {
        match self {
            Self::Once => None,
            Self::Daily => Some(TimeDelta::days(1)),
            Self::Weekly => Some(TimeDelta::weeks(1)),
            Self::EveryDays(0) => None,
            Self::EveryDays(n) => Some(TimeDelta::days(i64::from(*n))),
        }
    }
}

/// Opaque reference to the PDF printed for an occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum DocumentRef {
    /// The attendance sheet exported by the service for a given date.
    AttendanceExport { date: NaiveDate },
    /// An absolute URL or a path relative to the service base URL.
    Url { url: String },
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttendanceExport { date } => write!(f, "attendance-export:{date}"),
            Self::Url { url } => f.write_str(url),
        }
    }
}

/// A scheduled entry fetched from the Is Around service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observance {
    pub id: ObservanceId,
    /// Display text, used for logs and as the printer job name.
    pub title: String,
    /// Next (or only) time the observance becomes due.
    pub occurrence_time: DateTime<Utc>,
    #[serde(default)]
    pub recurrence: Recurrence,
    pub document_ref: DocumentRef,
}

impl Observance {
    /// Key for this observance at one concrete occurrence time.
    pub fn key_at(&self, occurrence_time: DateTime<Utc>) -> OccurrenceKey {
        OccurrenceKey::new(self.id.clone(), occurrence_time)
    }
}

/// "This observance, this time" — identity of one occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OccurrenceKey {
    pub observance_id: ObservanceId,
    pub occurrence_time: DateTime<Utc>,
}

/// Sub-second digits kept in occurrence times; the dispatch store
/// writes timestamps at microsecond precision.
pub const OCCURRENCE_TIME_DIGITS: u16 = 6;

impl OccurrenceKey {
    /// Build a key, truncating the time to [`OCCURRENCE_TIME_DIGITS`] so a
    /// key compares equal to the same key read back from the store.
    pub fn new(observance_id: ObservanceId, occurrence_time: DateTime<Utc>) -> Self {
        Self {
            observance_id,
            occurrence_time: occurrence_time.trunc_subsecs(OCCURRENCE_TIME_DIGITS),
        }
    }
}

impl std::fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.observance_id, self.occurrence_time.to_rfc3339())
    }
}

/// Lifecycle states of a dispatch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    /// Identified as due; not yet accepted by the printer.
    Pending,
    /// Accepted by the print service. Never printed again.
    Submitted,
    /// Retry budget exhausted or suppressed as stale. Terminal until reset.
    Failed,
}

/// Persisted bookkeeping for one occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub key: OccurrenceKey,
    pub status: DispatchStatus,
    /// Number of print submissions issued for this occurrence.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn pending(key: OccurrenceKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: DispatchStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of handing one occurrence to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchOutcome {
    /// The print service accepted the job.
    Dispatched,
    /// A previous attempt already succeeded; nothing was sent.
    AlreadyDispatched,
    /// Submission failed; will be retried on the next poll cycle.
    Retryable,
    /// Retry budget exhausted or the error cannot be retried.
    PermanentFailure,
    /// The printer's circuit breaker is open; no attempt was consumed.
    Deferred,
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network blip, timeout, busy printer — safe to retry on a later cycle.
    Transient,
    /// Someone must act on the printer (paper, jam, door).
    UserAction,
    /// Retrying cannot help — missing document, unsupported format.
    Permanent,
}

/// Overall connector health as surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// The observance source has failed too many consecutive cycles.
    Degraded,
    /// The dispatch store is unreachable; nothing is printed.
    Unavailable,
}

/// Snapshot published by the poll scheduler after every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub consecutive_source_failures: u32,
    pub store_available: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dispatched_total: u64,
    pub failed_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_time_is_truncated_to_microseconds() {
        let precise = DateTime::parse_from_rfc3339("2026-06-07T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let key = OccurrenceKey::new(ObservanceId::new("n"), precise);
        assert_eq!(key.occurrence_time.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(key, OccurrenceKey::new(ObservanceId::new("n"), key.occurrence_time));
    }

    #[test]
    fn recurrence_wire_format() {
        let weekly: Recurrence = serde_json::from_str("\"weekly\"").expect("weekly");
        assert_eq!(weekly, Recurrence::Weekly);

        let every: Recurrence = serde_json::from_str(r#"{"everyDays": 3}"#).expect("everyDays");
        assert_eq!(every.period(), Some(TimeDelta::days(3)));
    }

    #[test]
    fn zero_day_recurrence_has_no_period() {
        assert!(Recurrence::EveryDays(0).period().is_none());
        assert!(Recurrence::Once.period().is_none());
    }

    #[test]
    fn occurrence_key_display_includes_time() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let key = OccurrenceKey::new(ObservanceId::new("obs-7"), at);
        assert_eq!(key.to_string(), "obs-7@2026-03-01T09:30:00+00:00");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&DispatchStatus::Submitted).expect("serialize");
        assert_eq!(json, "\"submitted\"");
    }
}
