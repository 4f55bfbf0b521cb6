// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Due-observance evaluation.
//
// Given the observances fetched this cycle and the current time, work out
// which occurrences should be handed to the dispatcher:
//
//   - occurrences in `(previous_poll_time, now]` (everything up to `now` on
//     the very first run);
//   - occurrences that still have a `pending` record from an earlier cycle;
//
// minus anything already `submitted` or `failed`.  Occurrences older than the
// staleness limit are marked `failed` here and never reach the dispatcher.

use std::collections::BTreeSet;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use tracing::{debug, instrument, warn};

use isaround_core::config::ConnectorConfig;
use isaround_core::error::Result;
use isaround_core::recurrence;
use isaround_core::types::{DispatchStatus, OCCURRENCE_TIME_DIGITS, Observance, OccurrenceKey};

use crate::tracker::Tracker;

/// Lateness thresholds and expansion bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationPolicy {
    /// Beyond this an occurrence is still printed, but logged as late.
    pub grace_window: TimeDelta,
    /// Beyond this an occurrence is marked failed without printing.
    pub max_staleness: TimeDelta,
    /// Upper bound on occurrences produced per observance per cycle.
    pub max_occurrences: usize,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self::from(&ConnectorConfig::default())
    }
}

impl From<&ConnectorConfig> for EvaluationPolicy {
    fn from(config: &ConnectorConfig) -> Self {
        Self {
            grace_window: config.grace_window(),
            max_staleness: config.max_staleness(),
            max_occurrences: config.max_occurrences_per_observance.max(1),
        }
    }
}

/// One occurrence the dispatcher should try this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueOccurrence {
    pub observance: Observance,
    pub occurrence_time: DateTime<Utc>,
    /// Past the grace window.
    pub late: bool,
}

impl DueOccurrence {
    pub fn key(&self) -> OccurrenceKey {
        self.observance.key_at(self.occurrence_time)
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Earliest first.
    pub due: Vec<DueOccurrence>,
    /// Occurrences suppressed as stale during this pass.
    pub stale: Vec<OccurrenceKey>,
}

/// Work out which occurrences are due at `now`.
///
/// Stale occurrences are written to the tracker as `failed` as a side effect,
/// so a store failure surfaces here as `StoreUnavailable`.
#[instrument(skip_all, fields(%now, observances = observances.len()))]
pub fn evaluate(
    observances: &[Observance],
    now: DateTime<Utc>,
    tracker: &Tracker,
    policy: &EvaluationPolicy,
) -> Result<Evaluation> {
    let previous = tracker.last_poll_time()?;
    let staleness_floor = now.checked_sub_signed(policy.max_staleness);
    let mut evaluation = Evaluation::default();

    for observance in observances {
        let after = match observance.recurrence.period() {
            None => previous,
            // Recurring instances older than the staleness floor are never
            // materialised; a long outage should not fill the store.
            Some(_) => previous.max(staleness_floor),
        };

        let mut times: BTreeSet<DateTime<Utc>> =
            recurrence::expand(observance, after, now, policy.max_occurrences)
                .into_iter()
                .map(|t| t.trunc_subsecs(OCCURRENCE_TIME_DIGITS))
                .collect();

        // Retry carry-over.
        times.extend(
            tracker
                .pending_for(&observance.id)?
                .into_iter()
                .map(|r| r.key.occurrence_time)
                .filter(|t| *t <= now),
        );

        for occurrence_time in times {
            let key = observance.key_at(occurrence_time);
            match tracker.status(&key)? {
                Some(DispatchStatus::Submitted) | Some(DispatchStatus::Failed) => continue,
                Some(DispatchStatus::Pending) | None => {}
            }

            let lateness = now - occurrence_time;
            if lateness > policy.max_staleness {
                warn!(
                    %key,
                    late_by_secs = lateness.num_seconds(),
                    "occurrence is past the staleness limit, suppressing"
                );
                tracker.begin(&key)?;
                tracker.mark_failed(
                    &key,
                    &format!("stale: {}s past due", lateness.num_seconds()),
                )?;
                evaluation.stale.push(key);
                continue;
            }

            let late = lateness > policy.grace_window;
            if late {
                warn!(
                    %key,
                    title = %observance.title,
                    late_by_secs = lateness.num_seconds(),
                    "printing late occurrence"
                );
            }

            evaluation.due.push(DueOccurrence {
                observance: observance.clone(),
                occurrence_time,
                late,
            });
        }
    }

    evaluation.due.sort_by(|a, b| {
        a.occurrence_time
            .cmp(&b.occurrence_time)
            .then_with(|| a.observance.id.cmp(&b.observance.id))
    });

    debug!(
        due = evaluation.due.len(),
        stale = evaluation.stale.len(),
        ?previous,
        "evaluation complete"
    );
    Ok(evaluation)
}

/// Future occurrences within `lookahead` of `now`, earliest first.
pub fn upcoming(
    observances: &[Observance],
    now: DateTime<Utc>,
    lookahead: TimeDelta,
    cap: usize,
) -> Vec<(&Observance, DateTime<Utc>)> {
    let until = now.checked_add_signed(lookahead).unwrap_or(now);
    let mut out: Vec<_> = observances
        .iter()
        .flat_map(|o| {
            recurrence::expand(o, Some(now), until, cap)
                .into_iter()
                .map(move |t| (o, t))
        })
        .collect();
    out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
    out
}
