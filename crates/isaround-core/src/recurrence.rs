// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Recurrence expansion.
//
// Turns an observance's anchor time and recurrence rule into the concrete
// occurrence timestamps inside a half-open window `(after, until]`.  The
// output is always bounded by a caller-supplied cap, so a daily observance
// anchored years ago cannot generate an unbounded list.

use chrono::{DateTime, Utc};

use crate::types::{Observance, Recurrence};

/// Occurrences of `anchor` repeated per `recurrence` that fall in
/// `(after, until]`, earliest first, at most `cap` of them.
///
/// `after = None` means the window is open on the left.  Occurrences before
/// the anchor never exist.
pub fn occurrences_between(
    anchor: DateTime<Utc>,
    recurrence: Recurrence,
    after: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
    cap: usize,
) -> Vec<DateTime<Utc>> {
    if cap == 0 || anchor > until {
        return Vec::new();
    }

    let in_window = |t: DateTime<Utc>| after.is_none_or(|a| t > a) && t <= until;

    let Some(period) = recurrence.period() else {
        return if in_window(anchor) { vec![anchor] } else { Vec::new() };
    };

    // Skip straight to the first period boundary after `after`.
    let first_index = match after {
        Some(a) if a >= anchor => {
            let elapsed = (a - anchor).num_seconds();
            elapsed / period.num_seconds() + 1
        }
        _ => 0,
    };

    let mut out = Vec::new();
    let mut index = first_index;
    while out.len() < cap {
        let Some(offset) = index
            .checked_mul(period.num_seconds())
            .and_then(chrono::TimeDelta::try_seconds)
        else {
            break;
        };
        let Some(t) = anchor.checked_add_signed(offset) else {
            break;
        };
        if t > until {
            break;
        }
        if in_window(t) {
            out.push(t);
        }
        index += 1;
    }
    out
}

/// Convenience wrapper over [`occurrences_between`] for one observance.
pub fn expand(
    observance: &Observance,
    after: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
    cap: usize,
) -> Vec<DateTime<Utc>> {
    occurrences_between(
        observance.occurrence_time,
        observance.recurrence,
        after,
        until,
        cap,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn once_inside_window() {
        let got = occurrences_between(at(3, 9), Recurrence::Once, Some(at(3, 8)), at(3, 10), 8);
        assert_eq!(got, vec![at(3, 9)]);
    }

    #[test]
    fn window_is_open_left_closed_right() {
        // Exactly at `after` is excluded, exactly at `until` is included.
        assert!(occurrences_between(at(3, 9), Recurrence::Once, Some(at(3, 9)), at(3, 12), 8).is_empty());
        assert_eq!(
            occurrences_between(at(3, 9), Recurrence::Once, Some(at(3, 8)), at(3, 9), 8),
            vec![at(3, 9)]
        );
    }

    #[test]
    fn future_anchor_yields_nothing() {
        assert!(occurrences_between(at(10, 9), Recurrence::Daily, None, at(3, 9), 8).is_empty());
    }

    #[test]
    fn daily_skips_to_window() {
        let got = occurrences_between(at(1, 9), Recurrence::Daily, Some(at(5, 12)), at(8, 9), 8);
        assert_eq!(got, vec![at(6, 9), at(7, 9), at(8, 9)]);
    }

    #[test]
    fn daily_boundary_on_after_is_excluded() {
        let got = occurrences_between(at(1, 9), Recurrence::Daily, Some(at(4, 9)), at(5, 9), 8);
        assert_eq!(got, vec![at(5, 9)]);
    }

    #[test]
    fn weekly_expansion() {
        let got = occurrences_between(at(1, 9), Recurrence::Weekly, None, at(20, 9), 8);
        assert_eq!(got, vec![at(1, 9), at(8, 9), at(15, 9)]);
    }

    #[test]
    fn cap_bounds_output() {
        let anchor = at(1, 0);
        let until = anchor + TimeDelta::days(10_000);
        let got = occurrences_between(anchor, Recurrence::Daily, None, until, 5);
        assert_eq!(got.len(), 5);
        assert_eq!(got[0], anchor);
    }

    #[test]
    fn zero_cap_yields_nothing() {
        assert!(occurrences_between(at(1, 9), Recurrence::Once, None, at(2, 9), 0).is_empty());
    }
}
