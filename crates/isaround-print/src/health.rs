// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Health bookkeeping.
//
// Two concerns live here:
//   - a per-printer circuit breaker, so a printer that keeps failing is not
//     sent a job every cycle until it has had time to recover;
//   - the connector-wide health report surfaced to the operator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use isaround_core::types::{HealthReport, HealthStatus};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation — submissions pass through.
    Closed,
    /// Too many failures — submissions are deferred until the cooldown ends.
    Open,
    /// Cooldown expired — one probe submission is let through.
    HalfOpen,
}

/// Health of a single printer.
#[derive(Debug, Clone)]
pub struct PrinterHealth {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl Default for PrinterHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_error: None,
        }
    }
}

/// Circuit breakers for every printer the dispatcher talks to.
pub struct PrinterBreakers {
    printers: HashMap<String, PrinterHealth>,
    failure_threshold: u32,
}

impl PrinterBreakers {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            printers: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Whether a submission to `printer_id` may go out now.
    pub fn allow_request(&mut self, printer_id: &str) -> bool {
        let health = self.printers.entry(printer_id.to_string()).or_default();

        match health.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(opened_at) = health.opened_at else {
                    health.state = CircuitState::Closed;
                    return true;
                };
                let cooldown = cooldown_duration(health.consecutive_failures);
                if opened_at.elapsed() >= cooldown {
                    info!(printer = printer_id, "circuit half-open — allowing probe submission");
                    health.state = CircuitState::HalfOpen;
                    true
                } else {
                    debug!(
                        printer = printer_id,
                        remaining_ms = (cooldown - opened_at.elapsed()).as_millis(),
                        "circuit open — deferring submission"
                    );
                    false
                }
            }
            // The probe is still out.
            CircuitState::HalfOpen => false,
        }
    }

    pub fn record_success(&mut self, printer_id: &str) {
        let health = self.printers.entry(printer_id.to_string()).or_default();
        if health.state != CircuitState::Closed {
            info!(printer = printer_id, prev_state = ?health.state, "printer recovered — closing circuit");
        }
        *health = PrinterHealth::default();
    }

    pub fn record_failure(&mut self, printer_id: &str, error: &str) {
        let health = self.printers.entry(printer_id.to_string()).or_default();
        health.consecutive_failures += 1;
        health.last_error = Some(error.to_string());

        if health.state == CircuitState::HalfOpen {
            warn!(printer = printer_id, "probe failed — reopening circuit");
            health.state = CircuitState::Open;
            health.opened_at = Some(Instant::now());
        } else if health.consecutive_failures >= self.failure_threshold
            && health.state == CircuitState::Closed
        {
            warn!(
                printer = printer_id,
                failures = health.consecutive_failures,
                "opening circuit breaker for printer"
            );
            health.state = CircuitState::Open;
            health.opened_at = Some(Instant::now());
        }
    }

    /// Give back the half-open probe slot without a verdict, e.g. when the
    /// job failed before the printer was reached.  The circuit returns to
    /// `Open` with its cooldown already spent, so the next submission probes
    /// again.
    pub fn release_probe(&mut self, printer_id: &str) {
        if let Some(health) = self.printers.get_mut(printer_id)
            && health.state == CircuitState::HalfOpen
        {
            debug!(printer = printer_id, "probe inconclusive, releasing");
            health.state = CircuitState::Open;
        }
    }

    pub fn get(&self, printer_id: &str) -> Option<&PrinterHealth> {
        self.printers.get(printer_id)
    }
}

#[cfg(test)]
impl PrinterBreakers {
    /// Backdate the circuit so its cooldown has already run out.
    pub(crate) fn expire_cooldown(&mut self, printer_id: &str) {
        if let Some(health) = self.printers.get_mut(printer_id) {
            health.opened_at = Instant::now().checked_sub(Duration::from_secs(60));
        }
    }
}

/// Cooldown before a probe is allowed, growing with the failure count.
fn cooldown_duration(failures: u32) -> Duration {
    if failures >= 10 {
        Duration::from_secs(300)
    } else if failures >= 5 {
        Duration::from_secs(120)
    } else {
        Duration::from_secs(30)
    }
}

/// Builds the operator-facing [`HealthReport`] from cycle results.
#[derive(Debug, Clone)]
pub struct ConnectorHealth {
    report: HealthReport,
    source_failure_threshold: u32,
}

impl ConnectorHealth {
    pub fn new(source_failure_threshold: u32) -> Self {
        Self {
            report: HealthReport {
                store_available: true,
                ..Default::default()
            },
            source_failure_threshold: source_failure_threshold.max(1),
        }
    }

    pub fn report(&self) -> &HealthReport {
        &self.report
    }

    pub fn consecutive_source_failures(&self) -> u32 {
        self.report.consecutive_source_failures
    }

    pub fn record_source_failure(&mut self, at: DateTime<Utc>, error: &str) {
        self.report.consecutive_source_failures += 1;
        self.report.store_available = true;
        self.report.last_cycle_at = Some(at);
        self.report.last_error = Some(error.to_string());
        self.refresh_status();
    }

    pub fn record_store_failure(&mut self, at: DateTime<Utc>, error: &str) {
        self.report.store_available = false;
        self.report.last_cycle_at = Some(at);
        self.report.last_error = Some(error.to_string());
        self.refresh_status();
    }

    /// A cycle ran to completion.
    pub fn record_cycle(&mut self, at: DateTime<Utc>, dispatched: u64, failed: u64) {
        self.report.consecutive_source_failures = 0;
        self.report.store_available = true;
        self.report.last_cycle_at = Some(at);
        self.report.last_success_at = Some(at);
        self.report.last_error = None;
        self.report.dispatched_total += dispatched;
        self.report.failed_total += failed;
        self.refresh_status();
    }

    fn refresh_status(&mut self) {
        let status = if !self.report.store_available {
            HealthStatus::Unavailable
        } else if self.report.consecutive_source_failures >= self.source_failure_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        if status != self.report.status {
            match status {
                HealthStatus::Healthy => info!("connector healthy"),
                HealthStatus::Degraded => warn!(
                    failures = self.report.consecutive_source_failures,
                    "observance source keeps failing — connector degraded"
                ),
                HealthStatus::Unavailable => warn!("dispatch store unreachable — printing suspended"),
            }
        }
        self.report.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRINTER: &str = "ipp://printer.local:631/ipp/print";

    #[test]
    fn new_printer_allows_requests() {
        let mut breakers = PrinterBreakers::new(3);
        assert!(breakers.allow_request(PRINTER));
    }

    #[test]
    fn circuit_opens_after_threshold() {
        let mut breakers = PrinterBreakers::new(3);
        breakers.record_failure(PRINTER, "timeout");
        breakers.record_failure(PRINTER, "timeout");
        assert!(breakers.allow_request(PRINTER));

        breakers.record_failure(PRINTER, "timeout");
        assert!(!breakers.allow_request(PRINTER));
        assert_eq!(breakers.get(PRINTER).unwrap().state, CircuitState::Open);
    }

    #[test]
    fn success_resets_circuit() {
        let mut breakers = PrinterBreakers::new(2);
        breakers.record_failure(PRINTER, "error");
        breakers.record_failure(PRINTER, "error");
        assert!(!breakers.allow_request(PRINTER));

        breakers.record_success(PRINTER);
        assert!(breakers.allow_request(PRINTER));
        assert_eq!(breakers.get(PRINTER).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let mut breakers = PrinterBreakers::new(1);
        breakers.record_failure(PRINTER, "connection refused");
        breakers.expire_cooldown(PRINTER);

        assert!(breakers.allow_request(PRINTER));
        assert_eq!(breakers.get(PRINTER).unwrap().state, CircuitState::HalfOpen);
        assert!(!breakers.allow_request(PRINTER));
    }

    #[test]
    fn released_probe_can_be_retried() {
        let mut breakers = PrinterBreakers::new(1);
        breakers.record_failure(PRINTER, "connection refused");
        breakers.expire_cooldown(PRINTER);
        assert!(breakers.allow_request(PRINTER));

        breakers.release_probe(PRINTER);
        assert_eq!(breakers.get(PRINTER).unwrap().state, CircuitState::Open);
        assert!(breakers.allow_request(PRINTER));
    }

    #[test]
    fn release_probe_leaves_closed_circuit_alone() {
        let mut breakers = PrinterBreakers::new(3);
        breakers.record_failure(PRINTER, "timeout");
        breakers.release_probe(PRINTER);
        let health = breakers.get(PRINTER).unwrap();
        assert_eq!(health.state, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 1);
    }

    #[test]
    fn source_failures_degrade_then_recover() {
        let mut health = ConnectorHealth::new(2);
        let now = Utc::now();

        health.record_source_failure(now, "connection refused");
        assert_eq!(health.report().status, HealthStatus::Healthy);
        health.record_source_failure(now, "connection refused");
        assert_eq!(health.report().status, HealthStatus::Degraded);

        health.record_cycle(now, 1, 0);
        assert_eq!(health.report().status, HealthStatus::Healthy);
        assert_eq!(health.report().dispatched_total, 1);
        assert!(health.report().last_error.is_none());
    }

    #[test]
    fn store_failure_is_unavailable() {
        let mut health = ConnectorHealth::new(3);
        health.record_store_failure(Utc::now(), "disk full");
        assert_eq!(health.report().status, HealthStatus::Unavailable);
        assert!(!health.report().store_available);
    }
}
