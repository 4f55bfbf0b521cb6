// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print dispatcher.
//
// One call to `dispatch` makes at most one print submission for one
// occurrence.  Failures are not retried here; the occurrence stays `pending`
// and the next poll cycle picks it up again until the retry budget is spent.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::{DispatchOutcome, DispatchStatus, ErrorClass, Observance};

use crate::health::PrinterBreakers;
use crate::print_service::PrintService;
use crate::retry::classify_error;
use crate::tracker::Tracker;

/// Submits due occurrences to the print service.
pub struct Dispatcher {
    tracker: Arc<Tracker>,
    printer: Arc<dyn PrintService>,
    printer_id: String,
    retry_budget: u32,
    timeout: Duration,
    breakers: Mutex<PrinterBreakers>,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<Tracker>,
        printer: Arc<dyn PrintService>,
        printer_id: impl Into<String>,
        retry_budget: u32,
        timeout: Duration,
        printer_failure_threshold: u32,
    ) -> Self {
        Self {
            tracker,
            printer,
            printer_id: printer_id.into(),
            retry_budget: retry_budget.max(1),
            timeout,
            breakers: Mutex::new(PrinterBreakers::new(printer_failure_threshold)),
        }
    }

    pub fn printer_id(&self) -> &str {
        &self.printer_id
    }

    fn breakers(&self) -> MutexGuard<'_, PrinterBreakers> {
        match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Try to print one occurrence.
    ///
    /// Tracker failures are returned as errors; print failures are folded
    /// into the outcome.
    #[instrument(
        skip_all,
        fields(observance = %observance.id, %occurrence_time, printer = %self.printer_id)
    )]
    pub async fn dispatch(
        &self,
        observance: &Observance,
        occurrence_time: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let key = observance.key_at(occurrence_time);

        let record = self.tracker.begin(&key)?;
        match record.status {
            DispatchStatus::Submitted => {
                debug!(%key, "already submitted, skipping");
                return Ok(DispatchOutcome::AlreadyDispatched);
            }
            DispatchStatus::Failed => {
                debug!(%key, "occurrence already failed, skipping");
                return Ok(DispatchOutcome::PermanentFailure);
            }
            DispatchStatus::Pending => {}
        }

        // A lowered budget can leave a pending record that is already spent.
        if record.attempts >= self.retry_budget {
            self.tracker.mark_failed(&key, "retry budget exhausted")?;
            return Ok(DispatchOutcome::PermanentFailure);
        }

        if !self.breakers().allow_request(&self.printer_id) {
            info!(%key, "printer circuit open, deferring");
            return Ok(DispatchOutcome::Deferred);
        }

        let record = match self.tracker.record_attempt(&key) {
            Ok(record) => record,
            Err(e) => {
                self.breakers().release_probe(&self.printer_id);
                return Err(e);
            }
        };
        debug!(%key, attempt = record.attempts, budget = self.retry_budget, "submitting print job");

        let submission = tokio::time::timeout(
            self.timeout,
            self.printer
                .submit(&observance.document_ref, &self.printer_id, &observance.title),
        )
        .await
        .unwrap_or(Err(ConnectorError::Timeout {
            operation: "print submission",
            after: self.timeout,
        }));

        match submission {
            Ok(receipt) => {
                self.breakers().record_success(&self.printer_id);
                self.tracker.mark_submitted(&key)?;
                info!(
                    %key,
                    title = %observance.title,
                    attempts = record.attempts,
                    job_id = ?receipt.printer_job_id,
                    document_hash = %receipt.document_hash,
                    "occurrence dispatched"
                );
                Ok(DispatchOutcome::Dispatched)
            }
            Err(err) => {
                let message = err.to_string();
                let class = classify_error(&err);

                // A bad document says nothing about the printer.
                if class == ErrorClass::Permanent {
                    self.breakers().release_probe(&self.printer_id);
                } else {
                    self.breakers().record_failure(&self.printer_id, &message);
                }
                self.tracker.note_error(&key, &message)?;

                if class == ErrorClass::Permanent {
                    self.tracker.mark_failed(&key, &message)?;
                    return Ok(DispatchOutcome::PermanentFailure);
                }
                if record.attempts >= self.retry_budget {
                    self.tracker.mark_failed(&key, &message)?;
                    return Ok(DispatchOutcome::PermanentFailure);
                }

                warn!(
                    %key,
                    attempt = record.attempts,
                    budget = self.retry_budget,
                    ?class,
                    error = %message,
                    "print submission failed, will retry next cycle"
                );
                Ok(DispatchOutcome::Retryable)
            }
        }
    }
}
