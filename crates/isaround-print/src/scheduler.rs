// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Poll scheduler.
//
// Drives the cycle  Idle -> Fetching -> Evaluating -> Dispatching ->
// Persisting -> Idle  on a fixed interval.  Any failure aborts the rest of
// the cycle and the loop waits for the next tick; nothing is retried inside
// a cycle.  Shutdown is only observed between cycles, so a cycle that has
// started always finishes its dispatches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use isaround_core::config::ConnectorConfig;
use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::{DispatchOutcome, HealthReport};

use crate::dispatcher::Dispatcher;
use crate::evaluator::{self, EvaluationPolicy};
use crate::health::ConnectorHealth;
use crate::retry::{BackoffConfig, backoff_delay};
use crate::source::ObservanceSource;
use crate::tracker::Tracker;

/// Where the scheduler currently is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Evaluating,
    Dispatching,
    Persisting,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub at: DateTime<Utc>,
    pub observances: usize,
    pub due: usize,
    pub stale: usize,
    pub dispatched: usize,
    pub already_dispatched: usize,
    pub retryable: usize,
    pub failed: usize,
    pub deferred: usize,
    pub pruned: usize,
}

impl CycleReport {
    fn new(cycle_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            at,
            observances: 0,
            due: 0,
            stale: 0,
            dispatched: 0,
            already_dispatched: 0,
            retryable: 0,
            failed: 0,
            deferred: 0,
            pruned: 0,
        }
    }

    fn tally(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Dispatched => self.dispatched += 1,
            DispatchOutcome::AlreadyDispatched => self.already_dispatched += 1,
            DispatchOutcome::Retryable => self.retryable += 1,
            DispatchOutcome::PermanentFailure => self.failed += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
        }
    }
}

/// Releases the single-cycle flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs poll cycles against one tracker.
pub struct PollScheduler {
    source: Arc<dyn ObservanceSource>,
    tracker: Arc<Tracker>,
    dispatcher: Arc<Dispatcher>,
    policy: EvaluationPolicy,
    poll_interval: Duration,
    fetch_timeout: Duration,
    retention: TimeDelta,
    max_concurrent: usize,
    running: AtomicBool,
    phase: Mutex<CyclePhase>,
    health: Mutex<ConnectorHealth>,
    health_tx: watch::Sender<HealthReport>,
}

impl PollScheduler {
    pub fn new(
        config: &ConnectorConfig,
        source: Arc<dyn ObservanceSource>,
        tracker: Arc<Tracker>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let health = ConnectorHealth::new(config.source_failure_threshold);
        let (health_tx, _) = watch::channel(health.report().clone());
        Self {
            source,
            tracker,
            dispatcher,
            policy: EvaluationPolicy::from(config),
            poll_interval: config.poll_interval(),
            fetch_timeout: config.request_timeout(),
            retention: config.retention(),
            max_concurrent: config.max_concurrent_dispatches.max(1),
            running: AtomicBool::new(false),
            phase: Mutex::new(CyclePhase::Idle),
            health: Mutex::new(health),
            health_tx,
        }
    }

    /// Health reports, updated after every cycle.
    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.health_tx.subscribe()
    }

    pub fn health(&self) -> HealthReport {
        self.health_lock().report().clone()
    }

    pub fn phase(&self) -> CyclePhase {
        match self.phase.lock() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    fn set_phase(&self, phase: CyclePhase) {
        match self.phase.lock() {
            Ok(mut current) => *current = phase,
            Err(poisoned) => *poisoned.into_inner() = phase,
        }
        debug!(?phase, "cycle phase");
    }

    fn health_lock(&self) -> MutexGuard<'_, ConnectorHealth> {
        match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update_health(&self, update: impl FnOnce(&mut ConnectorHealth)) {
        let report = {
            let mut health = self.health_lock();
            update(&mut health);
            health.report().clone()
        };
        self.health_tx.send_replace(report);
    }

    /// Run one cycle now.
    pub async fn run_cycle(&self) -> Result<Option<CycleReport>> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`.
    ///
    /// Returns `Ok(None)` without doing anything when another cycle is still
    /// running; overlapping triggers are dropped, not queued.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<Option<CycleReport>> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("previous poll cycle still running, skipping this trigger");
            return Ok(None);
        }
        let _guard = CycleGuard(&self.running);

        let cycle_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %cycle_id);
        let result = self.cycle(cycle_id, now).instrument(span).await;
        self.set_phase(CyclePhase::Idle);
        result.map(Some)
    }

    async fn cycle(&self, cycle_id: Uuid, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::new(cycle_id, now);

        if let Err(e) = self.tracker.load() {
            error!(error = %e, "dispatch store unavailable, aborting cycle");
            self.update_health(|h| h.record_store_failure(now, &e.to_string()));
            return Err(e);
        }

        self.set_phase(CyclePhase::Fetching);
        let fetched = tokio::time::timeout(self.fetch_timeout, self.source.fetch())
            .await
            .unwrap_or_else(|_| {
                Err(ConnectorError::Timeout {
                    operation: "observance fetch",
                    after: self.fetch_timeout,
                })
            });
        let observances = match fetched {
            Ok(observances) => observances,
            Err(e) => {
                warn!(error = %e, "observance fetch failed, aborting cycle");
                self.update_health(|h| h.record_source_failure(now, &e.to_string()));
                return Err(e);
            }
        };
        report.observances = observances.len();

        self.set_phase(CyclePhase::Evaluating);
        let evaluation = self
            .with_store(now, || {
                evaluator::evaluate(&observances, now, &self.tracker, &self.policy)
            })?;
        report.due = evaluation.due.len();
        report.stale = evaluation.stale.len();

        self.set_phase(CyclePhase::Dispatching);
        let results: Vec<_> = stream::iter(evaluation.due)
            .map(|due| {
                let dispatcher = Arc::clone(&self.dispatcher);
                async move {
                    let result = dispatcher.dispatch(&due.observance, due.occurrence_time).await;
                    (due.key(), result)
                }
            })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        // Every dispatch has run to completion; now surface the first store
        // failure, if any.
        let mut store_error = None;
        for (key, result) in results {
            match result {
                Ok(outcome) => report.tally(outcome),
                Err(e) => {
                    error!(%key, error = %e, "dispatch aborted");
                    store_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = store_error {
            self.update_health(|h| h.record_store_failure(now, &e.to_string()));
            return Err(e);
        }

        self.set_phase(CyclePhase::Persisting);
        self.with_store(now, || self.tracker.persist(now))?;
        if let Some(cutoff) = now.checked_sub_signed(self.retention) {
            report.pruned = self.with_store(now, || self.tracker.prune(cutoff))?;
        }

        let failed = (report.failed + report.stale) as u64;
        self.update_health(|h| h.record_cycle(now, report.dispatched as u64, failed));

        info!(
            observances = report.observances,
            due = report.due,
            dispatched = report.dispatched,
            retryable = report.retryable,
            failed = report.failed,
            stale = report.stale,
            deferred = report.deferred,
            "poll cycle complete"
        );
        Ok(report)
    }

    /// Run a tracker operation, reporting a failure as a store outage.
    fn with_store<T>(&self, now: DateTime<Utc>, op: impl FnOnce() -> Result<T>) -> Result<T> {
        op().inspect_err(|e| {
            error!(error = %e, "dispatch store failure, aborting cycle");
            self.update_health(|h| h.record_store_failure(now, &e.to_string()));
        })
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// The cycle runs inside the select arm, so a shutdown request that
    /// arrives mid-cycle is seen once that cycle has finished.  The tracker
    /// is flushed before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let backoff = BackoffConfig::for_interval(self.poll_interval);
        let mut resume_at: Option<Instant> = None;

        info!(interval_secs = self.poll_interval.as_secs(), "poll scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(at) = resume_at
                        && Instant::now() < at
                    {
                        debug!("backing off after source failures");
                        continue;
                    }
                    resume_at = None;

                    if let Err(e) = self.run_cycle().await {
                        let failures = self.health_lock().consecutive_source_failures();
                        if failures > 0 {
                            let delay = backoff_delay(failures, &backoff);
                            resume_at = Some(Instant::now() + delay.saturating_sub(self.poll_interval));
                        }
                        debug!(error = %e, failures, "cycle failed; waiting for next tick");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, stopping poll scheduler");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.tracker.flush() {
            warn!(error = %e, "failed to flush dispatch store on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use isaround_core::types::{
        DispatchStatus, DocumentRef, HealthStatus, Observance, ObservanceId, Recurrence,
    };

    use crate::dispatcher::tests::FakePrintService;
    use crate::print_service::PrintService;
    use crate::tracker::tests::SwitchableStore;

    /// Source that returns a fixed list, or fails while `failing` is set.
    struct StaticSource {
        observances: Mutex<Vec<Observance>>,
        failing: AtomicBool,
        fetches: AtomicUsize,
    }

    impl StaticSource {
        fn new(observances: Vec<Observance>) -> Self {
            Self {
                observances: Mutex::new(observances),
                failing: AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ObservanceSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<Observance>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConnectorError::SourceUnavailable("connection refused".into()));
            }
            Ok(self.observances.lock().expect("lock").clone())
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, day, hour, minute, 0).unwrap()
    }

    fn observance(id: &str, time: DateTime<Utc>) -> Observance {
        Observance {
            id: ObservanceId::new(id),
            title: format!("Observance {id}"),
            occurrence_time: time,
            recurrence: Recurrence::Once,
            document_ref: DocumentRef::AttendanceExport {
                date: time.date_naive(),
            },
        }
    }

    fn config(budget: u32) -> ConnectorConfig {
        ConnectorConfig {
            app_url: "http://isaround.test".into(),
            printer_uri: Some("ipp://printer.test/ipp/print".into()),
            retry_budget: budget,
            poll_interval_secs: 1,
            printer_failure_threshold: 100,
            ..Default::default()
        }
    }

    fn scheduler(
        config: &ConnectorConfig,
        tracker: Arc<Tracker>,
        source: Arc<StaticSource>,
        printer: Arc<FakePrintService>,
    ) -> Arc<PollScheduler> {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&tracker),
            printer as Arc<dyn PrintService>,
            config.printer_uri.clone().unwrap_or_default(),
            config.retry_budget,
            config.request_timeout(),
            config.printer_failure_threshold,
        ));
        Arc::new(PollScheduler::new(config, source, tracker, dispatcher))
    }

    #[tokio::test]
    async fn only_due_observances_are_dispatched() {
        let now = at(7, 10, 0);
        let source = Arc::new(StaticSource::new(vec![
            observance("a", at(7, 9, 0)),
            observance("b", at(7, 10, 0)),
            observance("tomorrow", at(8, 10, 0)),
        ]));
        let printer = Arc::new(FakePrintService::accepting());
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(3), Arc::clone(&tracker), source, Arc::clone(&printer));

        let report = s.run_cycle_at(now).await.expect("cycle").expect("ran");
        assert_eq!(report.due, 2);
        assert_eq!(report.dispatched, 2);
        assert_eq!(printer.count(), 2);
        assert!(
            tracker
                .get(&observance("tomorrow", at(8, 10, 0)).key_at(at(8, 10, 0)))
                .expect("read")
                .is_none()
        );
        assert_eq!(s.phase(), CyclePhase::Idle);
        assert_eq!(tracker.last_poll_time().expect("read"), Some(now));
    }

    #[tokio::test]
    async fn due_occurrence_is_printed_within_one_interval() {
        let due_at = at(7, 10, 0);
        let source = Arc::new(StaticSource::new(vec![observance("live", due_at)]));
        let printer = Arc::new(FakePrintService::accepting());
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(3), tracker, source, Arc::clone(&printer));

        s.run_cycle_at(due_at - TimeDelta::seconds(30)).await.expect("cycle");
        assert_eq!(printer.count(), 0);

        s.run_cycle_at(due_at + TimeDelta::seconds(1)).await.expect("cycle");
        assert_eq!(printer.count(), 1);

        s.run_cycle_at(due_at + TimeDelta::seconds(31)).await.expect("cycle");
        assert_eq!(printer.count(), 1);
    }

    #[tokio::test]
    async fn restart_does_not_reprint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("dispatch.db");
        let obs = observance("sunday", at(7, 10, 0));
        let key = obs.key_at(obs.occurrence_time);

        let printer = Arc::new(FakePrintService::accepting());
        {
            let tracker = Arc::new(Tracker::open(&db).expect("tracker"));
            let source = Arc::new(StaticSource::new(vec![obs.clone()]));
            let s = scheduler(&config(3), tracker, source, Arc::clone(&printer));
            s.run_cycle_at(at(7, 10, 1)).await.expect("cycle");
        }
        assert_eq!(printer.count(), 1);

        let tracker = Arc::new(Tracker::open(&db).expect("reopen"));
        assert!(tracker.is_dispatched(&key).expect("read"));

        let source = Arc::new(StaticSource::new(vec![obs]));
        let s = scheduler(&config(3), tracker, source, Arc::clone(&printer));
        s.run_cycle_at(at(7, 10, 2)).await.expect("cycle");
        assert_eq!(printer.count(), 1);
    }

    #[tokio::test]
    async fn long_outage_suppresses_stale_occurrences() {
        let obs = observance("old", at(3, 10, 0));
        let key = obs.key_at(obs.occurrence_time);
        let source = Arc::new(StaticSource::new(vec![obs]));
        let printer = Arc::new(FakePrintService::accepting());
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(3), Arc::clone(&tracker), source, Arc::clone(&printer));

        let report = s.run_cycle_at(at(7, 10, 0)).await.expect("cycle").expect("ran");
        assert_eq!(report.stale, 1);
        assert_eq!(printer.count(), 0);

        let record = tracker.get(&key).expect("read").expect("record");
        assert_eq!(record.status, DispatchStatus::Failed);
        assert_eq!(record.attempts, 0);
        assert_eq!(s.health().failed_total, 1);
    }

    #[tokio::test]
    async fn retries_carry_across_cycles_until_accepted() {
        let obs = observance("flaky", at(7, 10, 0));
        let key = obs.key_at(obs.occurrence_time);
        let source = Arc::new(StaticSource::new(vec![obs]));
        let printer = Arc::new(FakePrintService::scripted(vec!["connection reset"; 2]));
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(3), Arc::clone(&tracker), source, Arc::clone(&printer));

        for minute in 1..=5 {
            s.run_cycle_at(at(7, 10, minute)).await.expect("cycle");
        }

        let record = tracker.get(&key).expect("read").expect("record");
        assert_eq!(record.status, DispatchStatus::Submitted);
        assert_eq!(record.attempts, 3);
        assert_eq!(printer.count(), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_stops_further_attempts() {
        let obs = observance("broken", at(7, 10, 0));
        let key = obs.key_at(obs.occurrence_time);
        let source = Arc::new(StaticSource::new(vec![obs]));
        let printer = Arc::new(FakePrintService::rejecting());
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(2), Arc::clone(&tracker), source, Arc::clone(&printer));

        for minute in 1..=6 {
            s.run_cycle_at(at(7, 10, minute)).await.expect("cycle");
        }

        let record = tracker.get(&key).expect("read").expect("record");
        assert_eq!(record.status, DispatchStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert_eq!(printer.count(), 2);
    }

    #[tokio::test]
    async fn store_outage_aborts_cycle_and_reports_unavailable() {
        let down = Arc::new(AtomicBool::new(false));
        let tracker = Arc::new(
            Tracker::with_store(Box::new(SwitchableStore::new(Arc::clone(&down))))
                .expect("tracker"),
        );
        let source = Arc::new(StaticSource::new(vec![observance("x", at(7, 10, 0))]));
        let printer = Arc::new(FakePrintService::accepting());
        let s = scheduler(&config(3), tracker, Arc::clone(&source), Arc::clone(&printer));
        let health = s.subscribe();

        down.store(true, Ordering::SeqCst);
        let err = s.run_cycle_at(at(7, 10, 1)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::StoreUnavailable(_)));
        assert_eq!(printer.count(), 0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(health.borrow().status, HealthStatus::Unavailable);

        down.store(false, Ordering::SeqCst);
        s.run_cycle_at(at(7, 10, 2)).await.expect("cycle");
        assert_eq!(printer.count(), 1);
        assert_eq!(health.borrow().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn repeated_source_failures_degrade_health() {
        let source = Arc::new(StaticSource::new(vec![observance("y", at(7, 10, 0))]));
        let printer = Arc::new(FakePrintService::accepting());
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(3), Arc::clone(&tracker), Arc::clone(&source), printer);

        source.failing.store(true, Ordering::SeqCst);
        for minute in 1..=3 {
            let err = s.run_cycle_at(at(7, 10, minute)).await.unwrap_err();
            assert!(matches!(err, ConnectorError::SourceUnavailable(_)));
        }
        assert_eq!(s.health().status, HealthStatus::Degraded);
        assert_eq!(s.health().consecutive_source_failures, 3);
        // A failed fetch never moves the window.
        assert_eq!(tracker.last_poll_time().expect("read"), None);

        source.failing.store(false, Ordering::SeqCst);
        s.run_cycle_at(at(7, 10, 4)).await.expect("cycle");
        assert_eq!(s.health().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn concurrent_dispatch_prints_each_occurrence_once() {
        let now = at(7, 10, 0);
        let source = Arc::new(StaticSource::new(
            (0..6).map(|i| observance(&format!("c{i}"), at(7, 9, 50 + i))).collect(),
        ));
        let printer = Arc::new(FakePrintService::slow(Duration::from_millis(20)));
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let config = ConnectorConfig {
            max_concurrent_dispatches: 3,
            ..config(3)
        };
        let s = scheduler(&config, Arc::clone(&tracker), Arc::clone(&source), Arc::clone(&printer));

        let report = s.run_cycle_at(now).await.expect("cycle").expect("ran");
        assert_eq!(report.due, 6);
        assert_eq!(report.dispatched, 6);
        assert_eq!(report.retryable + report.failed + report.deferred, 0);
        assert_eq!(printer.count(), 6);

        // Submissions start earliest first even with several in flight.
        let expected: Vec<_> = (0..6).map(|i| format!("Observance c{i}")).collect();
        assert_eq!(*printer.jobs.lock().expect("jobs"), expected);

        for i in 0..6 {
            let time = at(7, 9, 50 + i);
            let record = tracker
                .get(&observance(&format!("c{i}"), time).key_at(time))
                .expect("read")
                .expect("record");
            assert_eq!(record.status, DispatchStatus::Submitted);
            assert_eq!(record.attempts, 1);
        }

        let again = s.run_cycle_at(at(7, 10, 1)).await.expect("cycle").expect("ran");
        assert_eq!(again.due, 0);
        assert_eq!(printer.count(), 6);
    }

    #[tokio::test]
    async fn precise_occurrence_time_is_not_reprinted_after_crash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dispatch.db");
        let observances = crate::source::parse_observances(
            r#"[{"id": "n", "occurrenceTime": "2026-06-07T10:00:00.123456789Z"}]"#,
        )
        .expect("parse");
        let printer = Arc::new(FakePrintService::accepting());
        let config = config(3);

        // Crash after the submission is recorded but before the cycle persists.
        {
            let tracker = Arc::new(Tracker::open(&path).expect("open"));
            let dispatcher = Dispatcher::new(
                Arc::clone(&tracker),
                Arc::clone(&printer) as Arc<dyn PrintService>,
                "ipp://printer.test/ipp/print",
                3,
                config.request_timeout(),
                config.printer_failure_threshold,
            );
            let outcome = dispatcher
                .dispatch(&observances[0], observances[0].occurrence_time)
                .await
                .expect("dispatch");
            assert_eq!(outcome, DispatchOutcome::Dispatched);
        }

        let tracker = Arc::new(Tracker::open(&path).expect("reopen"));
        let key = observances[0].key_at(observances[0].occurrence_time);
        assert!(tracker.is_dispatched(&key).expect("read"));

        let source = Arc::new(StaticSource::new(observances));
        let s = scheduler(&config, Arc::clone(&tracker), source, Arc::clone(&printer));
        s.run_cycle_at(at(7, 10, 1)).await.expect("cycle");

        assert_eq!(printer.count(), 1);
        assert_eq!(tracker.records().expect("records").len(), 1);
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let source = Arc::new(StaticSource::new(vec![observance("slow", at(7, 10, 0))]));
        let printer = Arc::new(FakePrintService::slow(Duration::from_millis(300)));
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(3), tracker, source, Arc::clone(&printer));

        let first = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.run_cycle_at(at(7, 10, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = s.run_cycle_at(at(7, 10, 1)).await.expect("second");
        assert!(second.is_none());

        let first = first.await.expect("join").expect("cycle");
        assert!(first.is_some());
        assert_eq!(printer.count(), 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let due = Utc::now() - TimeDelta::minutes(1);
        let source = Arc::new(StaticSource::new(vec![observance("now", due)]));
        let printer = Arc::new(FakePrintService::accepting());
        let tracker = Arc::new(Tracker::open_in_memory().expect("tracker"));
        let s = scheduler(&config(3), Arc::clone(&tracker), Arc::clone(&source), Arc::clone(&printer));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&s).run(rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).expect("send shutdown");
        handle.await.expect("join");

        assert!(source.fetches.load(Ordering::SeqCst) >= 1);
        assert_eq!(printer.count(), 1);
        assert!(tracker.is_dispatched(&observance("now", due).key_at(due)).expect("read"));
    }
}
