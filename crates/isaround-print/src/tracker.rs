// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Occurrence tracker — the single owner of dispatch records.
//
// Keeps an in-memory view of every record for point lookups and writes every
// state transition through to the durable store before updating that view.
// A crash therefore loses at most the job that was in flight, never a
// submission that was already recorded.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use isaround_core::error::{ConnectorError, Result};
use isaround_core::types::{DispatchRecord, DispatchStatus, ObservanceId, OccurrenceKey};

use crate::store::{DispatchStore, SqliteStore};

struct TrackerState {
    store: Box<dyn DispatchStore>,
    records: HashMap<OccurrenceKey, DispatchRecord>,
    last_poll_time: Option<DateTime<Utc>>,
}

impl TrackerState {
    /// Persist `record`, then make it visible in memory.
    fn write(&mut self, record: DispatchRecord) -> Result<DispatchRecord> {
        self.store.upsert(&record)?;
        self.records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    fn existing(&self, key: &OccurrenceKey) -> Result<DispatchRecord> {
        self.records.get(key).cloned().ok_or_else(|| {
            error!(%key, "state transition requested for unknown occurrence");
            ConnectorError::UnknownKey(key.clone())
        })
    }
}

/// Tracks which observance occurrences have been dispatched.
///
/// All methods take `&self`; a mutex serialises transitions so that
/// concurrent `begin` calls for the same key observe one record.
pub struct Tracker {
    state: Mutex<TrackerState>,
}

impl Tracker {
    /// Open the SQLite store at `path` and load every record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_store(Box::new(SqliteStore::open(path)?))
    }

    /// Tracker over a fresh in-memory store (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_store(Box::new(SqliteStore::open_in_memory()?))
    }

    /// Wrap an arbitrary store and bulk-load its contents.
    pub fn with_store(store: Box<dyn DispatchStore>) -> Result<Self> {
        let tracker = Self {
            state: Mutex::new(TrackerState {
                store,
                records: HashMap::new(),
                last_poll_time: None,
            }),
        };
        tracker.load()?;
        Ok(tracker)
    }

    fn state(&self) -> Result<MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| ConnectorError::StoreUnavailable("tracker lock poisoned".into()))
    }

    /// Acquire the store for a poll cycle: check it is reachable and refresh
    /// the in-memory view from it.  Returns the number of records loaded.
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<usize> {
        let mut state = self.state()?;
        state.store.ping()?;

        let records = state.store.load_all()?;
        let last_poll_time = state.store.last_poll_time()?;

        state.records = records
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        state.last_poll_time = last_poll_time;

        debug!(count = state.records.len(), ?last_poll_time, "tracker loaded");
        Ok(state.records.len())
    }

    /// Close out a poll cycle: record `poll_time` as the new window start and
    /// flush the store.
    #[instrument(skip(self))]
    pub fn persist(&self, poll_time: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        state.store.set_last_poll_time(poll_time)?;
        state.store.checkpoint()?;
        state.last_poll_time = Some(poll_time);
        Ok(())
    }

    /// Flush the store without moving the poll window (shutdown path).
    pub fn flush(&self) -> Result<()> {
        self.state()?.store.checkpoint()
    }

    /// End of the previous completed poll cycle, if any.
    pub fn last_poll_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state()?.last_poll_time)
    }

    /// `true` if the occurrence has already been accepted by the printer.
    pub fn is_dispatched(&self, key: &OccurrenceKey) -> Result<bool> {
        Ok(self.status(key)? == Some(DispatchStatus::Submitted))
    }

    pub fn status(&self, key: &OccurrenceKey) -> Result<Option<DispatchStatus>> {
        Ok(self.get(key)?.map(|r| r.status))
    }

    pub fn get(&self, key: &OccurrenceKey) -> Result<Option<DispatchRecord>> {
        Ok(self.state()?.records.get(key).cloned())
    }

    /// Pending records belonging to one observance (retry carry-over).
    pub fn pending_for(&self, observance_id: &ObservanceId) -> Result<Vec<DispatchRecord>> {
        Ok(self
            .state()?
            .records
            .values()
            .filter(|r| r.status == DispatchStatus::Pending && &r.key.observance_id == observance_id)
            .cloned()
            .collect())
    }

    /// Snapshot of all records, earliest occurrence first.
    pub fn records(&self) -> Result<Vec<DispatchRecord>> {
        let mut all: Vec<_> = self.state()?.records.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    /// Return the record for `key`, creating it as `pending` if absent.
    ///
    /// Idempotent: an existing record is returned as-is, whatever its status,
    /// whether it is already in memory or only in the store.
    #[instrument(skip_all, fields(%key))]
    pub fn begin(&self, key: &OccurrenceKey) -> Result<DispatchRecord> {
        let mut state = self.state()?;
        if let Some(existing) = state.records.get(key) {
            return Ok(existing.clone());
        }
        // The store keeps whatever row already exists for the key, which may
        // have been written by another process since the last load.
        let record = state
            .store
            .insert_if_absent(&DispatchRecord::pending(key.clone(), Utc::now()))?;
        debug!(status = ?record.status, attempts = record.attempts, "dispatch record ready");
        state.records.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    /// Count one submission attempt.  Called before the print service is
    /// contacted so that a crash mid-submission still uses up the attempt.
    #[instrument(skip_all, fields(%key))]
    pub fn record_attempt(&self, key: &OccurrenceKey) -> Result<DispatchRecord> {
        let mut state = self.state()?;
        let mut record = state.existing(key)?;
        let now = Utc::now();
        record.attempts += 1;
        record.last_attempt_at = Some(now);
        record.updated_at = now;
        state.write(record)
    }

    /// Remember why the last attempt failed without changing status.
    pub fn note_error(&self, key: &OccurrenceKey, message: &str) -> Result<DispatchRecord> {
        let mut state = self.state()?;
        let mut record = state.existing(key)?;
        record.last_error = Some(message.to_string());
        record.updated_at = Utc::now();
        state.write(record)
    }

    /// Transition to `submitted`.  Idempotent for an already submitted record.
    #[instrument(skip_all, fields(%key))]
    pub fn mark_submitted(&self, key: &OccurrenceKey) -> Result<DispatchRecord> {
        let mut state = self.state()?;
        let mut record = state.existing(key)?;
        if record.status == DispatchStatus::Submitted {
            return Ok(record);
        }
        record.status = DispatchStatus::Submitted;
        record.last_error = None;
        record.updated_at = Utc::now();
        let record = state.write(record)?;
        info!(attempts = record.attempts, "occurrence marked submitted");
        Ok(record)
    }

    /// Transition to `failed`.  A submitted record is never downgraded.
    #[instrument(skip_all, fields(%key))]
    pub fn mark_failed(&self, key: &OccurrenceKey, reason: &str) -> Result<DispatchRecord> {
        let mut state = self.state()?;
        let mut record = state.existing(key)?;
        match record.status {
            DispatchStatus::Submitted => {
                warn!("refusing to mark a submitted occurrence as failed");
                Ok(record)
            }
            DispatchStatus::Pending | DispatchStatus::Failed => {
                record.status = DispatchStatus::Failed;
                record.last_error = Some(reason.to_string());
                record.updated_at = Utc::now();
                let record = state.write(record)?;
                warn!(attempts = record.attempts, reason, "occurrence marked failed");
                Ok(record)
            }
        }
    }

    /// Manual reset of a failed record: back to `pending` with a fresh budget.
    #[instrument(skip_all, fields(%key))]
    pub fn reset(&self, key: &OccurrenceKey) -> Result<DispatchRecord> {
        let mut state = self.state()?;
        let mut record = state.existing(key)?;
        if record.status != DispatchStatus::Failed {
            return Ok(record);
        }
        record.status = DispatchStatus::Pending;
        record.attempts = 0;
        record.last_error = None;
        record.updated_at = Utc::now();
        let record = state.write(record)?;
        info!("failed occurrence reset to pending");
        Ok(record)
    }

    /// Drop settled records not touched since `cutoff`.  Pending records stay.
    #[instrument(skip(self))]
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state()?;
        let removed = state.store.prune(cutoff)?;
        if removed > 0 {
            state.records
                .retain(|_, r| r.status == DispatchStatus::Pending || r.updated_at >= cutoff);
        }
        Ok(removed)
    }
}
