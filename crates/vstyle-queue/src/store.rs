//! In-process job record store.
//!
//! Holds the canonical `JobRecord` for every job this process knows about.
//! Membership is guarded by one map lock; each record carries its own mutex,
//! so transitions on the same job are serialized while different jobs never
//! contend. Locks are never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vstyle_models::{JobId, JobRecord, JobStatus, QueueName};

use crate::error::{QueueError, QueueResult};

/// A requested status change, carrying the outcome it records.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    /// A worker slot picked the job up.
    Activate,
    /// Work succeeded with this result.
    Complete(Value),
    /// Retryable failure; the job goes back to the queue.
    Retry(String),
    /// Fatal failure, or retries exhausted.
    Fail(String),
    /// Explicit cancel request.
    Cancel,
}

impl StatusChange {
    /// Status this change moves the job to.
    pub fn target(&self) -> JobStatus {
        match self {
            StatusChange::Activate => JobStatus::Active,
            StatusChange::Complete(_) => JobStatus::Completed,
            StatusChange::Retry(_) => JobStatus::Queued,
            StatusChange::Fail(_) => JobStatus::Failed,
            StatusChange::Cancel => JobStatus::Cancelled,
        }
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

struct Entry {
    record: JobRecord,
    cancel: CancellationToken,
    /// A caller has seen the terminal state.
    observed: bool,
}

impl Entry {
    fn new(record: JobRecord) -> Self {
        Self {
            record,
            cancel: CancellationToken::new(),
            observed: false,
        }
    }
}

type Slot = Arc<Mutex<Entry>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Entry> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe store of job records.
#[derive(Default)]
pub struct JobStore {
    records: RwLock<HashMap<JobId, Slot>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &JobId) -> QueueResult<Slot> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    /// Insert a new record.
    pub fn create(&self, record: JobRecord) -> QueueResult<JobRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.id) {
            return Err(QueueError::DuplicateId(record.id.clone()));
        }

        debug!(job_id = %record.id, queue = %record.queue, "Created job record");
        records.insert(record.id.clone(), Arc::new(Mutex::new(Entry::new(record.clone()))));
        Ok(record)
    }

    /// Insert a record this process did not create (e.g. dequeued from a
    /// durable backend after a restart). Returns the stored record, which is
    /// the existing one if the id is already known.
    pub fn adopt(&self, record: JobRecord) -> JobRecord {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let slot = records
            .entry(record.id.clone())
            .or_insert_with(|| {
                debug!(job_id = %record.id, queue = %record.queue, "Adopted job record");
                Arc::new(Mutex::new(Entry::new(record)))
            })
            .clone();
        drop(records);

        let entry = lock(&slot);
        entry.record.clone()
    }

    /// Merge a snapshot written by another process sharing the backend.
    ///
    /// A terminal local record is kept. Otherwise a terminal or newer
    /// snapshot replaces it, and a cancelled snapshot trips the job's token.
    /// Returns the stored record.
    pub fn refresh(&self, snapshot: JobRecord) -> JobRecord {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let slot = records
            .entry(snapshot.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Entry::new(snapshot.clone()))))
            .clone();
        drop(records);

        let mut entry = lock(&slot);
        let stale = !entry.record.is_terminal()
            && (snapshot.is_terminal() || snapshot.updated_at > entry.record.updated_at);
        if stale {
            debug!(
                job_id = %snapshot.id,
                "Refreshed job record {} -> {}", entry.record.status, snapshot.status
            );
            entry.record = snapshot;
            if entry.record.status == JobStatus::Cancelled {
                entry.cancel.cancel();
            }
        }
        entry.record.clone()
    }

    /// Snapshot of a record.
    pub fn get(&self, id: &JobId) -> QueueResult<JobRecord> {
        let slot = self.slot(id)?;
        let entry = lock(&slot);
        Ok(entry.record.clone())
    }

    /// Check whether a record exists.
    pub fn contains(&self, id: &JobId) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Record progress reported by a work function.
    ///
    /// Updates after a terminal transition are dropped, as are values lower
    /// than the current progress.
    pub fn update_progress(&self, id: &JobId, progress: u8) -> QueueResult<()> {
        let slot = self.slot(id)?;
        let mut entry = lock(&slot);
        let record = &mut entry.record;

        if record.is_terminal() {
            debug!(job_id = %id, progress, status = %record.status, "Dropped late progress update");
            return Ok(());
        }

        let progress = progress.min(100);
        if progress > record.progress {
            record.progress = progress;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Apply a status change, enforcing the job state machine.
    ///
    /// `Activate` on a job whose attempts are exhausted fails it instead, and
    /// `Retry` without attempts left becomes `Fail`.
    pub fn transition(&self, id: &JobId, change: StatusChange) -> QueueResult<JobRecord> {
        let slot = self.slot(id)?;
        let mut entry = lock(&slot);
        let from = entry.record.status;

        let change = match change {
            StatusChange::Activate
                if from == JobStatus::Queued && !entry.record.has_attempts_left() =>
            {
                StatusChange::Fail(format!(
                    "max attempts ({}) exhausted",
                    entry.record.max_attempts
                ))
            }
            StatusChange::Retry(error) if !entry.record.has_attempts_left() => {
                StatusChange::Fail(error)
            }
            other => other,
        };

        let to = change.target();
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        let record = &mut entry.record;
        record.status = to;
        record.updated_at = now;

        match change {
            StatusChange::Activate => {
                record.attempt += 1;
                record.started_at.get_or_insert(now);
            }
            StatusChange::Complete(result) => {
                record.result = Some(result);
                record.progress = 100;
                record.completed_at = Some(now);
            }
            StatusChange::Retry(error) => {
                record.last_error = Some(error);
            }
            StatusChange::Fail(error) => {
                record.error = Some(error);
                record.completed_at = Some(now);
            }
            StatusChange::Cancel => {
                record.error = Some("cancelled by request".to_string());
                record.completed_at = Some(now);
            }
        }

        debug!(
            job_id = %id,
            attempt = record.attempt,
            "Job transition {} -> {}", from, to
        );

        let snapshot = record.clone();
        if to == JobStatus::Cancelled {
            entry.cancel.cancel();
        }
        Ok(snapshot)
    }

    /// Token tripped when the job is cancelled.
    pub fn cancellation_token(&self, id: &JobId) -> QueueResult<CancellationToken> {
        let slot = self.slot(id)?;
        let entry = lock(&slot);
        Ok(entry.cancel.clone())
    }

    /// Note that a status caller has seen this record. Only terminal records
    /// count towards retention.
    pub fn mark_observed(&self, id: &JobId) {
        if let Ok(slot) = self.slot(id) {
            let mut entry = lock(&slot);
            if entry.record.is_terminal() {
                entry.observed = true;
            }
        }
    }

    /// Remove terminal records that were observed and finished longer than
    /// `retention` ago. Returns how many were removed.
    pub fn prune(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, slot| {
            let entry = lock(slot);
            let expired = entry
                .record
                .completed_at
                .map(|at| at <= cutoff)
                .unwrap_or(false);
            !(entry.observed && entry.record.is_terminal() && expired)
        });

        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "Pruned job records");
        }
        removed
    }

    /// Count records per status, optionally restricted to one queue.
    pub fn counts(&self, queue: Option<&QueueName>) -> StatusCounts {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = StatusCounts::default();
        for slot in records.values() {
            let entry = lock(slot);
            if queue.map_or(true, |q| &entry.record.queue == q) {
                counts.add(entry.record.status);
            }
        }
        counts
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
