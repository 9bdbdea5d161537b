//! In-process queue backend.
//!
//! Used when Redis is unreachable. Each queue is a binary heap ordered by
//! `(priority, sequence)`; waiting slots park on a per-queue `Notify`.
//! Nothing here survives a process restart.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use vstyle_models::{JobId, JobRecord, QueueName};

use crate::backend::{BackendMode, QueueBackend};
use crate::error::{QueueError, QueueResult};

/// Heap entry. Entries whose sequence no longer matches the held job are
/// stale (acked or re-queued since) and skipped on pop.
#[derive(Debug)]
struct Ticket {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Lane {
    heap: BinaryHeap<Reverse<Ticket>>,
    notify: Arc<Notify>,
}

struct Held {
    record: JobRecord,
    queued: bool,
    seq: u64,
}

#[derive(Default)]
struct State {
    lanes: HashMap<QueueName, Lane>,
    jobs: HashMap<JobId, Held>,
    next_seq: u64,
}

impl State {
    /// Push a ticket for a held job and return the lane's notifier.
    fn push(&mut self, id: &JobId) -> Option<Arc<Notify>> {
        let seq = self.next_seq;
        let held = self.jobs.get_mut(id)?;
        self.next_seq += 1;
        held.queued = true;
        held.seq = seq;

        let lane = self.lanes.entry(held.record.queue.clone()).or_default();
        lane.heap.push(Reverse(Ticket {
            priority: held.record.priority,
            seq,
            id: id.clone(),
        }));
        Some(Arc::clone(&lane.notify))
    }

    fn pop(&mut self, queue: &QueueName) -> Option<JobRecord> {
        let lane = self.lanes.get_mut(queue)?;
        while let Some(Reverse(ticket)) = lane.heap.pop() {
            match self.jobs.get_mut(&ticket.id) {
                Some(held) if held.queued && held.seq == ticket.seq => {
                    held.queued = false;
                    return Some(held.record.clone());
                }
                _ => continue,
            }
        }
        None
    }
}

/// Memory-resident queue shared by all worker slots of this process.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notifier(&self, queue: &QueueName) -> Arc<Notify> {
        let mut state = self.state();
        let lane = state.lanes.entry(queue.clone()).or_default();
        Arc::clone(&lane.notify)
    }

    fn reinsert(&self, id: &JobId) {
        let notify = {
            let mut state = self.state();
            match state.jobs.get(id).map(|held| held.queued) {
                // Acked while the retry timer was pending, or already back.
                None | Some(true) => return,
                Some(false) => state.push(id),
            }
        };

        if let Some(notify) = notify {
            debug!(job_id = %id, "Re-inserted job into in-process queue");
            notify.notify_one();
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::InProcess
    }

    async fn enqueue(&self, record: &JobRecord) -> QueueResult<()> {
        let notify = {
            let mut state = self.state();
            if state.jobs.contains_key(&record.id) {
                return Err(QueueError::enqueue_failed(format!(
                    "job {} is already held by the queue",
                    record.id
                )));
            }
            state.jobs.insert(
                record.id.clone(),
                Held {
                    record: record.clone(),
                    queued: false,
                    seq: 0,
                },
            );
            state.push(&record.id)
        };

        if let Some(notify) = notify {
            notify.notify_one();
        }
        debug!(job_id = %record.id, queue = %record.queue, priority = record.priority, "Enqueued job in-process");
        Ok(())
    }

    async fn dequeue(&self, queue: &QueueName, wait: Duration) -> QueueResult<Option<JobRecord>> {
        let notify = self.notifier(queue);
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking, so an enqueue between the
            // check and the await still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.state().pop(queue) {
                return Ok(Some(record));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, id: &JobId) -> QueueResult<()> {
        self.state().jobs.remove(id);
        Ok(())
    }

    async fn requeue_after(&self, id: &JobId, delay: Duration) -> QueueResult<()> {
        if !self.state().jobs.contains_key(id) {
            return Err(QueueError::NotFound(id.clone()));
        }

        if delay.is_zero() {
            self.reinsert(id);
            return Ok(());
        }

        let backend = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            backend.reinsert(&id);
        });
        Ok(())
    }

    async fn len(&self, queue: &QueueName) -> QueueResult<u64> {
        let state = self.state();
        let waiting = state
            .jobs
            .values()
            .filter(|held| &held.record.queue == queue && held.queued)
            .count();
        Ok(waiting as u64)
    }
}
