//! Delayed retry scheduling
//!
//! Scheduled retries are due-time entries in a min-heap. A single timer task
//! sleeps until the earliest entry is due, then hands the job to the worker
//! pool. Scheduling or cancelling wakes the timer so it re-reads the heap.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::types::ScheduledRetry;
use super::worker::{Job, SubmitError, WorkerPool};
use crate::store::{types::now_millis, EventId};

/// Delay before re-dispatching a retry that found the job queue full
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

struct Entry {
    event_id: EventId,
    due: Instant,
    scheduled_at: DateTime<Utc>,
    token: CancellationToken,
}

#[derive(Default)]
struct Schedule {
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    entries: HashMap<String, Entry>,
}

/// When a retry falls due, on both the monotonic and the wall clock
#[derive(Debug, Clone, Copy)]
pub(crate) struct DueTime {
    at: Instant,
    scheduled_at: DateTime<Utc>,
}

impl DueTime {
    /// Due time `delay` from now, or `None` if either clock would overflow
    pub fn after(delay: Duration) -> Option<Self> {
        let at = Instant::now().checked_add(delay)?;
        let offset = chrono::Duration::from_std(delay).ok()?;
        let scheduled_at = now_millis().checked_add_signed(offset)?;
        Some(Self { at, scheduled_at })
    }
}

pub(crate) struct RetryScheduler {
    schedule: Mutex<Schedule>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl RetryScheduler {
    /// Create the scheduler and spawn its timer task on `tracker`
    pub fn start(
        pool: Arc<WorkerPool>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            schedule: Mutex::new(Schedule::default()),
            wake: Notify::new(),
            shutdown,
        });

        tracker.spawn(Arc::clone(&scheduler).run(pool));
        scheduler
    }

    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule `event_id` to be processed after `delay`. Returns `None`
    /// when the due time is not representable.
    #[cfg(test)]
    pub fn schedule(&self, event_id: &str, delay: Duration) -> Option<ScheduledRetry> {
        DueTime::after(delay).map(|due| self.schedule_at(event_id, due))
    }

    /// Schedule `event_id` for an already computed due time
    pub fn schedule_at(&self, event_id: &str, due: DueTime) -> ScheduledRetry {
        let retry_id = uuid::Uuid::new_v4().to_string();
        let DueTime { at, scheduled_at } = due;

        {
            let mut schedule = self.lock();
            schedule.heap.push(Reverse((at, retry_id.clone())));
            schedule.entries.insert(
                retry_id.clone(),
                Entry {
                    event_id: event_id.to_string(),
                    due: at,
                    scheduled_at,
                    token: self.shutdown.child_token(),
                },
            );
        }
        self.wake.notify_one();

        tracing::debug!(retry_id = %retry_id, event_id = %event_id, scheduled_at = %scheduled_at, "Retry scheduled");

        ScheduledRetry {
            retry_id,
            event_id: event_id.to_string(),
            scheduled_at,
        }
    }

    /// Cancel a retry that has not been dispatched yet
    pub fn cancel(&self, retry_id: &str) -> Option<ScheduledRetry> {
        let entry = self.lock().entries.remove(retry_id)?;
        entry.token.cancel();
        self.wake.notify_one();

        tracing::debug!(retry_id = %retry_id, event_id = %entry.event_id, "Retry cancelled");

        Some(ScheduledRetry {
            retry_id: retry_id.to_string(),
            event_id: entry.event_id,
            scheduled_at: entry.scheduled_at,
        })
    }

    /// Cancel every pending retry of one event
    pub fn cancel_event(&self, event_id: &str) -> usize {
        let removed: Vec<Entry> = {
            let mut schedule = self.lock();
            let ids: Vec<String> = schedule
                .entries
                .iter()
                .filter(|(_, entry)| entry.event_id == event_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| schedule.entries.remove(id))
                .collect()
        };

        for entry in &removed {
            entry.token.cancel();
        }
        removed.len()
    }

    /// Pending retries, earliest first
    pub fn list(&self) -> Vec<ScheduledRetry> {
        let schedule = self.lock();
        let mut retries: Vec<ScheduledRetry> = schedule
            .entries
            .iter()
            .map(|(id, entry)| ScheduledRetry {
                retry_id: id.clone(),
                event_id: entry.event_id.clone(),
                scheduled_at: entry.scheduled_at,
            })
            .collect();
        retries.sort_by_key(|retry| retry.scheduled_at);
        retries
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Earliest due time of a live entry, discarding cancelled heap tops
    fn next_due(&self) -> Option<Instant> {
        let mut schedule = self.lock();
        loop {
            let Reverse((due, id)) = schedule.heap.peek()?;
            if schedule.entries.contains_key(id) {
                return Some(*due);
            }
            schedule.heap.pop();
        }
    }

    fn take_due(&self, now: Instant) -> Vec<(String, Entry)> {
        let mut schedule = self.lock();
        let mut due = Vec::new();

        while let Some(Reverse((at, _))) = schedule.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, id))) = schedule.heap.pop() else {
                break;
            };
            if let Some(entry) = schedule.entries.remove(&id) {
                due.push((id, entry));
            }
        }

        due
    }

    fn requeue(&self, retry_id: String, mut entry: Entry) {
        entry.due = Instant::now() + REQUEUE_DELAY;
        let mut schedule = self.lock();
        schedule.heap.push(Reverse((entry.due, retry_id.clone())));
        schedule.entries.insert(retry_id, entry);
    }

    async fn run(self: Arc<Self>, pool: Arc<WorkerPool>) {
        loop {
            let next = self.next_due();
            let sleep = async {
                match next {
                    Some(due) => sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => continue,
                _ = sleep => {}
            }

            for (retry_id, entry) in self.take_due(Instant::now()) {
                if entry.token.is_cancelled() {
                    continue;
                }
                let job = Job::new(entry.event_id.clone()).with_cancel(entry.token.clone());
                match pool.submit(job) {
                    Ok(()) => {
                        tracing::debug!(retry_id = %retry_id, event_id = %entry.event_id, "Retry dispatched");
                    }
                    Err(SubmitError::Full) => {
                        tracing::warn!(retry_id = %retry_id, event_id = %entry.event_id, "Job queue full, retry deferred");
                        self.requeue(retry_id, entry);
                    }
                    Err(SubmitError::Closed) => return,
                }
            }
        }

        tracing::debug!("Retry timer stopped");
    }
}
