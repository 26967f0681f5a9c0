//! Processing worker pool
//!
//! A bounded job queue consumed by a fixed number of workers. Submitting
//! never waits: a full queue is reported back to the caller, which leaves
//! the event in its current status.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::store::EventId;

/// One unit of processing work
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub event_id: EventId,
    /// Set for retries; a cancelled job is skipped
    pub cancel: Option<CancellationToken>,
}

impl Job {
    pub fn new(event_id: impl Into<EventId>) -> Self {
        Self {
            event_id: event_id.into(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|token| token.is_cancelled())
    }
}

/// Runs one job; implemented by the pipeline
#[async_trait]
pub(crate) trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitError {
    Full,
    Closed,
}

pub(crate) struct WorkerPool {
    sender: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawn `workers` tasks on `tracker`, all stopping when `shutdown` fires
    pub fn start(
        workers: usize,
        capacity: usize,
        handler: Arc<dyn JobHandler>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();

            tracker.spawn(async move {
                loop {
                    let next = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => None,
                            job = receiver.recv() => job,
                        }
                    };
                    let Some(job) = next else { break };

                    if job.is_cancelled() {
                        tracing::debug!(worker, event_id = %job.event_id, "Skipping cancelled job");
                        continue;
                    }

                    let event_id = job.event_id.clone();
                    if AssertUnwindSafe(handler.handle(job)).catch_unwind().await.is_err() {
                        tracing::error!(worker, event_id = %event_id, "Worker job panicked");
                    }
                }
                tracing::debug!(worker, "Worker stopped");
            });
        }

        tracing::debug!(workers, capacity, "Worker pool started");
        Self { sender }
    }

    pub fn submit(&self, job: Job) -> Result<(), SubmitError> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Jobs waiting for a worker
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Counting {
        handled: AtomicUsize,
        gate: Notify,
        block: bool,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: Job) {
            if self.block {
                self.gate.notified().await;
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, job: Job) {
            if job.event_id == "boom" {
                panic!("handler failure");
            }
        }
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_jobs_are_handled() {
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
            gate: Notify::new(),
            block: false,
        });
        let tracker = TaskTracker::new();
        let pool = WorkerPool::start(2, 16, handler.clone(), &tracker, CancellationToken::new());

        for i in 0..10 {
            pool.submit(Job::new(format!("e{}", i))).unwrap();
        }
        wait_for(&handler.handled, 10).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
            gate: Notify::new(),
            block: true,
        });
        let tracker = TaskTracker::new();
        let pool = WorkerPool::start(1, 1, handler.clone(), &tracker, CancellationToken::new());

        // First job occupies the worker, second fills the queue
        pool.submit(Job::new("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.submit(Job::new("b")).unwrap();
        assert_eq!(pool.depth(), 1);
        assert_eq!(pool.submit(Job::new("c")), Err(SubmitError::Full));

        handler.gate.notify_one();
        handler.gate.notify_one();
        wait_for(&handler.handled, 2).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_job_skipped() {
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
            gate: Notify::new(),
            block: false,
        });
        let tracker = TaskTracker::new();
        let pool = WorkerPool::start(1, 4, handler.clone(), &tracker, CancellationToken::new());

        let token = CancellationToken::new();
        token.cancel();
        pool.submit(Job::new("skipped").with_cancel(token)).unwrap();
        pool.submit(Job::new("run")).unwrap();

        wait_for(&handler.handled, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(1, 4, Arc::new(Panicking), &tracker, shutdown.clone());

        pool.submit(Job::new("boom")).unwrap();
        pool.submit(Job::new("fine")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.depth(), 0);

        // Worker is still alive and exits on shutdown
        shutdown.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
            gate: Notify::new(),
            block: false,
        });
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(2, 4, handler, &tracker, shutdown.clone());

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;

        assert_eq!(pool.submit(Job::new("late")), Err(SubmitError::Closed));
    }
}
