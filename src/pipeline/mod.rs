//! Event Pipeline
//!
//! Accepts published events, persists them, pushes them to connected clients
//! and drives them through the processing state machine:
//!
//! ```text
//! pending ──► processed
//!    │
//!    └────► failed ──► retry ──► processed | failed
//! ```
//!
//! Publishing returns as soon as the event is stored and queued. Processing
//! happens on a fixed worker pool; retries wait in a cancellable schedule.
//! While an event is being processed its id sits in an in-memory in-flight
//! set, so two units in this process never process it at once. The stored
//! status never shows an intermediate "processing" value.

pub mod error;
pub mod processor;
mod retry;
pub mod types;
mod worker;

pub use error::{PipelineError, PipelineResult};
pub use processor::{DefaultProcessor, EventProcessor, ProcessingError};
pub use types::{NewEvent, RetryOptions, RetryParams, RetryTicket, ScheduledRetry};

use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::store::{Event, EventId, EventPage, EventStatus, EventStore, ListQuery};
use crate::websocket::{ConnectionHub, ServerMessage};
use retry::{DueTime, RetryScheduler};
use worker::{Job, JobHandler, SubmitError, WorkerPool};

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of processing workers
    pub workers: usize,
    /// Capacity of the processing job queue
    pub queue_capacity: usize,
    /// Default retry budget per event
    pub max_attempts: u32,
    /// Default delay before a retry runs
    pub retry_delay: Duration,
    /// Largest accepted publish or delete batch
    pub max_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
            max_batch_size: 100,
        }
    }
}

/// Longest delay a retry request may ask for
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// State shared with the workers
struct Core {
    store: Arc<dyn EventStore>,
    hub: Arc<ConnectionHub>,
    processor: Arc<dyn EventProcessor>,
    in_flight: Mutex<HashSet<EventId>>,
}

/// Releases an in-flight claim when dropped
struct Claim<'a> {
    core: &'a Core,
    id: EventId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.core
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl Core {
    fn claim(&self, id: &str) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(id.to_string()) {
            return None;
        }
        Some(Claim {
            core: self,
            id: id.to_string(),
        })
    }

    /// Run one processing attempt. Returns the event's state afterwards,
    /// or `None` if it no longer exists.
    ///
    /// Events that are in flight elsewhere, or no longer `pending`/`retry`,
    /// are returned untouched.
    async fn process(&self, id: &str) -> PipelineResult<Option<Event>> {
        let Some(_claim) = self.claim(id) else {
            tracing::debug!(event_id = %id, "Event already in flight, skipping");
            return Ok(self.store.get(id).await?);
        };

        let Some(event) = self.store.get(id).await? else {
            tracing::debug!(event_id = %id, "Event deleted before processing");
            return Ok(None);
        };
        if !event.status.is_processable() {
            return Ok(Some(event));
        }

        let outcome = match AssertUnwindSafe(self.processor.process(&event))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::new("processor panicked")),
        };

        // Terminal write only applies to events still awaiting processing
        let Some(current) = self.store.get(id).await? else {
            return Ok(None);
        };
        if !current.status.is_processable() {
            tracing::debug!(event_id = %id, status = %current.status, "Status changed during processing, result discarded");
            return Ok(Some(current));
        }

        let (status, error_message) = match outcome {
            Ok(()) => (EventStatus::Processed, None),
            Err(e) => (EventStatus::Failed, Some(e.to_string())),
        };

        let Some(updated) = self.store.update_status(id, status, error_message).await? else {
            return Ok(None);
        };

        match updated.status {
            EventStatus::Processed => {
                tracing::info!(event_id = %id, event_type = %updated.event_type, "Event processed");
            }
            _ => {
                tracing::warn!(
                    event_id = %id,
                    event_type = %updated.event_type,
                    error = updated.error_message.as_deref().unwrap_or_default(),
                    "Event processing failed"
                );
            }
        }

        self.announce_status(&updated).await;
        Ok(Some(updated))
    }

    async fn announce_status(&self, event: &Event) {
        self.hub
            .broadcast_to_topic(
                &ServerMessage::event_topic(event),
                &ServerMessage::EventStatus(event.clone()),
            )
            .await;
    }
}

#[async_trait]
impl JobHandler for Core {
    async fn handle(&self, job: Job) {
        if let Err(e) = self.process(&job.event_id).await {
            tracing::error!(event_id = %job.event_id, error = %e, "Processing job failed");
        }
    }
}

/// The event pipeline
pub struct EventPipeline {
    core: Arc<Core>,
    workers: Arc<WorkerPool>,
    retries: Arc<RetryScheduler>,
    config: PipelineConfig,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl EventPipeline {
    /// Start the pipeline's workers and retry timer
    pub fn new(
        store: Arc<dyn EventStore>,
        hub: Arc<ConnectionHub>,
        processor: Arc<dyn EventProcessor>,
        config: PipelineConfig,
    ) -> Self {
        let core = Arc::new(Core {
            store,
            hub,
            processor,
            in_flight: Mutex::new(HashSet::new()),
        });
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let workers = Arc::new(WorkerPool::start(
            config.workers,
            config.queue_capacity,
            Arc::clone(&core) as Arc<dyn JobHandler>,
            &tracker,
            shutdown.clone(),
        ));
        let retries = RetryScheduler::start(Arc::clone(&workers), &tracker, shutdown.clone());

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            max_attempts = config.max_attempts,
            "Event pipeline started"
        );

        Self {
            core,
            workers,
            retries,
            config,
            tracker,
            shutdown,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.core.store
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.core.hub
    }

    /// Jobs waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.workers.depth()
    }

    pub fn scheduled_retry_count(&self) -> usize {
        self.retries.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> PipelineResult<()> {
        if self.is_shutting_down() {
            return Err(PipelineError::ShuttingDown);
        }
        Ok(())
    }

    fn enqueue(&self, id: &str) {
        match self.workers.submit(Job::new(id)) {
            Ok(()) => {}
            Err(SubmitError::Full) => {
                tracing::warn!(event_id = %id, "Processing queue full, event left pending");
            }
            Err(SubmitError::Closed) => {
                tracing::warn!(event_id = %id, "Processing queue closed, event left pending");
            }
        }
    }

    /// Publish one event
    ///
    /// The returned event is `pending`; processing happens afterwards.
    pub async fn publish(
        &self,
        request: NewEvent,
        source_header: Option<&str>,
    ) -> PipelineResult<Event> {
        self.ensure_running()?;
        validate_type(&request, None)?;

        let event = request.into_event(source_header);
        self.core.store.insert(&event).await?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            "Event published"
        );

        self.core
            .hub
            .broadcast_to_all(&ServerMessage::Event(event.clone()))
            .await;
        self.enqueue(&event.id);

        Ok(event)
    }

    /// Publish several events; nothing is stored unless every item is valid
    pub async fn publish_batch(
        &self,
        requests: Vec<NewEvent>,
        source_header: Option<&str>,
    ) -> PipelineResult<Vec<Event>> {
        self.ensure_running()?;
        self.validate_batch_size(requests.len())?;

        for (index, request) in requests.iter().enumerate() {
            validate_type(request, Some(index))?;
        }

        let events: Vec<Event> = requests
            .into_iter()
            .map(|request| request.into_event(source_header))
            .collect();
        self.core.store.insert_batch(&events).await?;

        tracing::info!(count = events.len(), "Event batch published");

        for event in &events {
            self.core
                .hub
                .broadcast_to_all(&ServerMessage::Event(event.clone()))
                .await;
            self.enqueue(&event.id);
        }

        Ok(events)
    }

    /// Schedule a delayed re-processing of a failed event
    ///
    /// Holds the event's in-flight claim while reading and bumping the
    /// retry count, so concurrent retries of one event are not both counted
    /// as the same attempt.
    pub async fn retry_event(&self, id: &str, params: RetryParams) -> PipelineResult<RetryTicket> {
        self.ensure_running()?;

        let options = params.retry_options.unwrap_or_default();
        let delay = match options.delay_seconds {
            Some(secs) => Duration::from_secs(secs),
            None => self.config.retry_delay,
        };
        if delay > MAX_RETRY_DELAY {
            return Err(PipelineError::Validation(format!(
                "Retry delay of {}s exceeds the maximum of {}s",
                delay.as_secs(),
                MAX_RETRY_DELAY.as_secs()
            )));
        }
        let due = DueTime::after(delay).ok_or_else(|| {
            PipelineError::Validation("Retry delay is out of range".to_string())
        })?;

        let Some(claim) = self.core.claim(id) else {
            return Err(PipelineError::Busy(id.to_string()));
        };

        let mut event = self.get(id).await?;
        if !event.status.is_retryable() {
            return Err(PipelineError::InvalidState {
                id: id.to_string(),
                status: event.status,
            });
        }

        let max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts);
        if event.retry_count >= max_attempts {
            return Err(PipelineError::RetryExhausted {
                id: id.to_string(),
                attempts: event.retry_count,
                max_attempts,
            });
        }

        event.retry_count += 1;
        event.status = EventStatus::Retry;
        if let Some(priority) = params.priority {
            event.priority = priority;
        }
        if !self.core.store.save(&event).await? {
            return Err(PipelineError::NotFound(format!("Event '{}' not found", id)));
        }

        // A zero delay may dispatch at once; the worker needs the claim
        drop(claim);
        let scheduled = self.retries.schedule_at(id, due);

        tracing::info!(
            event_id = %id,
            retry_id = %scheduled.retry_id,
            attempt = event.retry_count,
            max_attempts,
            reason = params.reason.as_deref().unwrap_or_default(),
            "Retry scheduled"
        );

        self.core.announce_status(&event).await;

        Ok(RetryTicket {
            retry_id: scheduled.retry_id,
            event_id: event.id,
            attempt: event.retry_count,
            scheduled_at: scheduled.scheduled_at,
            reason: params.reason,
        })
    }

    /// Cancel a scheduled retry; the event keeps its `retry` status
    pub fn cancel_retry(&self, retry_id: &str) -> PipelineResult<ScheduledRetry> {
        self.retries
            .cancel(retry_id)
            .ok_or_else(|| PipelineError::NotFound(format!("Retry '{}' not found", retry_id)))
    }

    /// Retries waiting for their due time, earliest first
    pub fn scheduled_retries(&self) -> Vec<ScheduledRetry> {
        self.retries.list()
    }

    /// Process up to `limit` pending events now, in the caller's task
    pub async fn process_pending_events(&self, limit: usize) -> PipelineResult<Vec<Event>> {
        validate_limit(limit)?;

        let pending = self
            .core
            .store
            .find_by_status(EventStatus::Pending, limit)
            .await?;

        let mut results = Vec::with_capacity(pending.len());
        for event in pending {
            if let Some(after) = self.core.process(&event.id).await? {
                results.push(after);
            }
        }

        tracing::info!(count = results.len(), "Processed pending events");
        Ok(results)
    }

    pub async fn get_failed_events(&self, limit: usize) -> PipelineResult<Vec<Event>> {
        validate_limit(limit)?;
        Ok(self
            .core
            .store
            .find_by_status(EventStatus::Failed, limit)
            .await?)
    }

    /// Manually set an event's status
    pub async fn update_event_status(
        &self,
        id: &str,
        status: &str,
        error_message: Option<String>,
    ) -> PipelineResult<Event> {
        let status: EventStatus = status.parse().map_err(PipelineError::Validation)?;
        let error_message = error_message.filter(|m| !m.is_empty());

        let event = self
            .core
            .store
            .update_status(id, status, error_message)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("Event '{}' not found", id)))?;

        tracing::info!(event_id = %id, status = %status, "Event status updated");
        self.core.announce_status(&event).await;
        Ok(event)
    }

    pub async fn get(&self, id: &str) -> PipelineResult<Event> {
        self.core
            .store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("Event '{}' not found", id)))
    }

    pub async fn list(&self, query: &ListQuery) -> PipelineResult<EventPage> {
        validate_limit(query.limit)?;
        Ok(self.core.store.list(query).await?)
    }

    pub async fn delete(&self, id: &str) -> PipelineResult<()> {
        if !self.core.store.delete(id).await? {
            return Err(PipelineError::NotFound(format!("Event '{}' not found", id)));
        }
        self.retries.cancel_event(id);
        tracing::info!(event_id = %id, "Event deleted");
        Ok(())
    }

    /// Delete several events, returning how many existed
    pub async fn delete_batch(&self, ids: &[EventId]) -> PipelineResult<usize> {
        self.validate_batch_size(ids.len())?;
        if ids.iter().any(|id| id.trim().is_empty()) {
            return Err(PipelineError::Validation("Event ids must not be empty".to_string()));
        }

        let deleted = self.core.store.delete_batch(ids).await?;
        for id in ids {
            self.retries.cancel_event(id);
        }

        tracing::info!(requested = ids.len(), deleted, "Event batch deleted");
        Ok(deleted)
    }

    fn validate_batch_size(&self, len: usize) -> PipelineResult<()> {
        if len == 0 {
            return Err(PipelineError::Validation(
                "Batch must contain at least one item".to_string(),
            ));
        }
        if len > self.config.max_batch_size {
            return Err(PipelineError::Validation(format!(
                "Batch of {} items exceeds the maximum of {} items",
                len, self.config.max_batch_size
            )));
        }
        Ok(())
    }

    /// Stop accepting work, then wait for workers and the retry timer
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(
            abandoned_retries = self.retries.len(),
            "Event pipeline shut down"
        );
    }
}

fn validate_type(request: &NewEvent, index: Option<usize>) -> PipelineResult<()> {
    if !request.event_type.trim().is_empty() {
        return Ok(());
    }
    Err(PipelineError::Validation(match index {
        Some(i) => format!("Event at index {}: type is required", i),
        None => "Event type is required".to_string(),
    }))
}

fn validate_limit(limit: usize) -> PipelineResult<()> {
    if limit == 0 {
        return Err(PipelineError::Validation(
            "Limit must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
