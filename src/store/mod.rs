//! Event Store
//!
//! Persistence boundary for published events:
//!
//! - **types**: `Event`, `EventStatus`, `Priority`
//! - **query**: listing, pagination, search and count types
//! - **sqlite**: SQLite-backed implementation of [`EventStore`]
//! - **error**: Error types
//!
//! The pipeline only talks to the [`EventStore`] trait. The store offers no
//! compare-and-swap: status writes are last-write-wins.

pub mod error;
pub mod query;
pub mod sqlite;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use query::{
    AggregationField, Bucket, Direction, EventPage, ListQuery, SearchQuery, SearchResult,
    StatusCounts, TimeWindow,
};
pub use sqlite::SqliteEventStore;
pub use types::{Event, EventId, EventStatus, Priority, UNKNOWN_SOURCE};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence operations the pipeline and stats facade rely on
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event
    async fn insert(&self, event: &Event) -> StoreResult<()>;

    /// Persist several events atomically (all or none)
    async fn insert_batch(&self, events: &[Event]) -> StoreResult<()>;

    /// Load one event
    async fn get(&self, id: &str) -> StoreResult<Option<Event>>;

    /// Filtered, cursor-paginated listing
    async fn list(&self, query: &ListQuery) -> StoreResult<EventPage>;

    /// Oldest-first events in `status`, at most `limit`
    async fn find_by_status(&self, status: EventStatus, limit: usize) -> StoreResult<Vec<Event>>;

    /// Overwrite status and error message. Moving to `processed` stamps
    /// `processed_at`; any other status clears it. Returns the updated
    /// event, or `None` if it is gone.
    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        error_message: Option<String>,
    ) -> StoreResult<Option<Event>>;

    /// Overwrite every mutable field of an existing event. Returns false if
    /// the event no longer exists.
    async fn save(&self, event: &Event) -> StoreResult<bool>;

    /// Delete one event, returning whether it existed
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    /// Delete several events, returning how many existed
    async fn delete_batch(&self, ids: &[EventId]) -> StoreResult<usize>;

    /// Counts by status, optionally restricted by creation time and type
    async fn count_by_status(
        &self,
        since: Option<DateTime<Utc>>,
        event_type: Option<&str>,
    ) -> StoreResult<StatusCounts>;

    /// Free-text and filtered search with aggregations
    async fn search(&self, query: &SearchQuery) -> StoreResult<SearchResult>;
}
