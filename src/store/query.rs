//! Query, pagination and search types understood by the event store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{Event, EventStatus, Priority};

/// Sort direction for cursor pagination (by insertion order)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" | "next" | "forward" => Ok(Direction::Asc),
            "desc" | "prev" | "backward" => Ok(Direction::Desc),
            _ => Err(format!("Invalid direction: {}. Use asc or desc", s)),
        }
    }
}

/// Filtered, cursor-paginated listing
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<EventStatus>,
    /// Opaque cursor returned as `next_cursor` by a previous page
    pub cursor: Option<String>,
    pub limit: usize,
    pub direction: Direction,
}

impl ListQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Cursor to pass back for the following page, if there is one
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Fields a search may aggregate over
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AggregationField {
    Type,
    Source,
    Status,
    Priority,
}

impl AggregationField {
    /// Column backing this field
    pub fn column(&self) -> &'static str {
        match self {
            AggregationField::Type => "event_type",
            AggregationField::Source => "source",
            AggregationField::Status => "status",
            AggregationField::Priority => "priority",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregationField::Type => "type",
            AggregationField::Source => "source",
            AggregationField::Status => "status",
            AggregationField::Priority => "priority",
        }
    }
}

/// Inclusive time window on `created_at`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

/// Search request against the store
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Substring matched against type, source and payload text
    pub text: Option<String>,
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<EventStatus>,
    pub priority: Option<Priority>,
    pub window: TimeWindow,
    pub aggregations: Vec<AggregationField>,
    pub size: usize,
}

/// A single aggregation bucket
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Bucket {
    pub key: String,
    pub count: u64,
}

/// Search hits plus requested aggregations
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Total matches, independent of `size`
    pub total: u64,
    pub events: Vec<Event>,
    pub aggregations: BTreeMap<String, Vec<Bucket>>,
}

/// Event counts per status
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
    pub retry: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processed + self.failed + self.retry
    }

    pub(crate) fn add(&mut self, status: EventStatus, count: u64) {
        match status {
            EventStatus::Pending => self.pending += count,
            EventStatus::Processed => self.processed += count,
            EventStatus::Failed => self.failed += count,
            EventStatus::Retry => self.retry += count,
        }
    }
}
