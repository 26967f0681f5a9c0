//! Stats and Search
//!
//! Read-only views over the event store combined with live hub and
//! pipeline counters.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::pipeline::{EventPipeline, PipelineError, PipelineResult};
use crate::store::{
    AggregationField, EventStatus, Priority, SearchQuery, SearchResult, StatusCounts, TimeWindow,
};
use crate::websocket::HubMetricsSnapshot;

/// Default number of search hits
pub const DEFAULT_SEARCH_SIZE: usize = 100;
/// Largest accepted number of search hits
pub const MAX_SEARCH_SIZE: usize = 1000;

/// Look-back window for realtime stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatsInterval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    #[default]
    OneHour,
    OneDay,
}

impl StatsInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsInterval::OneMinute => "1m",
            StatsInterval::FiveMinutes => "5m",
            StatsInterval::FifteenMinutes => "15m",
            StatsInterval::OneHour => "1h",
            StatsInterval::OneDay => "24h",
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            StatsInterval::OneMinute => 1,
            StatsInterval::FiveMinutes => 5,
            StatsInterval::FifteenMinutes => 15,
            StatsInterval::OneHour => 60,
            StatsInterval::OneDay => 24 * 60,
        }
    }
}

impl fmt::Display for StatsInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(StatsInterval::OneMinute),
            "5m" => Ok(StatsInterval::FiveMinutes),
            "15m" => Ok(StatsInterval::FifteenMinutes),
            "1h" => Ok(StatsInterval::OneHour),
            "24h" | "1d" => Ok(StatsInterval::OneDay),
            other => Err(format!(
                "Invalid interval: {} (expected 1m, 5m, 15m, 1h or 24h)",
                other
            )),
        }
    }
}

/// Snapshot returned by `GET /stats/realtime`
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStats {
    pub interval: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub window_start: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub counts: StatusCounts,
    pub total: u64,
    pub events_per_minute: f64,
    /// Processed share of finished events (processed + failed), 0..=1
    pub success_rate: f64,
    pub active_connections: usize,
    pub scheduled_retries: usize,
    pub queue_depth: usize,
    pub hub: HubMetricsSnapshot,
}

/// Filters of a search request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
}

/// Body of `POST /search`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    /// Free text matched against type, source and payload
    pub query: Option<String>,
    pub filters: SearchFilters,
    pub time_range: TimeWindow,
    pub aggregations: Vec<AggregationField>,
    pub size: Option<usize>,
}

/// Thin query layer over the pipeline's store and counters
pub struct StatsFacade {
    pipeline: Arc<EventPipeline>,
}

impl StatsFacade {
    pub fn new(pipeline: Arc<EventPipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn realtime_stats(
        &self,
        interval: Option<&str>,
        event_type: Option<&str>,
    ) -> PipelineResult<RealtimeStats> {
        let interval = match interval {
            Some(raw) => raw.parse().map_err(PipelineError::Validation)?,
            None => StatsInterval::default(),
        };
        let event_type = event_type.map(str::trim).filter(|t| !t.is_empty());

        let generated_at = Utc::now();
        let window_start = generated_at - Duration::minutes(interval.minutes());

        let counts = self
            .pipeline
            .store()
            .count_by_status(Some(window_start), event_type)
            .await?;
        let total = counts.total();

        let finished = counts.processed + counts.failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            counts.processed as f64 / finished as f64
        };

        Ok(RealtimeStats {
            interval: interval.to_string(),
            event_type: event_type.map(str::to_string),
            window_start,
            generated_at,
            counts,
            total,
            events_per_minute: total as f64 / interval.minutes() as f64,
            success_rate,
            active_connections: self.pipeline.hub().connection_count().await,
            scheduled_retries: self.pipeline.scheduled_retry_count(),
            queue_depth: self.pipeline.queue_depth(),
            hub: self.pipeline.hub().metrics(),
        })
    }

    pub async fn search(&self, request: SearchRequest) -> PipelineResult<SearchResult> {
        let query = build_search_query(request)?;
        tracing::debug!(text = ?query.text, size = query.size, "Searching events");
        Ok(self.pipeline.store().search(&query).await?)
    }
}

fn build_search_query(request: SearchRequest) -> PipelineResult<SearchQuery> {
    let size = request.size.unwrap_or(DEFAULT_SEARCH_SIZE);
    if size == 0 {
        return Err(PipelineError::Validation(
            "Size must be greater than zero".to_string(),
        ));
    }

    if let (Some(from), Some(to)) = (request.time_range.from, request.time_range.to) {
        if from > to {
            return Err(PipelineError::Validation(
                "time_range.from must not be after time_range.to".to_string(),
            ));
        }
    }

    let status = request
        .filters
        .status
        .as_deref()
        .map(EventStatus::from_str)
        .transpose()
        .map_err(PipelineError::Validation)?;
    let priority = request
        .filters
        .priority
        .as_deref()
        .map(Priority::from_str)
        .transpose()
        .map_err(PipelineError::Validation)?;

    let mut aggregations = request.aggregations;
    aggregations.sort();
    aggregations.dedup();

    Ok(SearchQuery {
        text: request.query.filter(|q| !q.trim().is_empty()),
        event_type: request.filters.event_type,
        source: request.filters.source,
        status,
        priority,
        window: request.time_range,
        aggregations,
        size: size.min(MAX_SEARCH_SIZE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EventProcessor, NewEvent, PipelineConfig, ProcessingError};
    use crate::store::{Event, SqliteEventStore};
    use crate::websocket::{ConnectionHub, HubConfig};
    use async_trait::async_trait;

    /// Leaves every event alone so counts stay predictable
    struct Idle;

    #[async_trait]
    impl EventProcessor for Idle {
        async fn process(&self, _event: &Event) -> Result<(), ProcessingError> {
            std::future::pending().await
        }
    }

    fn facade() -> (StatsFacade, Arc<EventPipeline>) {
        let store = Arc::new(SqliteEventStore::in_memory().unwrap());
        let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
        let pipeline = Arc::new(EventPipeline::new(
            store,
            hub,
            Arc::new(Idle),
            PipelineConfig::default(),
        ));
        (StatsFacade::new(Arc::clone(&pipeline)), pipeline)
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!("1m".parse::<StatsInterval>(), Ok(StatsInterval::OneMinute));
        assert_eq!("24h".parse::<StatsInterval>(), Ok(StatsInterval::OneDay));
        assert!("2h".parse::<StatsInterval>().is_err());
        assert_eq!(StatsInterval::default().as_str(), "1h");
    }

    #[test]
    fn test_search_size_defaults_and_caps() {
        let query = build_search_query(SearchRequest::default()).unwrap();
        assert_eq!(query.size, DEFAULT_SEARCH_SIZE);

        let query = build_search_query(SearchRequest {
            size: Some(5000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(query.size, MAX_SEARCH_SIZE);

        assert!(build_search_query(SearchRequest {
            size: Some(0),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_search_rejects_bad_filters() {
        let request = SearchRequest {
            filters: SearchFilters {
                status: Some("done".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            build_search_query(request),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_search_request_deserialize() {
        let json = r#"{
            "query": "checkout",
            "filters": {"type": "order", "status": "pending"},
            "aggregations": ["source", "type", "source"],
            "size": 10
        }"#;
        let request: SearchRequest = serde_json::from_str(json).unwrap();
        let query = build_search_query(request).unwrap();
        assert_eq!(query.text.as_deref(), Some("checkout"));
        assert_eq!(query.status, Some(EventStatus::Pending));
        assert_eq!(
            query.aggregations,
            vec![AggregationField::Type, AggregationField::Source]
        );
    }

    #[tokio::test]
    async fn test_realtime_stats_counts_window() {
        let (facade, pipeline) = facade();

        pipeline.publish(NewEvent::new("click"), None).await.unwrap();
        pipeline.publish(NewEvent::new("click"), None).await.unwrap();
        pipeline.publish(NewEvent::new("signup"), None).await.unwrap();

        let old = Event::new("click", "web");
        let old = Event {
            created_at: old.created_at - Duration::hours(3),
            ..old
        };
        pipeline.store().insert(&old).await.unwrap();

        let stats = facade.realtime_stats(None, None).await.unwrap();
        assert_eq!(stats.interval, "1h");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.counts.pending, 3);
        assert_eq!(stats.success_rate, 0.0);
        assert!((stats.events_per_minute - 3.0 / 60.0).abs() < f64::EPSILON);

        let clicks = facade.realtime_stats(Some("24h"), Some("click")).await.unwrap();
        assert_eq!(clicks.total, 3);
        assert_eq!(clicks.event_type.as_deref(), Some("click"));

        assert!(matches!(
            facade.realtime_stats(Some("7d"), None).await,
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_search_through_facade() {
        let (facade, pipeline) = facade();
        pipeline
            .publish(
                NewEvent::new("order").source("shop").payload(serde_json::json!({"sku": "A-1"})),
                None,
            )
            .await
            .unwrap();
        pipeline.publish(NewEvent::new("click"), None).await.unwrap();

        let result = facade
            .search(SearchRequest {
                query: Some("A-1".to_string()),
                aggregations: vec![AggregationField::Source],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.events[0].event_type, "order");
        assert_eq!(result.aggregations["source"][0].key, "shop");
    }
}
