//! SQLite Event Store
//!
//! Single-connection SQLite store. Insertion order is tracked by an
//! autoincrement `seq` column, which doubles as the pagination cursor.
//!
//! The connection lives behind a `std::sync::Mutex` (a rusqlite `Connection`
//! is not `Sync`); no lock is ever held across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::error::{StoreError, StoreResult};
use super::query::{
    Bucket, Direction, EventPage, ListQuery, SearchQuery, SearchResult, StatusCounts,
};
use super::types::{from_millis, now_millis, Event, EventId, EventStatus, Priority};
use super::EventStore;

const COLUMNS: &str = "seq, id, event_type, source, payload, priority, status, \
                       created_at, processed_at, retry_count, error_message";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        event_type TEXT NOT NULL CHECK (length(event_type) > 0),
        source TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        processed_at INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_events_status ON events(status, seq);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
    CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
";

/// SQLite-backed [`EventStore`]
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteEventStore {
    /// Create or open a store at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = ?path, "Opened event store");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create a throwaway in-memory store
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Location on disk, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(format!("Failed to acquire store lock: {}", e)))
    }
}

/// Accumulates `WHERE` clauses with numbered parameters
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Filter {
    fn push(&mut self, value: impl Into<Value>) -> usize {
        self.values.push(value.into());
        self.values.len()
    }

    fn eq(&mut self, column: &str, value: impl Into<Value>) {
        let n = self.push(value);
        self.clauses.push(format!("{} = ?{}", column, n));
    }

    fn cmp(&mut self, column: &str, op: &str, value: impl Into<Value>) {
        let n = self.push(value);
        self.clauses.push(format!("{} {} ?{}", column, op, n));
    }

    fn contains_any(&mut self, columns: &[&str], needle: &str) {
        let n = self.push(format!("%{}%", escape_like(needle)));
        let ors: Vec<String> = columns
            .iter()
            .map(|c| format!("{} LIKE ?{} ESCAPE '\\'", c, n))
            .collect();
        self.clauses.push(format!("({})", ors.join(" OR ")));
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Row as stored, before enum/JSON decoding
struct RawEvent {
    seq: i64,
    id: String,
    event_type: String,
    source: String,
    payload: String,
    priority: String,
    status: String,
    created_at: i64,
    processed_at: Option<i64>,
    retry_count: i64,
    error_message: Option<String>,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            event_type: row.get(2)?,
            source: row.get(3)?,
            payload: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            processed_at: row.get(8)?,
            retry_count: row.get(9)?,
            error_message: row.get(10)?,
        })
    }

    fn into_event(self) -> StoreResult<Event> {
        let corrupt = |reason: String| StoreError::Corruption {
            id: self.id.clone(),
            reason,
        };

        let status: EventStatus = self.status.parse().map_err(corrupt)?;
        let priority: Priority = self.priority.parse().map_err(corrupt)?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("payload: {}", e)))?;

        Ok(Event {
            id: self.id,
            event_type: self.event_type,
            source: self.source,
            payload,
            priority,
            status,
            created_at: from_millis(self.created_at),
            processed_at: self.processed_at.map(from_millis),
            retry_count: self.retry_count.max(0) as u32,
            error_message: self.error_message,
        })
    }
}

fn insert_row(conn: &Connection, event: &Event) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO events (id, event_type, source, payload, priority, status,
                             created_at, processed_at, retry_count, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.id,
            event.event_type,
            event.source,
            serde_json::to_string(&event.payload)?,
            event.priority.as_str(),
            event.status.as_str(),
            event.created_at.timestamp_millis(),
            event.processed_at.map(|t| t.timestamp_millis()),
            event.retry_count,
            event.error_message,
        ],
    )?;
    Ok(())
}

fn select_one(conn: &Connection, id: &str) -> StoreResult<Option<Event>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM events WHERE id = ?1", COLUMNS),
            params![id],
            RawEvent::from_row,
        )
        .optional()?;

    raw.map(RawEvent::into_event).transpose()
}

fn select_many(conn: &Connection, sql: &str, values: &[Value]) -> StoreResult<Vec<RawEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), RawEvent::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert(&self, event: &Event) -> StoreResult<()> {
        let conn = self.conn()?;
        insert_row(&conn, event)
    }

    async fn insert_batch(&self, events: &[Event]) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for event in events {
            insert_row(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Event>> {
        let conn = self.conn()?;
        select_one(&conn, id)
    }

    async fn list(&self, query: &ListQuery) -> StoreResult<EventPage> {
        let mut filter = Filter::default();

        if let Some(event_type) = &query.event_type {
            filter.eq("event_type", event_type.clone());
        }
        if let Some(source) = &query.source {
            filter.eq("source", source.clone());
        }
        if let Some(status) = query.status {
            filter.eq("status", status.as_str().to_string());
        }
        if let Some(cursor) = &query.cursor {
            let seq: i64 = cursor
                .parse()
                .map_err(|_| StoreError::InvalidCursor(cursor.clone()))?;
            match query.direction {
                Direction::Asc => filter.cmp("seq", ">", seq),
                Direction::Desc => filter.cmp("seq", "<", seq),
            }
        }

        let order = match query.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };

        // One extra row tells us whether another page exists
        let fetch = query.limit as i64 + 1;
        let sql = format!(
            "SELECT {} FROM events{} ORDER BY seq {} LIMIT {}",
            COLUMNS,
            filter.sql(),
            order,
            fetch
        );

        let mut rows = {
            let conn = self.conn()?;
            select_many(&conn, &sql, &filter.values)?
        };

        let has_more = rows.len() > query.limit;
        rows.truncate(query.limit);

        let next_cursor = if has_more {
            rows.last().map(|r| r.seq.to_string())
        } else {
            None
        };

        let events = rows
            .into_iter()
            .map(RawEvent::into_event)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(EventPage {
            events,
            next_cursor,
            has_more,
        })
    }

    async fn find_by_status(&self, status: EventStatus, limit: usize) -> StoreResult<Vec<Event>> {
        let rows = {
            let conn = self.conn()?;
            select_many(
                &conn,
                &format!(
                    "SELECT {} FROM events WHERE status = ?1 ORDER BY seq ASC LIMIT ?2",
                    COLUMNS
                ),
                &[
                    Value::Text(status.as_str().to_string()),
                    Value::Integer(limit as i64),
                ],
            )?
        };

        rows.into_iter().map(RawEvent::into_event).collect()
    }

    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        error_message: Option<String>,
    ) -> StoreResult<Option<Event>> {
        let conn = self.conn()?;

        let changed = if status == EventStatus::Processed {
            conn.execute(
                "UPDATE events SET status = ?1, error_message = ?2, processed_at = ?3
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    error_message,
                    now_millis().timestamp_millis(),
                    id
                ],
            )?
        } else {
            conn.execute(
                "UPDATE events SET status = ?1, error_message = ?2, processed_at = NULL
                 WHERE id = ?3",
                params![status.as_str(), error_message, id],
            )?
        };

        if changed == 0 {
            return Ok(None);
        }

        select_one(&conn, id)
    }

    async fn save(&self, event: &Event) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE events SET event_type = ?1, source = ?2, payload = ?3, priority = ?4,
                               status = ?5, processed_at = ?6, retry_count = ?7,
                               error_message = ?8
             WHERE id = ?9",
            params![
                event.event_type,
                event.source,
                serde_json::to_string(&event.payload)?,
                event.priority.as_str(),
                event.status.as_str(),
                event.processed_at.map(|t| t.timestamp_millis()),
                event.retry_count,
                event.error_message,
                event.id,
            ],
        )?;
        Ok(changed > 0)
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    async fn delete_batch(&self, ids: &[EventId]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM events WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    async fn count_by_status(
        &self,
        since: Option<DateTime<Utc>>,
        event_type: Option<&str>,
    ) -> StoreResult<StatusCounts> {
        let mut filter = Filter::default();
        if let Some(since) = since {
            filter.cmp("created_at", ">=", since.timestamp_millis());
        }
        if let Some(event_type) = event_type {
            filter.eq("event_type", event_type.to_string());
        }

        let sql = format!(
            "SELECT status, COUNT(*) FROM events{} GROUP BY status",
            filter.sql()
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(filter.values.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.parse::<EventStatus>() {
                Ok(status) => counts.add(status, count.max(0) as u64),
                Err(_) => tracing::warn!(status = %status, "Skipping unknown status in counts"),
            }
        }

        Ok(counts)
    }

    async fn search(&self, query: &SearchQuery) -> StoreResult<SearchResult> {
        let mut filter = Filter::default();

        if let Some(text) = query.text.as_deref().filter(|t| !t.is_empty()) {
            filter.contains_any(&["event_type", "source", "payload"], text);
        }
        if let Some(event_type) = &query.event_type {
            filter.eq("event_type", event_type.clone());
        }
        if let Some(source) = &query.source {
            filter.eq("source", source.clone());
        }
        if let Some(status) = query.status {
            filter.eq("status", status.as_str().to_string());
        }
        if let Some(priority) = query.priority {
            filter.eq("priority", priority.as_str().to_string());
        }
        if let Some(from) = query.window.from {
            filter.cmp("created_at", ">=", from.timestamp_millis());
        }
        if let Some(to) = query.window.to {
            filter.cmp("created_at", "<=", to.timestamp_millis());
        }

        let where_sql = filter.sql();
        let conn = self.conn()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM events{}", where_sql),
            params_from_iter(filter.values.iter()),
            |row| row.get(0),
        )?;

        let rows = select_many(
            &conn,
            &format!(
                "SELECT {} FROM events{} ORDER BY created_at DESC, seq DESC LIMIT {}",
                COLUMNS, where_sql, query.size as i64
            ),
            &filter.values,
        )?;

        let mut aggregations = BTreeMap::new();
        for field in &query.aggregations {
            let sql = format!(
                "SELECT {col}, COUNT(*) AS n FROM events{w} GROUP BY {col} ORDER BY n DESC, {col} ASC",
                col = field.column(),
                w = where_sql
            );
            let mut stmt = conn.prepare(&sql)?;
            let buckets = stmt
                .query_map(params_from_iter(filter.values.iter()), |row| {
                    Ok(Bucket {
                        key: row.get(0)?,
                        count: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            aggregations.insert(field.name().to_string(), buckets);
        }
        drop(conn);

        let events = rows
            .into_iter()
            .map(RawEvent::into_event)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(SearchResult {
            total: total.max(0) as u64,
            events,
            aggregations,
        })
    }
}
