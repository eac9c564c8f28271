//! Event store: the append-only, session-partitioned record of every interaction.
//!
//! [`EventStore`] is the async seam the wrapper, retriever, and indexer talk to.
//! [`SqliteEventStore`] implements it over the `memory_events` table: writes are
//! idempotent by `id`, queries go through the typed filters of
//! [`query`](crate::memory::query), and `seq` doubles as the change-feed cursor.
//!
//! The synchronous helpers (`insert_event`, `query_events`, ...) take a plain
//! [`Connection`] so the CLI can use them without a runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::db::Db;
use crate::error::StoreError;
use crate::memory::query::{apply_event_filter, order_and_limit, EventFilter, EventQuery, SqlBuilder};
use crate::memory::types::{ChangeRecord, MemoryEvent};
use crate::memory::{truncate_chars, MAX_TEXTO_CHARS};

/// A session seen within a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionActivity {
    pub session_id: String,
    pub events: u64,
    pub last_activity: String,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Write an event. Returns `false` if an event with the same `id` already
    /// existed (the write is then a no-op).
    async fn upsert(&self, event: &MemoryEvent) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<MemoryEvent>, StoreError>;

    /// Filter + order + limit. Fails with [`StoreError::CrossPartition`] unless the
    /// filter names a session or is explicitly cross-partition.
    async fn query(&self, query: &EventQuery) -> Result<Vec<MemoryEvent>, StoreError>;

    async fn count(&self, filter: &EventFilter) -> Result<u64, StoreError>;

    /// Sessions with at least one event inside the window, most recent first.
    async fn list_sessions(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionActivity>, StoreError>;

    /// Change feed: events with `seq > after`, oldest first.
    async fn changes_since(&self, after: i64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError>;

    /// Highest `seq` written so far (0 when empty).
    async fn latest_seq(&self) -> Result<i64, StoreError>;

    /// Signalled after every new write, if the store supports push notification.
    fn change_notifier(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// SQLite-backed [`EventStore`].
#[derive(Clone)]
pub struct SqliteEventStore {
    db: Db,
    notify: Arc<Notify>,
}

impl SqliteEventStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn upsert(&self, event: &MemoryEvent) -> Result<bool, StoreError> {
        let event = event.clone();
        let inserted = self.with_conn(move |conn| insert_event(conn, &event)).await?;
        if inserted {
            self.notify.notify_one();
        }
        Ok(inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEvent>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| get_event(conn, &id)).await
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<MemoryEvent>, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| query_events(conn, &query)).await
    }

    async fn count(&self, filter: &EventFilter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| count_events(conn, &filter)).await
    }

    async fn list_sessions(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionActivity>, StoreError> {
        self.with_conn(move |conn| list_sessions(conn, since, until)).await
    }

    async fn changes_since(&self, after: i64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        self.with_conn(move |conn| changes_since(conn, after, limit)).await
    }

    async fn latest_seq(&self) -> Result<i64, StoreError> {
        self.with_conn(latest_seq).await
    }

    fn change_notifier(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.notify))
    }
}

// ── Synchronous core ──────────────────────────────────────────────────────────

const EVENT_COLUMNS: &str = "seq, id, session_id, agent_id, endpoint, event_type, timestamp, \
                             ts_epoch, params, response_data, texto_semantico, success, metadata";

/// Insert an event unless one with the same `id` exists. Returns whether a row was written.
pub fn insert_event(conn: &Connection, event: &MemoryEvent) -> Result<bool, StoreError> {
    if event.session_id.trim().is_empty() {
        return Err(StoreError::Corrupt("event has an empty session_id".into()));
    }
    let texto = truncate_chars(&event.texto_semantico, MAX_TEXTO_CHARS);
    let changed = conn.execute(
        "INSERT INTO memory_events (id, session_id, agent_id, endpoint, event_type, timestamp, \
         ts_epoch, params, response_data, texto_semantico, success, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
         ON CONFLICT(id) DO NOTHING",
        params![
            event.id,
            event.session_id,
            event.agent_id,
            event.endpoint,
            event.event_type.as_str(),
            event.timestamp,
            event.ts_epoch,
            serde_json::to_string(&event.params)?,
            serde_json::to_string(&event.response_data)?,
            texto,
            event.success,
            serde_json::to_string(&event.metadata)?,
        ],
    )?;
    Ok(changed == 1)
}

pub fn get_event(conn: &Connection, id: &str) -> Result<Option<MemoryEvent>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM memory_events WHERE id = ?1"),
            [id],
            RawEvent::from_row,
        )
        .optional()?;
    raw.map(RawEvent::into_event).transpose()
}

pub fn query_events(conn: &Connection, query: &EventQuery) -> Result<Vec<MemoryEvent>, StoreError> {
    if !query.filter.is_partition_safe() {
        return Err(StoreError::CrossPartition);
    }
    let mut sql = SqlBuilder::new();
    apply_event_filter(&mut sql, &query.filter);
    let statement = format!(
        "SELECT {EVENT_COLUMNS} FROM memory_events {} {}",
        sql.where_clause(),
        order_and_limit(query)
    );
    let mut stmt = conn.prepare(&statement)?;
    let rows = stmt
        .query_map(params_from_iter(sql.params()), RawEvent::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RawEvent::into_event).collect()
}

pub fn count_events(conn: &Connection, filter: &EventFilter) -> Result<u64, StoreError> {
    if !filter.is_partition_safe() {
        return Err(StoreError::CrossPartition);
    }
    let mut sql = SqlBuilder::new();
    apply_event_filter(&mut sql, filter);
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM memory_events {}", sql.where_clause()),
        params_from_iter(sql.params()),
        |r| r.get(0),
    )?;
    Ok(n as u64)
}

pub fn list_sessions(
    conn: &Connection,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Result<Vec<SessionActivity>, StoreError> {
    let filter = EventFilter {
        since,
        until,
        ..EventFilter::global()
    };
    let mut sql = SqlBuilder::new();
    apply_event_filter(&mut sql, &filter);
    let statement = format!(
        "SELECT session_id, COUNT(*), MAX(timestamp), MAX(ts_epoch) AS last_epoch \
         FROM memory_events {} GROUP BY session_id ORDER BY last_epoch DESC, session_id ASC",
        sql.where_clause()
    );
    let mut stmt = conn.prepare(&statement)?;
    let sessions = stmt
        .query_map(params_from_iter(sql.params()), |row| {
            Ok(SessionActivity {
                session_id: row.get(0)?,
                events: row.get::<_, i64>(1)? as u64,
                last_activity: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sessions)
}

pub fn changes_since(conn: &Connection, after: i64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM memory_events WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![after, limit as i64], RawEvent::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|raw| {
            let seq = raw.seq;
            raw.into_event().map(|event| ChangeRecord { seq, event })
        })
        .collect()
}

pub fn latest_seq(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM memory_events", [], |r| r.get(0))?)
}

/// Column values as stored; JSON and enum parsing happens outside the row closure
/// so failures surface as [`StoreError::Corrupt`].
struct RawEvent {
    seq: i64,
    id: String,
    session_id: String,
    agent_id: String,
    endpoint: String,
    event_type: String,
    timestamp: String,
    ts_epoch: i64,
    params: String,
    response_data: String,
    texto_semantico: String,
    success: bool,
    metadata: String,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            session_id: row.get(2)?,
            agent_id: row.get(3)?,
            endpoint: row.get(4)?,
            event_type: row.get(5)?,
            timestamp: row.get(6)?,
            ts_epoch: row.get(7)?,
            params: row.get(8)?,
            response_data: row.get(9)?,
            texto_semantico: row.get(10)?,
            success: row.get(11)?,
            metadata: row.get(12)?,
        })
    }

    fn into_event(self) -> Result<MemoryEvent, StoreError> {
        Ok(MemoryEvent {
            event_type: self.event_type.parse().map_err(StoreError::Corrupt)?,
            params: serde_json::from_str(&self.params)?,
            response_data: serde_json::from_str(&self.response_data)?,
            metadata: serde_json::from_str(&self.metadata)?,
            id: self.id,
            session_id: self.session_id,
            agent_id: self.agent_id,
            endpoint: self.endpoint,
            timestamp: self.timestamp,
            ts_epoch: self.ts_epoch,
            texto_semantico: self.texto_semantico,
            success: self.success,
        })
    }
}
