//! Durable lifecycle event log
//!
//! Append-only SQLite table of container lifecycle events. Every append is
//! committed (WAL journal, `synchronous = FULL`) before it returns, so an
//! acknowledged event survives a crash or restart.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::models::{LifecycleEvent, StoredEvent};

/// Maximum pooled connections for an on-disk store
const MAX_CONNECTIONS: u32 = 4;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    container_name TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_time DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
)
"#;

/// Text layout of `event_time`, matching the column default's
/// `strftime('%Y-%m-%d %H:%M:%f')` so stored times compare as strings
const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_container_name ON events (container_name)";

/// Selection criteria for [`EventStore::query`]
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub entity_name: Option<String>,
    pub event_type: Option<String>,
    /// Inclusive lower bound on event time
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on event time
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches
    pub limit: Option<u32>,
}

impl EventFilter {
    pub fn for_entity(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: Some(entity_name.into()),
            ..Default::default()
        }
    }
}

/// Handle to the event log. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Open (creating if missing) the event log at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let path_display = path.display().to_string();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::Open {
                    path: path_display.clone(),
                    source: sqlx::Error::Io(e),
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|source| PersistenceError::Open {
                path: path_display.clone(),
                source,
            })?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(path = %path_display, "Opened event store");
        Ok(store)
    }

    /// Open a private in-memory event log (not durable)
    pub async fn open_in_memory() -> Result<Self, PersistenceError> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|source| {
                PersistenceError::Open {
                    path: ":memory:".to_string(),
                    source,
                }
            })?;

        // Each in-memory connection is its own database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| PersistenceError::Open {
                path: ":memory:".to_string(),
                source,
            })?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// Append an event and return its id once the write is committed
    pub async fn append(&self, event: &LifecycleEvent) -> Result<i64, PersistenceError> {
        let result = match event.event_time {
            Some(event_time) => {
                sqlx::query(
                    "INSERT INTO events (container_name, event_type, event_time) VALUES (?, ?, ?)",
                )
                .bind(&event.entity_name)
                .bind(&event.event_type)
                .bind(stored_time(event_time))
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("INSERT INTO events (container_name, event_type) VALUES (?, ?)")
                    .bind(&event.entity_name)
                    .bind(&event.event_type)
                    .execute(&self.pool)
                    .await?
            }
        };

        let id = result.last_insert_rowid();
        debug!(
            id = id,
            container = %event.entity_name,
            event_type = %event.event_type,
            "Appended lifecycle event"
        );
        Ok(id)
    }

    /// Events matching `filter`, oldest first
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, PersistenceError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, container_name, event_type, event_time FROM events WHERE 1 = 1",
        );

        if let Some(name) = &filter.entity_name {
            qb.push(" AND container_name = ").push_bind(name.clone());
        }
        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(since) = filter.since {
            qb.push(" AND event_time >= ").push_bind(stored_time(since));
        }
        if let Some(until) = filter.until {
            qb.push(" AND event_time <= ").push_bind(stored_time(until));
        }

        match filter.limit {
            Some(limit) => {
                // Newest N, returned back in insertion order
                qb.push(" ORDER BY id DESC LIMIT ").push_bind(i64::from(limit));
                let mut events = qb
                    .build()
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(row_to_event)
                    .collect::<Result<Vec<_>, _>>()?;
                events.reverse();
                Ok(events)
            }
            None => {
                qb.push(" ORDER BY id ASC");
                qb.build()
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(row_to_event)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(PersistenceError::from)
            }
        }
    }

    /// Total number of events in the log
    pub async fn count(&self) -> Result<i64, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Flush and close all connections
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Closed event store");
    }
}

/// Canonical text form of an event time, millisecond precision
fn stored_time(time: DateTime<Utc>) -> String {
    time.naive_utc().format(EVENT_TIME_FORMAT).to_string()
}

fn row_to_event(row: &SqliteRow) -> Result<StoredEvent, sqlx::Error> {
    let event_time: NaiveDateTime = row.try_get("event_time")?;
    Ok(StoredEvent {
        id: row.try_get("id")?,
        entity_name: row.try_get("container_name")?,
        event_type: row.try_get("event_type")?,
        event_time: event_time.and_utc(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_query_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = EventStore::open(temp_dir.path().join("events.db"))
            .await
            .unwrap();

        for event_type in ["create", "start", "die", "stop"] {
            store
                .append(&LifecycleEvent::new("web", event_type))
                .await
                .unwrap();
        }

        let events = store.query(&EventFilter::for_entity("web")).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["create", "start", "die", "stop"]);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_durable_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events.db");

        {
            let store = EventStore::open(&path).await.unwrap();
            store
                .append(&LifecycleEvent::new("db", "start"))
                .await
                .unwrap();
            store.close().await;
        }

        let reopened = EventStore::open(&path).await.unwrap();
        let events = reopened.query(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_name, "db");
        assert_eq!(events[0].event_type, "start");
    }

    #[tokio::test]
    async fn test_open_failure_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("events.db");

        let err = EventStore::open(&path).await.unwrap_err();
        match err {
            PersistenceError::Open { path: reported, .. } => {
                assert_eq!(reported, path.display().to_string());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_default_event_time_is_write_time() {
        let store = EventStore::open_in_memory().await.unwrap();
        let before = Utc::now() - chrono::Duration::seconds(1);

        store
            .append(&LifecycleEvent::new("web", "start"))
            .await
            .unwrap();

        let events = store.query(&EventFilter::default()).await.unwrap();
        assert!(events[0].event_time >= before);
        assert!(events[0].event_time <= Utc::now() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_explicit_event_time_round_trips() {
        let store = EventStore::open_in_memory().await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        store
            .append(&LifecycleEvent::new("web", "die").at(at))
            .await
            .unwrap();

        let events = store.query(&EventFilter::default()).await.unwrap();
        assert_eq!(events[0].event_time, at);
    }

    #[tokio::test]
    async fn test_filters() {
        let store = EventStore::open_in_memory().await.unwrap();
        let day = |d: u32| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();

        store
            .append(&LifecycleEvent::new("web", "start").at(day(1)))
            .await
            .unwrap();
        store
            .append(&LifecycleEvent::new("db", "start").at(day(2)))
            .await
            .unwrap();
        store
            .append(&LifecycleEvent::new("web", "stop").at(day(3)))
            .await
            .unwrap();
        store
            .append(&LifecycleEvent::new("web", "start").at(day(4)))
            .await
            .unwrap();

        let starts = store
            .query(&EventFilter {
                event_type: Some("start".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(starts.len(), 3);

        let window = store
            .query(&EventFilter {
                entity_name: Some("web".to_string()),
                since: Some(day(2)),
                until: Some(day(3)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].event_type, "stop");

        let latest = store
            .query(&EventFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<i64> = latest.iter().map(|e| e.id).collect();
        assert_eq!(latest.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(latest[1].event_type, "start");
        assert_eq!(latest[0].event_type, "stop");

        assert_eq!(store.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_until_bound_includes_default_stamped_event() {
        let store = EventStore::open_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO events (container_name, event_type, event_time) \
             VALUES ('web', 'start', '2024-01-01 12:00:00.000')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let stored = store.query(&EventFilter::default()).await.unwrap();
        let at = stored[0].event_time;
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());

        let hits = store
            .query(&EventFilter {
                since: Some(at),
                until: Some(at),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_and_default_times_share_one_format() {
        let store = EventStore::open_in_memory().await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
            + chrono::Duration::microseconds(250_500);

        store
            .append(&LifecycleEvent::new("web", "die").at(at))
            .await
            .unwrap();
        store
            .append(&LifecycleEvent::new("web", "start"))
            .await
            .unwrap();

        let raw: Vec<String> =
            sqlx::query_scalar("SELECT CAST(event_time AS TEXT) FROM events ORDER BY id")
                .fetch_all(&store.pool)
                .await
                .unwrap();
        assert_eq!(raw[0], "2024-03-01 12:30:00.250");
        assert_eq!(raw[1].len(), raw[0].len());
        assert_eq!(raw[1].find('.'), Some(19));
    }

    #[tokio::test]
    async fn test_concurrent_appends() {
        let temp_dir = TempDir::new().unwrap();
        let store = EventStore::open(temp_dir.path().join("events.db"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    store
                        .append(&LifecycleEvent::new(format!("container-{}", i), "start"))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 80);
        let one = store
            .query(&EventFilter::for_entity("container-3"))
            .await
            .unwrap();
        assert_eq!(one.len(), 10);
    }
}
