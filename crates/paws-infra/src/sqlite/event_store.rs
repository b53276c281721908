//! SQLite event store implementation.
//!
//! Implements `EventStore` from `paws-core` using sqlx with split read/write
//! pools. All runs share the `run_events` table; each store instance is
//! bound to one run id. Payloads are stored as JSON text.

use chrono::{DateTime, Utc};
use paws_core::repository::event_store::EventStore;
use paws_types::error::EventLogError;
use paws_types::event::{Event, EventPayload, EventType};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed event store for a single run.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: DatabasePool,
    run_id: Uuid,
}

impl SqliteEventStore {
    pub fn new(pool: DatabasePool, run_id: Uuid) -> Self {
        Self { pool, run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct EventRow {
    seq: i64,
    timestamp: String,
    step_id: Option<String>,
    event_type: String,
    payload: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            seq: row.try_get("seq")?,
            timestamp: row.try_get("timestamp")?,
            step_id: row.try_get("step_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
        })
    }

    fn into_event(self) -> Result<Event, EventLogError> {
        let seq = u64::try_from(self.seq)
            .map_err(|_| EventLogError::Query(format!("negative seq: {}", self.seq)))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| EventLogError::Query(format!("invalid timestamp '{}': {e}", self.timestamp)))?;
        let event_type: EventType = self.event_type.parse().map_err(EventLogError::Query)?;
        let payload: EventPayload = serde_json::from_str(&self.payload)?;

        Ok(Event {
            seq,
            timestamp,
            step_id: self.step_id,
            event_type,
            payload,
        })
    }
}

fn query_error(err: sqlx::Error) -> EventLogError {
    EventLogError::Query(err.to_string())
}

// ---------------------------------------------------------------------------
// EventStore impl
// ---------------------------------------------------------------------------

impl EventStore for SqliteEventStore {
    async fn append(&self, event: &Event) -> Result<(), EventLogError> {
        let run_id = self.run_id.to_string();

        let (last,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(seq) FROM run_events WHERE run_id = ?")
                .bind(&run_id)
                .fetch_one(&self.pool.writer)
                .await
                .map_err(query_error)?;
        let expected = last.map_or(1, |s| s as u64 + 1);
        if event.seq != expected {
            return Err(EventLogError::OutOfOrder {
                expected,
                actual: event.seq,
            });
        }

        let seq = i64::try_from(event.seq)
            .map_err(|_| EventLogError::Query(format!("seq out of range: {}", event.seq)))?;
        let payload = serde_json::to_string(&event.payload)?;

        sqlx::query(
            "INSERT INTO run_events (run_id, seq, timestamp, step_id, event_type, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&run_id)
        .bind(seq)
        .bind(event.timestamp.to_rfc3339())
        .bind(event.step_id.as_deref())
        .bind(event.event_type.as_str())
        .bind(payload)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        let rows = sqlx::query(
            "SELECT seq, timestamp, step_id, event_type, payload
             FROM run_events WHERE run_id = ? ORDER BY seq ASC",
        )
        .bind(self.run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                EventRow::from_row(row)
                    .map_err(query_error)
                    .and_then(EventRow::into_event)
            })
            .collect()
    }
}

/// Every run id with at least one stored event, oldest first.
pub async fn list_run_ids(pool: &DatabasePool) -> Result<Vec<Uuid>, EventLogError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT run_id FROM run_events GROUP BY run_id ORDER BY MIN(timestamp)")
            .fetch_all(&pool.reader)
            .await
            .map_err(query_error)?;

    rows.into_iter()
        .map(|(id,)| {
            Uuid::parse_str(&id).map_err(|e| EventLogError::Query(format!("invalid run id '{id}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use paws_core::workflow::event_log::EventLog;
    use std::collections::BTreeMap;

    async fn test_pool() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("events.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, pool)
    }

    fn completed(value: &str) -> EventPayload {
        EventPayload {
            outputs: Some(BTreeMap::from([("stdout".to_string(), value.to_string())])),
            attempt: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_round_trips_event_order() {
        let (_dir, pool) = test_pool().await;
        let store = SqliteEventStore::new(pool, Uuid::now_v7());
        let mut log = EventLog::new(&store);

        log.append(None, EventType::RunStarted, EventPayload::default()).await.unwrap();
        log.append(Some("a"), EventType::Started, EventPayload::default()).await.unwrap();
        log.append(Some("a"), EventType::Completed, completed("one")).await.unwrap();
        log.append(None, EventType::RunSucceeded, EventPayload::default()).await.unwrap();

        let events = store.read_all().await.unwrap();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::RunStarted,
                EventType::Started,
                EventType::Completed,
                EventType::RunSucceeded
            ]
        );
        assert_eq!(events[2].payload, completed("one"));
        assert_eq!(events[2].step_id.as_deref(), Some("a"));
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let (_dir, pool) = test_pool().await;
        let first = SqliteEventStore::new(pool.clone(), Uuid::now_v7());
        let second = SqliteEventStore::new(pool.clone(), Uuid::now_v7());

        EventLog::new(&first)
            .append(None, EventType::RunStarted, EventPayload::default())
            .await
            .unwrap();
        assert!(second.read_all().await.unwrap().is_empty());

        // Each run starts its own sequence.
        EventLog::new(&second)
            .append(None, EventType::RunStarted, EventPayload::default())
            .await
            .unwrap();

        let ids = list_run_ids(&pool).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.run_id()));
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_append() {
        let (_dir, pool) = test_pool().await;
        let store = SqliteEventStore::new(pool, Uuid::now_v7());
        let mut log = EventLog::new(&store);
        log.append(None, EventType::RunStarted, EventPayload::default()).await.unwrap();

        let mut stale = EventLog::continuing(&store, 1);
        let err = stale
            .append(None, EventType::RunResumed, EventPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::OutOfOrder { expected: 2, actual: 1 }));
    }

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("events.db").display());
        let run_id = Uuid::now_v7();

        {
            let pool = DatabasePool::new(&url).await.unwrap();
            let store = SqliteEventStore::new(pool, run_id);
            EventLog::new(&store)
                .append(Some("a"), EventType::Completed, completed("kept"))
                .await
                .unwrap();
        }

        let pool = DatabasePool::new(&url).await.unwrap();
        let events = SqliteEventStore::new(pool, run_id).read_all().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, completed("kept"));
    }
}
