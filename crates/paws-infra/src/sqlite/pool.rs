//! SQLite connection pools for the run event store.
//!
//! One writer connection serializes appends; up to eight read-only
//! connections serve replays and run listings. The database runs in WAL mode
//! so readers never block the writer.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Value stored in `PRAGMA user_version` once the schema is in place.
pub const SCHEMA_VERSION: i64 = 1;

const MAX_READERS: u32 = 8;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS run_events (
        run_id     TEXT    NOT NULL,
        seq        INTEGER NOT NULL CHECK (seq > 0),
        timestamp  TEXT    NOT NULL,
        step_id    TEXT,
        event_type TEXT    NOT NULL,
        payload    TEXT    NOT NULL,
        PRIMARY KEY (run_id, seq)
    ) WITHOUT ROWID",
    "CREATE INDEX IF NOT EXISTS idx_run_events_type ON run_events (event_type, run_id)",
];

/// Reader/writer pool pair over one database file.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `database_url`.
    ///
    /// The schema is applied on the writer before any reader connects, so
    /// read-only connections always see the table.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        apply_schema(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(MAX_READERS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = database_url, "opened run event database");
        Ok(Self { reader, writer })
    }

    /// Close both pools, waiting for in-flight queries.
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

async fn apply_schema(writer: &SqlitePool) -> Result<(), sqlx::Error> {
    let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
        .fetch_one(writer)
        .await?;
    if version > SCHEMA_VERSION {
        return Err(sqlx::Error::Protocol(format!(
            "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    let mut tx = writer.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    // PRAGMA does not accept bound parameters.
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}
