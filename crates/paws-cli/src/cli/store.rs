//! Event store selection for CLI commands.

use std::path::Path;

use anyhow::{Context, Result};
use paws_core::repository::event_store::EventStore;
use paws_infra::config;
use paws_infra::filesystem::jsonl_event_store::{self, JsonlEventStore};
use paws_infra::sqlite::event_store::{self as sqlite_events, SqliteEventStore};
use paws_infra::sqlite::pool::DatabasePool;
use paws_types::config::{EventStoreKind, PawsConfig};
use paws_types::error::EventLogError;
use paws_types::event::Event;
use uuid::Uuid;

/// The configured event store for one run.
pub enum RunStore {
    Jsonl(JsonlEventStore),
    Sqlite(SqliteEventStore),
}

impl RunStore {
    pub async fn open(
        kind: EventStoreKind,
        data_dir: &Path,
        config: &PawsConfig,
        run_id: Uuid,
    ) -> Result<Self> {
        match kind {
            EventStoreKind::Jsonl => Ok(RunStore::Jsonl(JsonlEventStore::for_run(
                &config::log_dir(data_dir, config),
                run_id,
            ))),
            EventStoreKind::Sqlite => {
                let pool = open_pool(data_dir, config).await?;
                Ok(RunStore::Sqlite(SqliteEventStore::new(pool, run_id)))
            }
        }
    }

    /// Where the events live, for display.
    pub fn location(&self, data_dir: &Path, config: &PawsConfig) -> String {
        match self {
            RunStore::Jsonl(store) => store.path().display().to_string(),
            RunStore::Sqlite(_) => data_dir.join(&config.database_file).display().to_string(),
        }
    }
}

impl EventStore for RunStore {
    async fn append(&self, event: &Event) -> Result<(), EventLogError> {
        match self {
            RunStore::Jsonl(store) => store.append(event).await,
            RunStore::Sqlite(store) => store.append(event).await,
        }
    }

    async fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        match self {
            RunStore::Jsonl(store) => store.read_all().await,
            RunStore::Sqlite(store) => store.read_all().await,
        }
    }
}

async fn open_pool(data_dir: &Path, config: &PawsConfig) -> Result<DatabasePool> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let url = config::database_url(data_dir, config);
    DatabasePool::new(&url)
        .await
        .with_context(|| format!("Failed to open run database at {url}"))
}

/// Every run id recorded in the selected store.
pub async fn list_runs(
    kind: EventStoreKind,
    data_dir: &Path,
    config: &PawsConfig,
) -> Result<Vec<Uuid>> {
    let ids = match kind {
        EventStoreKind::Jsonl => {
            jsonl_event_store::list_run_ids(&config::log_dir(data_dir, config)).await?
        }
        EventStoreKind::Sqlite => {
            let pool = open_pool(data_dir, config).await?;
            sqlite_events::list_run_ids(&pool).await?
        }
    };
    Ok(ids)
}
