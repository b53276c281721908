//! JSON Lines event store.
//!
//! One file per run at `{log_dir}/{run_id}.jsonl`, one event per line.
//! Every append is flushed to disk with `sync_data` before it returns, so a
//! crash loses at most the event being written. A torn trailing line left by
//! such a crash is skipped on read and cut off before the next append.

use std::path::{Path, PathBuf};

use paws_core::repository::event_store::EventStore;
use paws_types::error::EventLogError;
use paws_types::event::Event;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

const EXTENSION: &str = "jsonl";

/// File-backed event store for a single run.
pub struct JsonlEventStore {
    path: PathBuf,
    /// Last sequence number on disk, loaded on first append.
    last_seq: Mutex<Option<u64>>,
}

impl JsonlEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seq: Mutex::new(None),
        }
    }

    /// Store for `run_id` inside `log_dir`.
    pub fn for_run(log_dir: &Path, run_id: Uuid) -> Self {
        Self::new(log_dir.join(format!("{run_id}.{EXTENSION}")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_events(&self) -> Result<Vec<Event>, EventLogError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                // A torn final line is what a crash mid-append leaves behind.
                Err(err) if idx + 1 == lines.len() && !content.ends_with('\n') => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "ignoring incomplete trailing event"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(events)
    }

    /// Cut a torn trailing line back to the last newline so the next append
    /// starts on a fresh line.
    async fn truncate_torn_tail(&self) -> Result<(), EventLogError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if bytes.last().is_none_or(|b| *b == b'\n') {
            return Ok(());
        }

        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |pos| pos + 1);
        tracing::warn!(
            path = %self.path.display(),
            dropped_bytes = bytes.len() - keep,
            "truncating incomplete trailing event before append"
        );
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await?;
        file.set_len(keep as u64).await?;
        file.sync_data().await?;
        Ok(())
    }
}

impl EventStore for JsonlEventStore {
    async fn append(&self, event: &Event) -> Result<(), EventLogError> {
        let mut last_seq = self.last_seq.lock().await;
        // Cleared until this append lands, so a failed write is re-checked
        // for a torn tail next time.
        let last = match last_seq.take() {
            Some(seq) => seq,
            None => {
                let last = self.read_events().await?.last().map_or(0, |e| e.seq);
                self.truncate_torn_tail().await?;
                last
            }
        };
        if event.seq != last + 1 {
            *last_seq = Some(last);
            return Err(EventLogError::OutOfOrder {
                expected: last + 1,
                actual: event.seq,
            });
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        *last_seq = Some(event.seq);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        self.read_events().await
    }
}

/// Run ids that have a log file in `log_dir`, sorted (v7 ids sort by time).
pub async fn list_run_ids(log_dir: &Path) -> Result<Vec<Uuid>, EventLogError> {
    let mut entries = match tokio::fs::read_dir(log_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == EXTENSION) {
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
    }
    ids.sort();
    Ok(ids)
}
