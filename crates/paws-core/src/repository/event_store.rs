//! Event store trait definition.

use paws_types::error::EventLogError;
use paws_types::event::Event;
use tokio::sync::Mutex;

/// Append-only storage for one run's events.
///
/// Implementations live in paws-infra (JSON Lines file, SQLite) plus the
/// in-memory store below. Uses native async fn in traits (Rust 2024 edition,
/// no async_trait macro).
pub trait EventStore: Send + Sync {
    /// Durably append one event. Events arrive in `seq` order.
    fn append(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), EventLogError>> + Send;

    /// Read every event of the run, ordered by `seq`.
    fn read_all(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Event>, EventLogError>> + Send;
}

/// Event store backed by a vector. Used for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with an existing log, e.g. a truncated copy of another run.
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

impl EventStore for InMemoryEventStore {
    async fn append(&self, event: &Event) -> Result<(), EventLogError> {
        let mut events = self.events.lock().await;
        let expected = events.last().map_or(1, |e| e.seq + 1);
        if event.seq != expected {
            return Err(EventLogError::OutOfOrder {
                expected,
                actual: event.seq,
            });
        }
        events.push(event.clone());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        Ok(self.events.lock().await.clone())
    }
}

impl<T: EventStore> EventStore for &T {
    fn append(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), EventLogError>> + Send {
        (**self).append(event)
    }

    fn read_all(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Event>, EventLogError>> + Send {
        (**self).read_all()
    }
}

impl<T: EventStore> EventStore for std::sync::Arc<T> {
    fn append(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), EventLogError>> + Send {
        (**self).append(event)
    }

    fn read_all(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Event>, EventLogError>> + Send {
        (**self).read_all()
    }
}
