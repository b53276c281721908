use thiserror::Error;

/// Errors from event store operations (used by the `EventStore` trait in
/// paws-core). Any of these is fatal to the run that hit it.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event store I/O error: {0}")]
    Io(String),

    #[error("event serialization error: {0}")]
    Serialization(String),

    #[error("event store query error: {0}")]
    Query(String),

    #[error("event out of order: expected seq {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
}

impl From<std::io::Error> for EventLogError {
    fn from(err: std::io::Error) -> Self {
        EventLogError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EventLogError {
    fn from(err: serde_json::Error) -> Self {
        EventLogError::Serialization(err.to_string())
    }
}
