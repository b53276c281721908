//! SQLite storage layer.
//!
//! Event store backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod event_store;
pub mod pool;
