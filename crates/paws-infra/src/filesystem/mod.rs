//! Filesystem-backed storage.

pub mod jsonl_event_store;
