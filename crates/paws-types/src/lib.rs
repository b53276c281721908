//! Shared domain types for PAWS.
//!
//! This crate contains the types exchanged between the executor and its
//! collaborators: the workflow document, the event record that forms a run's
//! durable state, run status, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
