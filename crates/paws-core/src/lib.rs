//! Workflow executor core for PAWS.
//!
//! This crate holds the deterministic side of the system: document
//! validation, the expression and interpolation language, the event log
//! fold used for resumption, and the execution engine. It also defines the
//! "ports" (event store, extension invoker, output validator) that callers
//! implement. It depends only on `paws-types` -- never on `paws-infra` or
//! any database/IO crate.

pub mod repository;
pub mod workflow;
