//! Infrastructure layer for PAWS.
//!
//! Contains implementations of the traits defined in `paws-core`: event
//! stores on SQLite and JSON Lines files, the shell extension, and the
//! extension registry handed to the engine. Also loads `config.toml`.

pub mod config;
pub mod extension;
pub mod filesystem;
pub mod sqlite;
