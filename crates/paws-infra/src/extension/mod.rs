//! Extension adapters.
//!
//! - `shell` -- the built-in `Bash` extension
//! - `registry` -- name-to-invoker routing used as the engine's invoker

pub mod registry;
pub mod shell;
