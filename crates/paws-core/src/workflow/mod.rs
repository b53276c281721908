//! Workflow executor: document loading, validation and the run state machine.
//!
//! - `document` -- YAML parsing and filesystem load/save
//! - `validator` -- static checks, reporting every violation in one pass
//! - `expression` -- restricted boolean/comparison grammar
//! - `interpolation` -- `{{id.key}}` resolution against the execution context
//! - `context` -- execution context, built as a fold over run events
//! - `event_log` -- sequencing appends and replaying a log into a resume point
//! - `boundary` -- extension and output validator contracts
//! - `entitlement` -- provider capability checks before dispatch
//! - `failure` -- failure policy decisions and self-heal requests
//! - `engine` -- the instruction-pointer interpreter

pub mod boundary;
pub mod context;
pub mod document;
pub mod engine;
pub mod entitlement;
pub mod event_log;
pub mod expression;
pub mod failure;
pub mod interpolation;
pub mod validator;
