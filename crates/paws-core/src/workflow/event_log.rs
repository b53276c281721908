//! Append-only event log and replay.
//!
//! [`EventLog`] assigns sequence numbers and timestamps and hands each event
//! to its [`EventStore`]. [`replay`] folds a stored log back into an
//! [`ExecutionContext`] and works out where a resumed run should continue.

use std::collections::BTreeMap;

use chrono::Utc;
use paws_types::error::EventLogError;
use paws_types::event::{Disposition, Event, EventPayload, EventType};
use paws_types::workflow::{RunStatus, WorkflowDocument};
use uuid::Uuid;

use super::context::ExecutionContext;
use crate::repository::event_store::EventStore;

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Sequencing writer over an [`EventStore`].
pub struct EventLog<S> {
    store: S,
    next_seq: u64,
}

impl<S: EventStore> EventLog<S> {
    /// A log for a new run. The first event gets `seq` 1.
    pub fn new(store: S) -> Self {
        Self { store, next_seq: 1 }
    }

    /// A log continuing an existing run at `next_seq`.
    pub fn continuing(store: S, next_seq: u64) -> Self {
        Self {
            store,
            next_seq: next_seq.max(1),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Build, persist and return the next event.
    pub async fn append(
        &mut self,
        step_id: Option<&str>,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<Event, EventLogError> {
        let event = Event {
            seq: self.next_seq,
            timestamp: Utc::now(),
            step_id: step_id.map(str::to_string),
            event_type,
            payload,
        };
        self.store.append(&event).await?;
        self.next_seq += 1;

        tracing::debug!(
            seq = event.seq,
            step_id = event.step_id.as_deref().unwrap_or("-"),
            event_type = %event.event_type,
            "event appended"
        );
        Ok(event)
    }

    pub async fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        self.store.read_all().await
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Where a resumed run continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing terminal recorded yet; run from the first step.
    Start,
    /// Continue with the node after this step (or loop begin).
    After(String),
    /// Continue after the LoopEnd matching this loop id.
    AfterLoop(String),
    /// Run this fallback target next, ignoring its condition.
    Fallback(String),
    /// The run already succeeded.
    Finished,
}

/// Everything recovered from a stored log.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayState {
    pub context: ExecutionContext,
    pub resume_point: ResumePoint,
    pub status: RunStatus,
    pub next_seq: u64,
    pub run_id: Option<Uuid>,
    /// Failed attempts per step since that step's last terminal outcome.
    pub failed_attempts: BTreeMap<String, u32>,
    /// Error of the most recent non-terminal failure, if the run stopped on one.
    pub last_error: Option<String>,
}

impl ReplayState {
    /// Attempt number the next dispatch of `step_id` should carry.
    pub fn next_attempt(&self, step_id: &str) -> u32 {
        self.failed_attempts.get(step_id).copied().unwrap_or(0) + 1
    }
}

/// Fold `events` into a [`ReplayState`].
///
/// Deterministic: the same document and events always produce the same
/// state, and the context equals the one the engine held when it wrote the
/// last event.
pub fn replay(doc: &WorkflowDocument, events: &[Event]) -> ReplayState {
    let mut context = ExecutionContext::new(doc);
    let mut resume_point = ResumePoint::Start;
    let mut status = RunStatus::Running;
    let mut run_id = None;
    let mut failed_attempts: BTreeMap<String, u32> = BTreeMap::new();
    let mut last_error = None;

    for event in events {
        context.apply(event);
        let step_id = event.step_id.clone();

        match event.event_type {
            EventType::RunStarted => {
                run_id = event.payload.run_id.or(run_id);
                status = RunStatus::Running;
            }
            EventType::RunResumed => status = RunStatus::Running,
            EventType::RunPaused => status = RunStatus::Paused,
            EventType::RunCancelled => status = RunStatus::Cancelled,
            EventType::RunAborted => status = RunStatus::Aborted,
            EventType::RunSucceeded => {
                status = RunStatus::Succeeded;
                resume_point = ResumePoint::Finished;
            }
            EventType::Completed | EventType::Skipped => {
                if let Some(id) = step_id {
                    failed_attempts.remove(&id);
                    resume_point = ResumePoint::After(id);
                    last_error = None;
                }
            }
            EventType::Failed => {
                let Some(id) = step_id else { continue };
                match event.payload.disposition {
                    Some(Disposition::Skipped) => {
                        failed_attempts.remove(&id);
                        resume_point = ResumePoint::After(id);
                        last_error = None;
                    }
                    Some(Disposition::Fallback) => {
                        failed_attempts.remove(&id);
                        if let Some(target) = event.payload.fallback_step.clone() {
                            resume_point = ResumePoint::Fallback(target);
                        }
                        last_error = None;
                    }
                    _ => {
                        *failed_attempts.entry(id).or_default() += 1;
                        last_error = event.payload.error.clone();
                    }
                }
            }
            EventType::LoopIteration => {
                if let Some(id) = step_id {
                    resume_point = ResumePoint::After(id);
                }
            }
            EventType::LoopForcedExit => {
                if let Some(id) = step_id {
                    resume_point = ResumePoint::AfterLoop(id);
                }
            }
            EventType::Started => {}
        }
    }

    let next_seq = events.last().map_or(1, |e| e.seq + 1);

    ReplayState {
        context,
        resume_point,
        status,
        next_seq,
        run_id,
        failed_attempts,
        last_error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
