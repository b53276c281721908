//! Event records for PAWS runs.
//!
//! The ordered sequence of `Event`s written by the engine is the complete
//! durable state of a run. Events are never mutated or deleted once written.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Step id, or loop id for loop markers. Absent for run-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: EventPayload,
}

/// Kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunResumed,
    Started,
    Completed,
    Failed,
    Skipped,
    LoopIteration,
    LoopForcedExit,
    RunPaused,
    RunCancelled,
    RunAborted,
    RunSucceeded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run_started",
            EventType::RunResumed => "run_resumed",
            EventType::Started => "started",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Skipped => "skipped",
            EventType::LoopIteration => "loop_iteration",
            EventType::LoopForcedExit => "loop_forced_exit",
            EventType::RunPaused => "run_paused",
            EventType::RunCancelled => "run_cancelled",
            EventType::RunAborted => "run_aborted",
            EventType::RunSucceeded => "run_succeeded",
        }
    }

    /// Whether this event describes the run rather than a single step.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            EventType::RunStarted
                | EventType::RunResumed
                | EventType::RunPaused
                | EventType::RunCancelled
                | EventType::RunAborted
                | EventType::RunSucceeded
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {s}"))
    }
}

/// How the engine handled a `failed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Another attempt follows.
    Retrying,
    /// The run stops in `Aborted`.
    Aborted,
    /// The step is treated as skipped and the run advances.
    Skipped,
    /// The fallback step runs next.
    Fallback,
    /// The run pauses for a revised document.
    SelfHeal,
}

impl Disposition {
    /// Whether the step is finished after a failure with this disposition.
    ///
    /// Non-terminal failures are re-dispatched when the run resumes.
    pub fn is_terminal_for_step(&self) -> bool {
        matches!(self, Disposition::Skipped | Disposition::Fallback)
    }
}

/// Event payload. Every field is optional; which ones are set depends on the
/// event type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Resolved inputs sent to the extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, String>>,
    /// Outputs recorded for the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based dispatch attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<Disposition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step: Option<String>,
    /// Loop counter for loop markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    /// Step ids selected by a switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<Vec<String>>,
    /// Full context snapshot, attached when pausing for self-heal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventPayload {
    pub fn is_empty(&self) -> bool {
        *self == EventPayload::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
