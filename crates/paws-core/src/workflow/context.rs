//! Execution context for a single run.
//!
//! `ExecutionContext` is the mutable state the engine consults while walking
//! the step sequence: recorded step outputs, loop counters and the switch
//! routing set. It is only ever changed by [`ExecutionContext::apply`], the
//! fold over run events, so a context rebuilt by replaying a log is identical
//! to the one the engine held when it wrote that log.

use std::collections::{BTreeMap, BTreeSet};

use paws_types::event::{Event, EventType};
use paws_types::workflow::WorkflowDocument;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::interpolation::{COUNTER_KEY, PROVIDER_ID, USER_INPUTS_ID};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single recorded output field (1 MB).
pub const MAX_OUTPUT_FIELD_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Run state derived from the document and the run's events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub prompt: String,
    pub provider_name: String,
    pub provider_context: BTreeMap<String, Value>,
    /// Output fields keyed by step id.
    pub step_outputs: BTreeMap<String, BTreeMap<String, String>>,
    /// Current counter per loop id.
    pub loop_counters: BTreeMap<String, u64>,
    /// Step ids selected by each switch, keyed by switch id.
    pub routes: BTreeMap<String, BTreeSet<String>>,
}

impl ExecutionContext {
    /// Seed a context with the document's user inputs and provider.
    pub fn new(doc: &WorkflowDocument) -> Self {
        Self {
            prompt: doc.user_inputs.prompt.clone(),
            provider_name: doc.provider.name.clone(),
            provider_context: doc.provider.context.clone(),
            ..Default::default()
        }
    }

    /// Fold one event into the context.
    pub fn apply(&mut self, event: &Event) {
        let Some(step_id) = event.step_id.as_deref() else {
            return;
        };

        match event.event_type {
            EventType::Completed => {
                if let Some(outputs) = &event.payload.outputs {
                    self.record_outputs(step_id, outputs.clone());
                }
                if let Some(selected) = &event.payload.selected {
                    self.routes
                        .insert(step_id.to_string(), selected.iter().cloned().collect());
                }
            }
            // A skipped step has no outputs for this pass, even if an earlier
            // loop pass recorded some.
            EventType::Skipped => {
                self.step_outputs.remove(step_id);
            }
            EventType::Failed
                if event
                    .payload
                    .disposition
                    .is_some_and(|d| d.is_terminal_for_step()) =>
            {
                self.step_outputs.remove(step_id);
            }
            EventType::LoopIteration | EventType::LoopForcedExit => {
                if let Some(counter) = event.payload.counter {
                    self.set_counter(step_id, counter);
                }
            }
            _ => {}
        }
    }

    /// Store the output fields of a completed step, replacing earlier ones.
    ///
    /// Fields larger than `MAX_OUTPUT_FIELD_SIZE` are truncated.
    pub fn record_outputs(&mut self, step_id: &str, mut outputs: BTreeMap<String, String>) {
        for (key, value) in outputs.iter_mut() {
            if value.len() > MAX_OUTPUT_FIELD_SIZE {
                tracing::warn!(
                    step_id,
                    key = %key,
                    size = value.len(),
                    max = MAX_OUTPUT_FIELD_SIZE,
                    "step output field exceeds size limit, truncating"
                );
                let mut cut = MAX_OUTPUT_FIELD_SIZE;
                while !value.is_char_boundary(cut) {
                    cut -= 1;
                }
                value.truncate(cut);
            }
        }
        self.step_outputs.insert(step_id.to_string(), outputs);
    }

    pub fn set_counter(&mut self, loop_id: &str, counter: u64) {
        self.loop_counters.insert(loop_id.to_string(), counter);
    }

    pub fn counter(&self, loop_id: &str) -> u64 {
        self.loop_counters.get(loop_id).copied().unwrap_or(0)
    }

    pub fn step_output(&self, step_id: &str) -> Option<&BTreeMap<String, String>> {
        self.step_outputs.get(step_id)
    }

    /// Whether any switch currently routes to `step_id`.
    pub fn is_routed(&self, step_id: &str) -> bool {
        self.routes.values().any(|set| set.contains(step_id))
    }

    /// Union of every switch's selection.
    pub fn routing_set(&self) -> BTreeSet<&str> {
        self.routes
            .values()
            .flat_map(|set| set.iter().map(String::as_str))
            .collect()
    }

    /// Resolve `id.key` against pseudo-ids, loop counters and step outputs.
    pub fn lookup(&self, id: &str, key: &str) -> Option<String> {
        match id {
            USER_INPUTS_ID => (key == "prompt").then(|| self.prompt.clone()),
            PROVIDER_ID => {
                if key == "name" {
                    Some(self.provider_name.clone())
                } else {
                    self.provider_context.get(key).map(value_to_string)
                }
            }
            _ => {
                if key == COUNTER_KEY {
                    if let Some(counter) = self.loop_counters.get(id) {
                        return Some(counter.to_string());
                    }
                }
                self.step_outputs.get(id)?.get(key).cloned()
            }
        }
    }

    /// Ids of steps with recorded outputs.
    pub fn completed_steps(&self) -> Vec<String> {
        self.step_outputs.keys().cloned().collect()
    }

    /// Serialize the entire context to JSON for snapshots.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert a JSON value to a display string.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
