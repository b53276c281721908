//! Workflow document types for PAWS.
//!
//! A `WorkflowDocument` is the declarative plan handed to the executor by the
//! planning side. It is read-only once parsed. Steps are a closed set of
//! variants (`StepNode`) so the engine can dispatch with an exhaustive match.
//!
//! In YAML every step entry carries an `id`; the variant is picked by which
//! of `loop_begin`, `loop_end` or `switch` is present, and an entry with none
//! of them is an action step:
//!
//! ```yaml
//! steps:
//!   - id: poll
//!     loop_begin: { max_iterations: 5 }
//!   - id: sample
//!     description: Check the file
//!     extension: Bash
//!     inputs: { command: "test -f out.txt && echo exists || echo missing" }
//!   - id: poll_end
//!     loop_end: { loop_id: poll, exit_when: "{{sample.stdout}} == exists" }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Workflow Document
// ---------------------------------------------------------------------------

/// A parsed workflow document.
///
/// All three top-level sections are mandatory; unknown sections are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    /// Identity and entitlement context of the run.
    pub provider: Provider,
    /// The original request the plan was generated for.
    pub user_inputs: UserInputs,
    /// Ordered step sequence. Declaration order is the only ordering.
    pub steps: Vec<StepNode>,
}

impl WorkflowDocument {
    /// Index of the step with the given id, if any.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id() == id)
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepNode> {
        self.steps.iter().find(|s| s.id() == id)
    }

    /// Look up an action step by id.
    pub fn action(&self, id: &str) -> Option<&ActionStep> {
        match self.step(id) {
            Some(StepNode::Action(action)) => Some(action),
            _ => None,
        }
    }
}

/// The identity under which a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provider {
    pub name: String,
    /// Free-form provider context, readable via `{{provider.<key>}}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Capability grants. An empty list is permissive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entitlements: Vec<Entitlement>,
}

/// A single capability grant, e.g. `{scope: "execute:/tmp/*", capability: "Bash"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entitlement {
    pub scope: String,
    pub capability: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserInputs {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Step Nodes
// ---------------------------------------------------------------------------

/// One entry of the step sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum StepNode {
    Action(ActionStep),
    LoopBegin(LoopBegin),
    LoopEnd(LoopEnd),
    Switch(SwitchStep),
}

impl StepNode {
    pub fn id(&self) -> &str {
        match self {
            StepNode::Action(s) => &s.id,
            StepNode::LoopBegin(s) => &s.id,
            StepNode::LoopEnd(s) => &s.id,
            StepNode::Switch(s) => &s.id,
        }
    }

    /// Short label used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            StepNode::Action(_) => "action",
            StepNode::LoopBegin(_) => "loop_begin",
            StepNode::LoopEnd(_) => "loop_end",
            StepNode::Switch(_) => "switch",
        }
    }
}

/// A step that dispatches one extension call.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionStep {
    pub id: String,
    pub description: String,
    /// Extension name, resolved against the caller's catalog.
    pub extension: String,
    pub tool: Option<String>,
    /// Raw inputs. String leaves may contain `{{id.key}}` references.
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Declared outputs, checked for presence after dispatch.
    pub outputs: BTreeMap<String, OutputField>,
    pub condition: Option<Condition>,
    pub on_failure: FailurePolicy,
    /// Dispatch timeout in seconds. `None` uses the engine default.
    pub timeout_secs: Option<u64>,
}

/// Declared output key.
///
/// Either a plain description or `{description, critical}`. Critical outputs
/// must be non-empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputField {
    Description(String),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default)]
        critical: bool,
    },
}

impl OutputField {
    pub fn is_critical(&self) -> bool {
        matches!(self, OutputField::Detailed { critical: true, .. })
    }
}

/// Step guard: `condition: { if: "<expr>" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    #[serde(rename = "if")]
    pub expr: String,
}

/// What to do when an action step fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailurePolicy {
    pub strategy: FailureStrategy,
    /// Retries after the first attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            strategy: FailureStrategy::Abort,
            max_retries: default_max_retries(),
            fallback_step: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    Abort,
    Retry,
    Skip,
    Fallback,
    SelfHeal,
}

/// Opens a counted loop region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBegin {
    pub id: String,
    /// Safety cap on body passes; 0 disables the cap.
    pub max_iterations: u32,
}

/// Closes the loop region opened by `loop_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopEnd {
    pub id: String,
    pub loop_id: String,
    pub exit_when: String,
}

/// Multi-way routing on a resolved value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchStep {
    pub id: String,
    pub value: String,
    pub cases: Vec<SwitchCase>,
    pub default: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchCase {
    /// Literal compared against the resolved switch value.
    #[serde(rename = "match", deserialize_with = "scalar_string")]
    pub literal: String,
    pub steps: Vec<String>,
}

fn default_max_iterations() -> u32 {
    100
}

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// Flat on-disk form of a step. Converted to and from `StepNode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, OutputField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_failure: Option<FailurePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loop_begin: Option<LoopBeginBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loop_end: Option<LoopEndBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    switch: Option<SwitchBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoopBeginBody {
    #[serde(default = "default_max_iterations")]
    max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoopEndBody {
    loop_id: String,
    exit_when: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SwitchBody {
    value: String,
    #[serde(default)]
    cases: Vec<SwitchCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<Vec<String>>,
}

/// Errors raised while mapping a raw step entry onto a `StepNode` variant.
#[derive(Debug, thiserror::Error)]
pub enum StepShapeError {
    #[error("step '{id}' declares more than one of loop_begin, loop_end, switch")]
    AmbiguousKind { id: String },

    #[error("step '{id}' is a {kind} marker and cannot carry action fields")]
    ActionFieldsOnMarker { id: String, kind: &'static str },

    #[error("step '{id}' has no extension")]
    MissingExtension { id: String },
}

impl RawStep {
    fn has_action_fields(&self) -> bool {
        self.extension.is_some()
            || self.tool.is_some()
            || !self.inputs.is_empty()
            || !self.outputs.is_empty()
            || self.condition.is_some()
            || self.on_failure.is_some()
            || self.timeout.is_some()
    }
}

impl TryFrom<RawStep> for StepNode {
    type Error = StepShapeError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let markers = [
            raw.loop_begin.is_some(),
            raw.loop_end.is_some(),
            raw.switch.is_some(),
        ];
        if markers.iter().filter(|m| **m).count() > 1 {
            return Err(StepShapeError::AmbiguousKind { id: raw.id });
        }

        let kind = if raw.loop_begin.is_some() {
            Some("loop_begin")
        } else if raw.loop_end.is_some() {
            Some("loop_end")
        } else if raw.switch.is_some() {
            Some("switch")
        } else {
            None
        };
        if let Some(kind) = kind {
            if raw.has_action_fields() {
                return Err(StepShapeError::ActionFieldsOnMarker { id: raw.id, kind });
            }
        }

        if let Some(body) = raw.loop_begin {
            return Ok(StepNode::LoopBegin(LoopBegin {
                id: raw.id,
                max_iterations: body.max_iterations,
            }));
        }
        if let Some(body) = raw.loop_end {
            return Ok(StepNode::LoopEnd(LoopEnd {
                id: raw.id,
                loop_id: body.loop_id,
                exit_when: body.exit_when,
            }));
        }
        if let Some(body) = raw.switch {
            return Ok(StepNode::Switch(SwitchStep {
                id: raw.id,
                value: body.value,
                cases: body.cases,
                default: body.default,
            }));
        }

        let Some(extension) = raw.extension else {
            return Err(StepShapeError::MissingExtension { id: raw.id });
        };
        Ok(StepNode::Action(ActionStep {
            id: raw.id,
            description: raw.description.unwrap_or_default(),
            extension,
            tool: raw.tool,
            inputs: raw.inputs,
            outputs: raw.outputs,
            condition: raw.condition,
            on_failure: raw.on_failure.unwrap_or_default(),
            timeout_secs: raw.timeout,
        }))
    }
}

impl From<StepNode> for RawStep {
    fn from(node: StepNode) -> Self {
        match node {
            StepNode::Action(s) => RawStep {
                id: s.id,
                description: (!s.description.is_empty()).then_some(s.description),
                extension: Some(s.extension),
                tool: s.tool,
                inputs: s.inputs,
                outputs: s.outputs,
                condition: s.condition,
                on_failure: (s.on_failure != FailurePolicy::default()).then_some(s.on_failure),
                timeout: s.timeout_secs,
                ..Default::default()
            },
            StepNode::LoopBegin(s) => RawStep {
                id: s.id,
                loop_begin: Some(LoopBeginBody {
                    max_iterations: s.max_iterations,
                }),
                ..Default::default()
            },
            StepNode::LoopEnd(s) => RawStep {
                id: s.id,
                loop_end: Some(LoopEndBody {
                    loop_id: s.loop_id,
                    exit_when: s.exit_when,
                }),
                ..Default::default()
            },
            StepNode::Switch(s) => RawStep {
                id: s.id,
                switch: Some(SwitchBody {
                    value: s.value,
                    cases: s.cases,
                    default: s.default,
                }),
                ..Default::default()
            },
        }
    }
}

/// Accept a YAML scalar (string, number or bool) as a string.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar match literal, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Run Status
// ---------------------------------------------------------------------------

/// State of a run as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Waiting for a revised document from the planner.
    Paused,
    Succeeded,
    Aborted,
    /// Stopped at a step boundary by an external request. Resumable.
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Aborted => "aborted",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
