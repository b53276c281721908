//! Step failures and the policy that decides what happens next.
//!
//! Everything that can go wrong inside one action step is folded into a
//! [`StepFailure`]. [`FailureHandler`] maps a failure plus the step's
//! `on_failure` policy to a [`FailureAction`]; the engine carries it out.

use std::collections::BTreeMap;

use paws_types::event::Disposition;
use paws_types::workflow::{ActionStep, FailurePolicy, FailureStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::boundary::{DispatchError, ValidatorError};
use super::context::ExecutionContext;
use super::expression::ExpressionError;
use super::interpolation::InterpolationError;

/// Characters of stdout kept per step in a self-heal context summary.
const SUMMARY_OUTPUT_CHARS: usize = 100;

const SELF_HEAL_INSTRUCTION: &str =
    "Please analyze the failure and generate a corrected workflow plan.";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A response that broke the step's declared output schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputContractError {
    #[error("step '{step_id}' did not produce declared output '{key}'")]
    Missing { step_id: String, key: String },

    #[error("step '{step_id}' produced an empty critical output '{key}'")]
    EmptyCritical { step_id: String, key: String },
}

/// Any failure of a single action step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Interpolation(#[from] InterpolationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    OutputContract(#[from] OutputContractError),

    #[error("output rejected by validator: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Validator(#[from] ValidatorError),
}

/// Check the structural output contract of a step's response.
///
/// Every declared key must be present; critical keys must also be non-empty.
/// Undeclared extra keys are allowed.
pub fn check_outputs(
    step: &ActionStep,
    outputs: &BTreeMap<String, String>,
) -> Result<(), OutputContractError> {
    for (key, field) in &step.outputs {
        match outputs.get(key) {
            None => {
                return Err(OutputContractError::Missing {
                    step_id: step.id.clone(),
                    key: key.clone(),
                });
            }
            Some(value) if field.is_critical() && value.trim().is_empty() => {
                return Err(OutputContractError::EmptyCritical {
                    step_id: step.id.clone(),
                    key: key.clone(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FailureAction
// ---------------------------------------------------------------------------

/// What the engine does after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Dispatch again with this attempt number.
    Retry { next_attempt: u32 },
    Abort,
    Skip,
    Fallback { target: String },
    SelfHeal,
}

impl FailureAction {
    /// Disposition recorded on the `failed` event.
    pub fn disposition(&self) -> Disposition {
        match self {
            FailureAction::Retry { .. } => Disposition::Retrying,
            FailureAction::Abort => Disposition::Aborted,
            FailureAction::Skip => Disposition::Skipped,
            FailureAction::Fallback { .. } => Disposition::Fallback,
            FailureAction::SelfHeal => Disposition::SelfHeal,
        }
    }
}

// ---------------------------------------------------------------------------
// FailureHandler
// ---------------------------------------------------------------------------

/// Stateless failure policy evaluation.
pub struct FailureHandler;

impl FailureHandler {
    /// Last attempt number allowed when dispatching starts at `first_attempt`.
    ///
    /// Only the retry strategy grants extra attempts.
    pub fn last_attempt(policy: &FailurePolicy, first_attempt: u32) -> u32 {
        match policy.strategy {
            FailureStrategy::Retry => first_attempt.saturating_add(policy.max_retries),
            _ => first_attempt,
        }
    }

    /// Decide the action after `attempt` failed.
    pub fn decide(policy: &FailurePolicy, attempt: u32, last_attempt: u32) -> FailureAction {
        match policy.strategy {
            FailureStrategy::Abort => FailureAction::Abort,
            FailureStrategy::Retry if attempt < last_attempt => FailureAction::Retry {
                next_attempt: attempt + 1,
            },
            FailureStrategy::Retry => FailureAction::Abort,
            FailureStrategy::Skip => FailureAction::Skip,
            FailureStrategy::Fallback => match &policy.fallback_step {
                Some(target) => FailureAction::Fallback {
                    target: target.clone(),
                },
                None => FailureAction::Abort,
            },
            FailureStrategy::SelfHeal => FailureAction::SelfHeal,
        }
    }

    /// Build the request handed to the planner when a step asks for self-heal.
    pub fn build_self_heal_request(
        run_id: Uuid,
        step: &ActionStep,
        error: &str,
        ctx: &ExecutionContext,
    ) -> SelfHealRequest {
        let last_outputs = ctx
            .step_outputs
            .iter()
            .filter_map(|(id, outputs)| {
                let stdout = outputs.get("stdout").filter(|s| !s.is_empty())?;
                Some((id.clone(), summarize(stdout)))
            })
            .collect();

        SelfHealRequest {
            kind: "self_heal_request".to_string(),
            run_id,
            failed_step: FailedStep {
                id: step.id.clone(),
                description: step.description.clone(),
            },
            error: error.to_string(),
            context_summary: ContextSummary {
                completed_steps: ctx.completed_steps(),
                last_outputs,
            },
            snapshot: ctx.to_json(),
            request: SELF_HEAL_INSTRUCTION.to_string(),
        }
    }
}

fn summarize(text: &str) -> String {
    if text.chars().count() > SUMMARY_OUTPUT_CHARS {
        let head: String = text.chars().take(SUMMARY_OUTPUT_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

// ---------------------------------------------------------------------------
// Self-heal request
// ---------------------------------------------------------------------------

/// Payload describing a failure that needs a revised document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfHealRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub run_id: Uuid,
    pub failed_step: FailedStep,
    pub error: String,
    pub context_summary: ContextSummary,
    pub snapshot: serde_json::Value,
    pub request: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub completed_steps: Vec<String>,
    /// First characters of each completed step's stdout.
    pub last_outputs: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
