//! Static validation of workflow documents.
//!
//! Runs once before execution and reports every violation, not just the
//! first, so a planner can repair a document in one pass. Checks:
//! - at least one step, unique ids, no reserved ids
//! - every extension resolves in the caller's catalog
//! - every interpolation reference points strictly backwards
//! - conditions, loop exits and switch values parse
//! - loop regions nest properly (stack walk, last-opened-first-closed)
//! - switch targets and fallback steps name action steps

use std::collections::HashSet;

use paws_types::workflow::{ActionStep, FailureStrategy, StepNode, WorkflowDocument};
use thiserror::Error;

use super::boundary::ExtensionCatalog;
use super::expression::Expression;
use super::interpolation::{self, Reference, COUNTER_KEY, PROVIDER_ID, USER_INPUTS_ID};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A single structural violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("workflow must have at least one step")]
    EmptySteps,

    #[error("duplicate step id '{id}'")]
    DuplicateId { id: String },

    #[error("step id '{id}' is reserved")]
    ReservedId { id: String },

    #[error("step '{step_id}': extension '{extension}' not found in catalog")]
    UnknownExtension { step_id: String, extension: String },

    #[error("step '{step_id}': timeout must be > 0")]
    ZeroTimeout { step_id: String },

    #[error("step '{step_id}': reference '{reference}' names an undeclared step")]
    UndeclaredReference { step_id: String, reference: String },

    #[error("step '{step_id}': reference '{reference}' does not point to an earlier step")]
    ForwardReference { step_id: String, reference: String },

    #[error("step '{step_id}': reference '{reference}' is invalid: {reason}")]
    InvalidReference {
        step_id: String,
        reference: String,
        reason: String,
    },

    #[error("step '{step_id}': {field} is malformed: {reason}")]
    MalformedExpression {
        step_id: String,
        field: &'static str,
        reason: String,
    },

    #[error("step '{step_id}': loop_end references '{loop_id}' but no loop_begin is open")]
    LoopNotOpen { step_id: String, loop_id: String },

    #[error("step '{step_id}': loop '{loop_id}' was already closed")]
    LoopAlreadyClosed { step_id: String, loop_id: String },

    #[error("step '{step_id}': expected loop_end for '{expected}', got '{found}' (invalid nesting)")]
    LoopInterleaved {
        step_id: String,
        expected: String,
        found: String,
    },

    #[error("loop '{loop_id}' is never closed with loop_end")]
    LoopNeverClosed { loop_id: String },

    #[error("step '{step_id}': switch target '{target}' is not an action step")]
    UnknownRouteTarget { step_id: String, target: String },

    #[error("step '{step_id}': fallback strategy requires fallback_step")]
    MissingFallbackStep { step_id: String },

    #[error("step '{step_id}': fallback_step '{target}' is invalid: {reason}")]
    InvalidFallback {
        step_id: String,
        target: String,
        reason: String,
    },
}

/// Every violation found in a document, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub violations: Vec<DocumentError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            return f.write_str("document is valid");
        }
        writeln!(f, "{} violation(s):", self.violations.len())?;
        for v in &self.violations {
            writeln!(f, "  - {v}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a document against the caller's extension catalog.
pub fn validate(doc: &WorkflowDocument, catalog: &dyn ExtensionCatalog) -> ValidationReport {
    let mut v = Validator {
        doc,
        violations: Vec::new(),
    };

    if doc.steps.is_empty() {
        v.violations.push(DocumentError::EmptySteps);
        return v.finish();
    }

    v.check_ids();
    let regions = v.check_loops();

    for (idx, step) in doc.steps.iter().enumerate() {
        match step {
            StepNode::Action(action) => {
                v.check_action(idx, action, catalog);
                v.check_fallback(idx, action, &regions);
            }
            StepNode::LoopBegin(_) => {}
            StepNode::LoopEnd(end) => {
                v.check_expression(idx, &end.id, "exit_when", &end.exit_when);
            }
            StepNode::Switch(switch) => {
                v.check_template(idx, &switch.id, &switch.value);
                let targets = switch
                    .cases
                    .iter()
                    .flat_map(|c| c.steps.iter())
                    .chain(switch.default.iter().flatten());
                for target in targets {
                    if doc.action(target).is_none() {
                        v.violations.push(DocumentError::UnknownRouteTarget {
                            step_id: switch.id.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
    }

    v.finish()
}

struct Validator<'a> {
    doc: &'a WorkflowDocument,
    violations: Vec<DocumentError>,
}

impl<'a> Validator<'a> {
    fn finish(self) -> ValidationReport {
        ValidationReport {
            violations: self.violations,
        }
    }

    fn check_ids(&mut self) {
        let mut seen = HashSet::new();
        for step in &self.doc.steps {
            let id = step.id();
            if id == USER_INPUTS_ID || id == PROVIDER_ID {
                self.violations.push(DocumentError::ReservedId { id: id.to_string() });
            }
            if !seen.insert(id) {
                self.violations.push(DocumentError::DuplicateId { id: id.to_string() });
            }
        }
    }

    /// Stack walk over loop markers.
    ///
    /// Returns the innermost open loop for every index, used to keep
    /// fallback jumps inside their loop region.
    fn check_loops(&mut self) -> Vec<Option<&'a str>> {
        let mut stack: Vec<&'a str> = Vec::new();
        let mut closed: HashSet<&'a str> = HashSet::new();
        let doc = self.doc;
        let mut regions = Vec::with_capacity(doc.steps.len());

        for step in &doc.steps {
            regions.push(stack.last().copied());
            match step {
                StepNode::LoopBegin(begin) => stack.push(&begin.id),
                StepNode::LoopEnd(end) => {
                    let loop_id = end.loop_id.as_str();
                    if stack.last() == Some(&loop_id) {
                        stack.pop();
                        closed.insert(loop_id);
                    } else if let Some(pos) = stack.iter().rposition(|open| *open == loop_id) {
                        self.violations.push(DocumentError::LoopInterleaved {
                            step_id: end.id.clone(),
                            expected: stack[stack.len() - 1].to_string(),
                            found: loop_id.to_string(),
                        });
                        stack.remove(pos);
                        closed.insert(loop_id);
                    } else if closed.contains(loop_id) {
                        self.violations.push(DocumentError::LoopAlreadyClosed {
                            step_id: end.id.clone(),
                            loop_id: loop_id.to_string(),
                        });
                    } else {
                        self.violations.push(DocumentError::LoopNotOpen {
                            step_id: end.id.clone(),
                            loop_id: loop_id.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }

        for loop_id in stack {
            self.violations.push(DocumentError::LoopNeverClosed {
                loop_id: loop_id.to_string(),
            });
        }
        regions
    }

    fn check_action(&mut self, idx: usize, action: &ActionStep, catalog: &dyn ExtensionCatalog) {
        if !catalog.contains(&action.extension) {
            self.violations.push(DocumentError::UnknownExtension {
                step_id: action.id.clone(),
                extension: action.extension.clone(),
            });
        }
        if action.timeout_secs == Some(0) {
            self.violations.push(DocumentError::ZeroTimeout {
                step_id: action.id.clone(),
            });
        }
        if let Some(condition) = &action.condition {
            self.check_expression(idx, &action.id, "condition", &condition.expr);
        }
        for value in action.inputs.values() {
            for template in interpolation::input_templates(value) {
                self.check_template(idx, &action.id, template);
            }
        }
    }

    fn check_fallback(&mut self, idx: usize, action: &ActionStep, regions: &[Option<&str>]) {
        let policy = &action.on_failure;
        if policy.strategy != FailureStrategy::Fallback {
            return;
        }
        let Some(target) = &policy.fallback_step else {
            self.violations.push(DocumentError::MissingFallbackStep {
                step_id: action.id.clone(),
            });
            return;
        };

        let invalid = |reason: &str| DocumentError::InvalidFallback {
            step_id: action.id.clone(),
            target: target.clone(),
            reason: reason.to_string(),
        };

        let Some(target_idx) = self.doc.index_of(target) else {
            self.violations.push(invalid("no such step"));
            return;
        };
        if self.doc.action(target).is_none() {
            self.violations.push(invalid("not an action step"));
        } else if target_idx <= idx {
            self.violations.push(invalid("must be declared after the failing step"));
        } else if regions[target_idx] != regions[idx] {
            self.violations.push(invalid("must be in the same loop region"));
        }
    }

    fn check_expression(&mut self, idx: usize, step_id: &str, field: &'static str, src: &str) {
        let refs = Expression::parse(src).and_then(|expr| expr.references());
        match refs {
            Ok(refs) => self.check_references(idx, step_id, refs),
            Err(e) => self.violations.push(DocumentError::MalformedExpression {
                step_id: step_id.to_string(),
                field,
                reason: e.to_string(),
            }),
        }
    }

    fn check_template(&mut self, idx: usize, step_id: &str, template: &str) {
        match interpolation::references(template) {
            Ok(refs) => self.check_references(idx, step_id, refs),
            Err(e) => self.violations.push(DocumentError::MalformedExpression {
                step_id: step_id.to_string(),
                field: "template",
                reason: e.to_string(),
            }),
        }
    }

    fn check_references(&mut self, idx: usize, step_id: &str, refs: Vec<Reference>) {
        for r in refs {
            let Some(problem) = self.reference_problem(idx, &r) else {
                continue;
            };
            let (step_id, reference) = (step_id.to_string(), r.to_string());
            self.violations.push(match problem {
                RefProblem::Undeclared => DocumentError::UndeclaredReference { step_id, reference },
                RefProblem::Forward => DocumentError::ForwardReference { step_id, reference },
                RefProblem::Invalid(reason) => DocumentError::InvalidReference {
                    step_id,
                    reference,
                    reason: reason.to_string(),
                },
            });
        }
    }

    fn reference_problem(&self, idx: usize, r: &Reference) -> Option<RefProblem> {
        match r.id.as_str() {
            USER_INPUTS_ID => (r.key != "prompt")
                .then_some(RefProblem::Invalid("only user_inputs.prompt is available")),
            PROVIDER_ID => (r.key != "name" && !self.doc.provider.context.contains_key(&r.key))
                .then_some(RefProblem::Invalid("unknown provider key")),
            id => {
                let Some(target_idx) = self.doc.index_of(id) else {
                    return Some(RefProblem::Undeclared);
                };
                if target_idx >= idx {
                    return Some(RefProblem::Forward);
                }
                match &self.doc.steps[target_idx] {
                    StepNode::LoopBegin(_) if r.key != COUNTER_KEY => {
                        Some(RefProblem::Invalid("loops only expose 'counter'"))
                    }
                    StepNode::LoopEnd(_) => Some(RefProblem::Invalid("loop_end records no outputs")),
                    StepNode::Switch(_) if r.key != "value" => {
                        Some(RefProblem::Invalid("switches only expose 'value'"))
                    }
                    _ => None,
                }
            }
        }
    }
}

enum RefProblem {
    Undeclared,
    Forward,
    Invalid(&'static str),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
