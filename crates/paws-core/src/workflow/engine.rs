//! Workflow engine: an instruction-pointer interpreter over the step sequence.
//!
//! The engine walks the flat `steps` list one node per iteration. Loops are
//! realized as jumps between a `loop_begin` and its `loop_end`; switches
//! record a routing set that overrides the selected steps' conditions.
//! Every state change is appended to the run's event log first and then
//! folded into the [`ExecutionContext`] through the same function replay
//! uses, so a run can be resumed from its log alone.
//!
//! # Execution flow
//!
//! 1. Validate the document against the invoker's extension catalog.
//! 2. Append `run_started` (or replay the log and append `run_resumed`).
//! 3. For each node: check cancellation, then interpret the node.
//! 4. Action steps: condition -> inputs -> entitlements -> dispatch ->
//!    output checks -> validator, with the step's failure policy on error.
//! 5. End with `run_succeeded`, `run_aborted`, `run_paused` or
//!    `run_cancelled`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use paws_types::error::EventLogError;
use paws_types::event::{EventPayload, EventType};
use paws_types::workflow::{
    ActionStep, LoopBegin, LoopEnd, RunStatus, StepNode, SwitchStep, WorkflowDocument,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::boundary::{
    BoxOutputValidator, DispatchError, ExtensionInvoker, ExtensionRequest, InvokerCatalog,
    OutputValidator, ResponseStatus, ValidationRequest,
};
use super::context::ExecutionContext;
use super::entitlement::EntitlementEnforcer;
use super::event_log::{replay, EventLog, ResumePoint};
use super::expression;
use super::failure::{check_outputs, FailureAction, FailureHandler, SelfHealRequest, StepFailure};
use super::interpolation;
use super::validator::{validate, ValidationReport};
use crate::repository::event_store::EventStore;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a resumed run treats the step it stopped on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumeInstruction {
    /// Dispatch the failed step again.
    #[default]
    RetryFailedStep,
    /// Mark the failed step skipped and continue after it.
    SkipFailedStep,
}

impl ResumeInstruction {
    fn as_str(&self) -> &'static str {
        match self {
            ResumeInstruction::RetryFailedStep => "retry_failed_step",
            ResumeInstruction::SkipFailedStep => "skip_failed_step",
        }
    }
}

/// How a run ended (for now).
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded,
    Aborted {
        step_id: Option<String>,
        error: String,
    },
    Cancelled,
    /// Waiting for a revised document. Resume with [`WorkflowEngine::resume`].
    Paused(Box<SelfHealRequest>),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Aborted { .. } => RunStatus::Aborted,
            RunOutcome::Cancelled => RunStatus::Cancelled,
            RunOutcome::Paused(_) => RunStatus::Paused,
        }
    }
}

/// Result of [`WorkflowEngine::start`] or [`WorkflowEngine::resume`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// Context at the moment the run stopped.
    pub context: ExecutionContext,
}

/// Errors that stop the engine outside of any failure policy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The document failed validation; no step ran.
    #[error("invalid document:\n{0}")]
    InvalidDocument(ValidationReport),

    /// Event persistence failed. Fatal to the run.
    #[error("event log error: {0}")]
    EventLog(#[from] EventLogError),

    /// The log's resume point does not exist in the supplied document.
    #[error("resume point '{step_id}' not found in document")]
    ResumePointMissing { step_id: String },

    /// `start` was called on a store that already holds events.
    #[error("event store already holds a run")]
    RunAlreadyStarted,

    /// `resume` was called on a store with no `run_started` event.
    #[error("no run to resume")]
    NothingToResume,

    #[error("loop '{loop_id}' has no matching loop_begin/loop_end")]
    UnmatchedLoop { loop_id: String },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives one run over an event store.
///
/// Generic over the extension invoker and the event store. The store holds
/// exactly one run.
pub struct WorkflowEngine<X: ExtensionInvoker, S: EventStore> {
    invoker: X,
    store: S,
    validator: Option<BoxOutputValidator>,
    cancel: CancellationToken,
    planner: Option<mpsc::Sender<SelfHealRequest>>,
    default_timeout: Duration,
}

impl<X: ExtensionInvoker, S: EventStore> WorkflowEngine<X, S> {
    pub fn new(invoker: X, store: S) -> Self {
        Self {
            invoker,
            store,
            validator: None,
            cancel: CancellationToken::new(),
            planner: None,
            default_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
        }
    }

    /// Attach an output validator consulted after the structural checks.
    pub fn with_validator(mut self, validator: BoxOutputValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Also deliver self-heal requests on this channel.
    pub fn with_planner_channel(mut self, tx: mpsc::Sender<SelfHealRequest>) -> Self {
        self.planner = Some(tx);
        self
    }

    /// Timeout for steps that do not declare one.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `doc` from the beginning under a fresh run id.
    pub async fn start(&self, doc: &WorkflowDocument) -> Result<RunReport, EngineError> {
        self.start_with_id(doc, Uuid::now_v7()).await
    }

    /// Run `doc` from the beginning under `run_id`.
    pub async fn start_with_id(
        &self,
        doc: &WorkflowDocument,
        run_id: Uuid,
    ) -> Result<RunReport, EngineError> {
        self.check_document(doc)?;
        if !self.store.read_all().await?.is_empty() {
            return Err(EngineError::RunAlreadyStarted);
        }

        let mut run = Run::new(
            doc,
            run_id,
            ExecutionContext::new(doc),
            EventLog::new(&self.store),
        )?;

        tracing::info!(
            run_id = %run_id,
            provider = doc.provider.name.as_str(),
            steps = doc.steps.len(),
            "starting workflow run"
        );

        run.emit(
            None,
            EventType::RunStarted,
            EventPayload {
                run_id: Some(run_id),
                prompt: Some(doc.user_inputs.prompt.clone()),
                resources: Some(doc.user_inputs.resources.clone()),
                provider: Some(doc.provider.name.clone()),
                ..Default::default()
            },
        )
        .await?;

        let outcome = self.execute(&mut run).await?;
        Ok(run.finish(outcome))
    }

    /// Continue the run in the store using a (possibly revised) document.
    pub async fn resume(
        &self,
        doc: &WorkflowDocument,
        instruction: ResumeInstruction,
    ) -> Result<RunReport, EngineError> {
        self.check_document(doc)?;

        let events = self.store.read_all().await?;
        let state = replay(doc, &events);
        let run_id = state.run_id.ok_or(EngineError::NothingToResume)?;

        if state.resume_point == ResumePoint::Finished {
            tracing::info!(run_id = %run_id, "run already succeeded, nothing to resume");
            return Ok(RunReport {
                run_id,
                outcome: RunOutcome::Succeeded,
                context: state.context,
            });
        }

        let mut run = Run::new(
            doc,
            run_id,
            state.context.clone(),
            EventLog::continuing(&self.store, state.next_seq),
        )?;
        run.first_attempts = state.failed_attempts.clone();

        run.ip = match &state.resume_point {
            ResumePoint::Start => 0,
            ResumePoint::After(id) => run.index_of(id)? + 1,
            ResumePoint::AfterLoop(loop_id) => run.loop_end(loop_id)? + 1,
            ResumePoint::Fallback(id) => {
                let idx = run.index_of(id)?;
                run.forced = Some(idx);
                idx
            }
            ResumePoint::Finished => doc.steps.len(),
        };

        tracing::info!(
            run_id = %run_id,
            previous_status = %state.status,
            resume_at = run.ip,
            instruction = instruction.as_str(),
            last_error = state.last_error.as_deref(),
            "resuming workflow run"
        );

        run.emit(
            None,
            EventType::RunResumed,
            EventPayload {
                run_id: Some(run_id),
                reason: Some(instruction.as_str().to_string()),
                ..Default::default()
            },
        )
        .await?;

        if instruction == ResumeInstruction::SkipFailedStep {
            self.skip_failed_step(&mut run, state.last_error.as_deref())
                .await?;
        }

        let outcome = self.execute(&mut run).await?;
        Ok(run.finish(outcome))
    }

    fn check_document(&self, doc: &WorkflowDocument) -> Result<(), EngineError> {
        let report = validate(doc, &InvokerCatalog(&self.invoker));
        if report.is_valid() {
            Ok(())
        } else {
            tracing::warn!(
                violations = report.violations.len(),
                "workflow document rejected"
            );
            Err(EngineError::InvalidDocument(report))
        }
    }

    /// Skip the action step the run stopped on, if it stopped on a failure.
    /// The skip reason carries the error that stopped it.
    async fn skip_failed_step(
        &self,
        run: &mut Run<'_, &S>,
        last_error: Option<&str>,
    ) -> Result<(), EngineError> {
        let doc = run.doc;
        let Some(StepNode::Action(step)) = doc.steps.get(run.ip) else {
            return Ok(());
        };
        if !run.first_attempts.contains_key(&step.id) {
            tracing::debug!(step_id = step.id.as_str(), "no failed step to skip");
            return Ok(());
        }

        run.first_attempts.remove(&step.id);
        run.forced = None;
        run.emit(
            Some(step.id.as_str()),
            EventType::Skipped,
            EventPayload {
                reason: Some(match last_error {
                    Some(error) => format!("skipped on resume after: {error}"),
                    None => "skipped on resume".to_string(),
                }),
                ..Default::default()
            },
        )
        .await?;
        run.ip += 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    async fn execute(&self, run: &mut Run<'_, &S>) -> Result<RunOutcome, EngineError> {
        let doc = run.doc;

        while let Some(node) = doc.steps.get(run.ip) {
            if self.cancel.is_cancelled() {
                tracing::info!(run_id = %run.run_id, step_id = node.id(), "workflow cancelled");
                run.emit(
                    None,
                    EventType::RunCancelled,
                    EventPayload {
                        reason: Some("cancellation requested".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(RunOutcome::Cancelled);
            }

            let flow = match node {
                StepNode::Action(step) => self.run_action(run, step).await?,
                StepNode::LoopBegin(begin) => self.run_loop_begin(run, begin).await?,
                StepNode::LoopEnd(end) => self.run_loop_end(run, end).await?,
                StepNode::Switch(switch) => self.run_switch(run, switch).await?,
            };

            match flow {
                Flow::Next => run.ip += 1,
                Flow::Jump(idx) => run.ip = idx,
                Flow::Stop(outcome) => return Ok(outcome),
            }
        }

        run.emit(None, EventType::RunSucceeded, EventPayload::default())
            .await?;
        tracing::info!(run_id = %run.run_id, "workflow run succeeded");
        Ok(RunOutcome::Succeeded)
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    async fn run_loop_begin(
        &self,
        run: &mut Run<'_, &S>,
        begin: &LoopBegin,
    ) -> Result<Flow, EngineError> {
        let previous = run.ctx.counter(&begin.id);
        let counter = if std::mem::take(&mut run.reentering) {
            previous + 1
        } else {
            1
        };

        if begin.max_iterations > 0 && counter > u64::from(begin.max_iterations) {
            tracing::warn!(
                loop_id = begin.id.as_str(),
                max_iterations = begin.max_iterations,
                "loop hit its iteration cap, forcing exit"
            );
            run.emit(
                Some(begin.id.as_str()),
                EventType::LoopForcedExit,
                EventPayload {
                    counter: Some(previous),
                    ..Default::default()
                },
            )
            .await?;
            let end = run.loop_end(&begin.id)?;
            return Ok(Flow::Jump(end + 1));
        }

        tracing::debug!(loop_id = begin.id.as_str(), counter, "loop iteration");
        run.emit(
            Some(begin.id.as_str()),
            EventType::LoopIteration,
            EventPayload {
                counter: Some(counter),
                ..Default::default()
            },
        )
        .await?;
        Ok(Flow::Next)
    }

    async fn run_loop_end(&self, run: &mut Run<'_, &S>, end: &LoopEnd) -> Result<Flow, EngineError> {
        match expression::evaluate(&end.exit_when, &run.ctx) {
            Ok(true) => {
                run.emit(Some(end.id.as_str()), EventType::Completed, EventPayload::default())
                    .await?;
                Ok(Flow::Next)
            }
            Ok(false) => {
                let begin = run.index_of(&end.loop_id)?;
                run.reentering = true;
                Ok(Flow::Jump(begin))
            }
            Err(e) => self.abort_node(run, &end.id, e.to_string()).await,
        }
    }

    // -----------------------------------------------------------------------
    // Switch
    // -----------------------------------------------------------------------

    async fn run_switch(
        &self,
        run: &mut Run<'_, &S>,
        switch: &SwitchStep,
    ) -> Result<Flow, EngineError> {
        let value = match interpolation::resolve(&switch.value, &run.ctx) {
            Ok(value) => value.trim().to_string(),
            Err(e) => return self.abort_node(run, &switch.id, e.to_string()).await,
        };

        let selected = switch
            .cases
            .iter()
            .find(|case| case.literal == value)
            .map(|case| case.steps.clone())
            .or_else(|| switch.default.clone())
            .unwrap_or_default();

        tracing::debug!(
            step_id = switch.id.as_str(),
            value = value.as_str(),
            selected = ?selected,
            "switch evaluated"
        );

        run.emit(
            Some(switch.id.as_str()),
            EventType::Completed,
            EventPayload {
                outputs: Some(BTreeMap::from([("value".to_string(), value)])),
                selected: Some(selected),
                ..Default::default()
            },
        )
        .await?;
        tracing::debug!(
            step_id = switch.id.as_str(),
            routing = ?run.ctx.routing_set(),
            "routing set updated"
        );
        Ok(Flow::Next)
    }

    /// A loop end or switch could not be evaluated. These have no failure
    /// policy, so the run aborts.
    async fn abort_node(
        &self,
        run: &mut Run<'_, &S>,
        step_id: &str,
        error: String,
    ) -> Result<Flow, EngineError> {
        tracing::error!(step_id, error = error.as_str(), "control node failed, aborting run");
        run.emit(
            Some(step_id),
            EventType::Failed,
            EventPayload {
                error: Some(error.clone()),
                disposition: Some(FailureAction::Abort.disposition()),
                ..Default::default()
            },
        )
        .await?;
        run.emit(
            None,
            EventType::RunAborted,
            EventPayload {
                reason: Some(error.clone()),
                ..Default::default()
            },
        )
        .await?;
        Ok(Flow::Stop(RunOutcome::Aborted {
            step_id: Some(step_id.to_string()),
            error,
        }))
    }

    // -----------------------------------------------------------------------
    // Action steps
    // -----------------------------------------------------------------------

    async fn run_action(&self, run: &mut Run<'_, &S>, step: &ActionStep) -> Result<Flow, EngineError> {
        let forced = run.forced.take() == Some(run.ip);
        let routed = run.ctx.is_routed(&step.id);
        let first_attempt = run.first_attempts.remove(&step.id).unwrap_or(0) + 1;
        let last_attempt = FailureHandler::last_attempt(&step.on_failure, first_attempt);
        let mut attempt = first_attempt;

        loop {
            let failure = match self.attempt(run, step, attempt, forced || routed).await? {
                Attempt::Skipped => return Ok(Flow::Next),
                Attempt::Completed(outputs) => {
                    run.emit(
                        Some(step.id.as_str()),
                        EventType::Completed,
                        EventPayload {
                            outputs: Some(outputs),
                            attempt: Some(attempt),
                            ..Default::default()
                        },
                    )
                    .await?;
                    tracing::info!(run_id = %run.run_id, step_id = step.id.as_str(), attempt, "step completed");
                    return Ok(Flow::Next);
                }
                Attempt::Failed(failure) => failure,
            };

            let error = failure.to_string();
            let action = FailureHandler::decide(&step.on_failure, attempt, last_attempt);
            tracing::warn!(
                run_id = %run.run_id,
                step_id = step.id.as_str(),
                attempt,
                error = error.as_str(),
                disposition = ?action.disposition(),
                "step failed"
            );

            let mut payload = EventPayload {
                error: Some(error.clone()),
                attempt: Some(attempt),
                disposition: Some(action.disposition()),
                ..Default::default()
            };

            match action {
                FailureAction::Retry { next_attempt } => {
                    run.emit(Some(step.id.as_str()), EventType::Failed, payload).await?;
                    attempt = next_attempt;
                }
                FailureAction::Skip => {
                    run.emit(Some(step.id.as_str()), EventType::Failed, payload).await?;
                    return Ok(Flow::Next);
                }
                FailureAction::Fallback { target } => {
                    let idx = run.index_of(&target)?;
                    payload.fallback_step = Some(target);
                    run.emit(Some(step.id.as_str()), EventType::Failed, payload).await?;
                    run.forced = Some(idx);
                    return Ok(Flow::Jump(idx));
                }
                FailureAction::Abort => {
                    run.emit(Some(step.id.as_str()), EventType::Failed, payload).await?;
                    run.emit(
                        None,
                        EventType::RunAborted,
                        EventPayload {
                            reason: Some(error.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                    tracing::error!(run_id = %run.run_id, step_id = step.id.as_str(), "workflow run aborted");
                    return Ok(Flow::Stop(RunOutcome::Aborted {
                        step_id: Some(step.id.clone()),
                        error,
                    }));
                }
                FailureAction::SelfHeal => {
                    let request =
                        FailureHandler::build_self_heal_request(run.run_id, step, &error, &run.ctx);
                    payload.snapshot = Some(request.snapshot.clone());
                    run.emit(Some(step.id.as_str()), EventType::Failed, payload).await?;
                    run.emit(
                        None,
                        EventType::RunPaused,
                        EventPayload {
                            reason: Some(format!("self-heal requested by step '{}'", step.id)),
                            ..Default::default()
                        },
                    )
                    .await?;

                    if let Some(tx) = &self.planner {
                        if tx.send(request.clone()).await.is_err() {
                            tracing::warn!(
                                run_id = %run.run_id,
                                "planner channel closed, self-heal request not delivered"
                            );
                        }
                    }
                    tracing::info!(run_id = %run.run_id, step_id = step.id.as_str(), "workflow paused for self-heal");
                    return Ok(Flow::Stop(RunOutcome::Paused(Box::new(request))));
                }
            }
        }
    }

    /// One attempt: condition, inputs, entitlements, dispatch, output checks.
    async fn attempt(
        &self,
        run: &mut Run<'_, &S>,
        step: &ActionStep,
        attempt: u32,
        ignore_condition: bool,
    ) -> Result<Attempt, EngineError> {
        if !ignore_condition {
            if let Some(condition) = &step.condition {
                match expression::evaluate(&condition.expr, &run.ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(step_id = step.id.as_str(), condition = condition.expr.as_str(), "condition false, skipping");
                        run.emit(
                            Some(step.id.as_str()),
                            EventType::Skipped,
                            EventPayload {
                                reason: Some(format!("condition '{}' is false", condition.expr)),
                                ..Default::default()
                            },
                        )
                        .await?;
                        return Ok(Attempt::Skipped);
                    }
                    Err(e) => return Ok(Attempt::Failed(e.into())),
                }
            }
        }

        let mut inputs = BTreeMap::new();
        for (key, raw) in &step.inputs {
            match interpolation::resolve_input(raw, &run.ctx) {
                Ok(value) => {
                    inputs.insert(key.clone(), value);
                }
                Err(e) => return Ok(Attempt::Failed(e.into())),
            }
        }

        if let Err(e) = EntitlementEnforcer::new(&run.doc.provider.entitlements).check(
            &step.extension,
            step.tool.as_deref(),
            &step.inputs,
        ) {
            return Ok(Attempt::Failed(DispatchError::Denied(e.to_string()).into()));
        }

        run.emit(
            Some(step.id.as_str()),
            EventType::Started,
            EventPayload {
                inputs: Some(inputs.clone()),
                attempt: Some(attempt),
                ..Default::default()
            },
        )
        .await?;

        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let request = ExtensionRequest {
            extension: step.extension.clone(),
            tool: step.tool.clone(),
            inputs,
            timeout_ms,
            attempt_id: format!("{}-{}-{}", run.run_id, step.id, attempt),
        };

        tracing::debug!(
            step_id = step.id.as_str(),
            extension = step.extension.as_str(),
            attempt,
            timeout_ms,
            "dispatching step"
        );

        let response = match tokio::time::timeout(timeout, self.invoker.invoke(request)).await {
            Err(_) => {
                return Ok(Attempt::Failed(
                    DispatchError::Timeout {
                        extension: step.extension.clone(),
                        timeout_ms,
                    }
                    .into(),
                ));
            }
            Ok(Err(e)) => return Ok(Attempt::Failed(e.into())),
            Ok(Ok(response)) => response,
        };

        if response.status == ResponseStatus::Error {
            let message = response
                .error_message
                .unwrap_or_else(|| "extension reported an error".to_string());
            return Ok(Attempt::Failed(
                DispatchError::Status {
                    extension: step.extension.clone(),
                    message,
                }
                .into(),
            ));
        }

        if let Err(e) = check_outputs(step, &response.outputs) {
            return Ok(Attempt::Failed(e.into()));
        }

        if let Some(validator) = &self.validator {
            let verdict = validator
                .validate(ValidationRequest {
                    step_id: step.id.clone(),
                    outputs: response.outputs.clone(),
                })
                .await;
            match verdict {
                Ok(v) if v.valid => {}
                Ok(v) => {
                    return Ok(Attempt::Failed(StepFailure::Rejected {
                        reason: v.reason.unwrap_or_else(|| "no reason given".to_string()),
                    }));
                }
                Err(e) => return Ok(Attempt::Failed(e.into())),
            }
        }

        Ok(Attempt::Completed(response.outputs))
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// What the main loop does after a node.
enum Flow {
    Next,
    Jump(usize),
    Stop(RunOutcome),
}

enum Attempt {
    Skipped,
    Completed(BTreeMap<String, String>),
    Failed(StepFailure),
}

/// Mutable state of one run in progress.
struct Run<'a, S> {
    doc: &'a WorkflowDocument,
    run_id: Uuid,
    ctx: ExecutionContext,
    log: EventLog<S>,
    /// Index of each loop's `loop_end`, keyed by loop id.
    loop_ends: HashMap<&'a str, usize>,
    ip: usize,
    /// Fallback target that runs next regardless of its condition.
    forced: Option<usize>,
    /// Set when a `loop_end` jumps back, so the `loop_begin` keeps counting.
    /// Entering a loop from outside, including a second pass of an
    /// enclosing loop, restarts its counter at 1.
    reentering: bool,
    /// Failed attempts recovered from the log, per step.
    first_attempts: BTreeMap<String, u32>,
}

impl<'a, S: EventStore> Run<'a, S> {
    fn new(
        doc: &'a WorkflowDocument,
        run_id: Uuid,
        ctx: ExecutionContext,
        log: EventLog<S>,
    ) -> Result<Self, EngineError> {
        let mut loop_ends = HashMap::new();
        for (idx, node) in doc.steps.iter().enumerate() {
            if let StepNode::LoopEnd(end) = node {
                loop_ends.insert(end.loop_id.as_str(), idx);
            }
        }
        for node in &doc.steps {
            if let StepNode::LoopBegin(begin) = node {
                if !loop_ends.contains_key(begin.id.as_str()) {
                    return Err(EngineError::UnmatchedLoop {
                        loop_id: begin.id.clone(),
                    });
                }
            }
        }

        Ok(Self {
            doc,
            run_id,
            ctx,
            log,
            loop_ends,
            ip: 0,
            forced: None,
            reentering: false,
            first_attempts: BTreeMap::new(),
        })
    }

    /// Append an event and fold it into the context.
    async fn emit(
        &mut self,
        step_id: Option<&str>,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<(), EngineError> {
        let event = self.log.append(step_id, event_type, payload).await?;
        self.ctx.apply(&event);
        Ok(())
    }

    fn index_of(&self, step_id: &str) -> Result<usize, EngineError> {
        self.doc
            .index_of(step_id)
            .ok_or_else(|| EngineError::ResumePointMissing {
                step_id: step_id.to_string(),
            })
    }

    fn loop_end(&self, loop_id: &str) -> Result<usize, EngineError> {
        self.loop_ends
            .get(loop_id)
            .copied()
            .ok_or_else(|| EngineError::UnmatchedLoop {
                loop_id: loop_id.to_string(),
            })
    }

    fn finish(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: self.run_id,
            outcome,
            context: self.ctx,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::event_store::InMemoryEventStore;
    use crate::workflow::boundary::{
        ExtensionResponse, ValidationVerdict, ValidatorError,
    };
    use paws_types::event::{Disposition, Event};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    // -- Scripted invoker ---------------------------------------------------

    type Reply = Result<ExtensionResponse, DispatchError>;

    #[derive(Default)]
    struct Script {
        replies: HashMap<String, VecDeque<Reply>>,
        calls: Vec<ExtensionRequest>,
        cancel_after: Option<(String, CancellationToken)>,
    }

    /// Extension invoker replaying canned replies per step id and recording
    /// every request. Steps without a script succeed with `stdout: ok`. The
    /// last scripted reply for a step repeats once the queue is drained.
    #[derive(Clone, Default)]
    struct ScriptedInvoker {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedInvoker {
        fn reply(&self, step: &str, pairs: &[(&str, &str)]) -> &Self {
            let outputs = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.push(step, Ok(ExtensionResponse::success(outputs)))
        }

        fn fail(&self, step: &str, message: &str) -> &Self {
            self.push(step, Ok(ExtensionResponse::error(message)))
        }

        fn push(&self, step: &str, reply: Reply) -> &Self {
            self.script
                .lock()
                .unwrap()
                .replies
                .entry(step.to_string())
                .or_default()
                .push_back(reply);
            self
        }

        fn cancel_after(&self, step: &str, token: CancellationToken) {
            self.script.lock().unwrap().cancel_after = Some((step.to_string(), token));
        }

        fn calls(&self) -> Vec<String> {
            self.script
                .lock()
                .unwrap()
                .calls
                .iter()
                .map(step_of)
                .collect()
        }

        fn requests(&self) -> Vec<ExtensionRequest> {
            self.script.lock().unwrap().calls.clone()
        }
    }

    /// Recover the step id from `"{run_id}-{step_id}-{attempt}"`.
    fn step_of(request: &ExtensionRequest) -> String {
        let rest = &request.attempt_id[37..];
        rest.rsplit_once('-').map(|(s, _)| s.to_string()).unwrap()
    }

    impl ExtensionInvoker for ScriptedInvoker {
        fn has_extension(&self, extension: &str) -> bool {
            extension == "Bash"
        }

        async fn invoke(&self, request: ExtensionRequest) -> Result<ExtensionResponse, DispatchError> {
            let step = step_of(&request);
            let mut script = self.script.lock().unwrap();
            script.calls.push(request);
            if let Some((after, token)) = &script.cancel_after {
                if *after == step {
                    token.cancel();
                }
            }
            let Some(queue) = script.replies.get_mut(&step) else {
                return Ok(ExtensionResponse::success(BTreeMap::from([(
                    "stdout".to_string(),
                    "ok".to_string(),
                )])));
            };
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            }
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn doc(steps: &str) -> WorkflowDocument {
        let yaml = format!(
            "provider: {{ name: Localhost }}\nuser_inputs: {{ prompt: make a gif }}\nsteps:\n{steps}"
        );
        serde_yaml_ng::from_str(&yaml).unwrap()
    }

    fn engine(invoker: &ScriptedInvoker) -> WorkflowEngine<ScriptedInvoker, InMemoryEventStore> {
        WorkflowEngine::new(invoker.clone(), InMemoryEventStore::new())
    }

    async fn events<X: ExtensionInvoker>(engine: &WorkflowEngine<X, InMemoryEventStore>) -> Vec<Event> {
        engine.store().read_all().await.unwrap()
    }

    fn of_type<'a>(events: &'a [Event], ty: EventType, step: &str) -> Vec<&'a Event> {
        events
            .iter()
            .filter(|e| e.event_type == ty && e.step_id.as_deref() == Some(step))
            .collect()
    }

    const THREE_STEPS: &str = r#"
  - { id: fetch, description: fetch, extension: Bash, inputs: { command: "echo one" } }
  - { id: convert, description: convert, extension: Bash, inputs: { command: "echo {{fetch.stdout}}" } }
  - { id: publish, description: publish, extension: Bash, inputs: { command: "echo {{convert.stdout}}" } }
"#;

    // -- Tests --------------------------------------------------------------

    #[tokio::test]
    async fn test_duplicate_id_never_starts() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: a, extension: Bash }
  - { id: a, extension: Bash }
"#);

        let err = engine.start(&doc).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDocument(ref r) if !r.is_valid()));
        assert!(events(&engine).await.is_empty());
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_linear_run_succeeds_and_interpolates() {
        let invoker = ScriptedInvoker::default();
        invoker.reply("fetch", &[("stdout", "movie.mp4")]);
        let engine = engine(&invoker);

        let report = engine.start(&doc(THREE_STEPS)).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["fetch", "convert", "publish"]);

        let requests = invoker.requests();
        assert_eq!(requests[1].inputs["command"], "echo movie.mp4");
        assert_eq!(requests[1].timeout_ms, DEFAULT_STEP_TIMEOUT_SECS * 1000);
        assert!(requests[1].attempt_id.ends_with("-convert-1"));

        let log = events(&engine).await;
        assert_eq!(log.first().unwrap().event_type, EventType::RunStarted);
        assert_eq!(log.first().unwrap().payload.run_id, Some(report.run_id));
        assert_eq!(log.last().unwrap().event_type, EventType::RunSucceeded);
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=log.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_replay_reconstructs_identical_context() {
        let invoker = ScriptedInvoker::default();
        invoker.reply("sample", &[("stdout", "missing")]);
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: poll, loop_begin: { max_iterations: 3 } }
  - { id: sample, description: sample, extension: Bash }
  - { id: poll_end, loop_end: { loop_id: poll, exit_when: "{{sample.stdout}} == exists" } }
  - id: route
    switch:
      value: "{{sample.stdout}}"
      cases: [ { match: missing, steps: [make] } ]
  - { id: make, description: make, extension: Bash }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);

        let state = replay(&doc, &events(&engine).await);
        assert_eq!(state.context, report.context);
        assert_eq!(state.resume_point, ResumePoint::Finished);
    }

    #[tokio::test]
    async fn test_loop_counter_and_forced_exit() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: poll, loop_begin: { max_iterations: 3 } }
  - { id: sample, description: sample, extension: Bash, inputs: { pass: "{{poll.counter}}" } }
  - { id: poll_end, loop_end: { loop_id: poll, exit_when: "{{poll.counter}} == 99" } }
  - { id: after, description: after, extension: Bash }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);

        let passes: Vec<String> = invoker
            .requests()
            .iter()
            .filter(|r| step_of(r) == "sample")
            .map(|r| r.inputs["pass"].clone())
            .collect();
        assert_eq!(passes, vec!["1", "2", "3"]);

        let log = events(&engine).await;
        let counters: Vec<u64> = of_type(&log, EventType::LoopIteration, "poll")
            .iter()
            .map(|e| e.payload.counter.unwrap())
            .collect();
        assert_eq!(counters, vec![1, 2, 3]);
        let forced = of_type(&log, EventType::LoopForcedExit, "poll");
        assert_eq!(forced.len(), 1);
        assert_eq!(report.context.counter("poll"), 3);
        assert!(of_type(&log, EventType::Completed, "poll_end").is_empty());
        assert_eq!(invoker.calls().last().unwrap(), "after");
    }

    #[tokio::test]
    async fn test_unbounded_loop_exits_on_condition() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: poll, loop_begin: { max_iterations: 0 } }
  - { id: sample, description: sample, extension: Bash }
  - { id: poll_end, loop_end: { loop_id: poll, exit_when: "{{poll.counter}} >= 250" } }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls().len(), 250);

        let log = events(&engine).await;
        assert!(of_type(&log, EventType::LoopForcedExit, "poll").is_empty());
        assert_eq!(of_type(&log, EventType::Completed, "poll_end").len(), 1);
    }

    #[tokio::test]
    async fn test_nested_loop_counter_restarts() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: outer, loop_begin: { max_iterations: 2 } }
  - { id: inner, loop_begin: { max_iterations: 2 } }
  - { id: work, description: work, extension: Bash, inputs: { at: "{{outer.counter}}/{{inner.counter}}" } }
  - { id: inner_end, loop_end: { loop_id: inner, exit_when: "{{inner.counter}} == 2" } }
  - { id: outer_end, loop_end: { loop_id: outer, exit_when: "{{outer.counter}} == 2" } }
"#);

        engine.start(&doc).await.unwrap();
        let at: Vec<String> = invoker.requests().iter().map(|r| r.inputs["at"].clone()).collect();
        assert_eq!(at, vec!["1/1", "1/2", "2/1", "2/2"]);
    }

    #[tokio::test]
    async fn test_switch_selects_first_matching_case() {
        let invoker = ScriptedInvoker::default();
        invoker.reply("sample", &[("stdout", "exists\n")]);
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: sample, description: sample, extension: Bash }
  - id: route
    switch:
      value: "{{sample.stdout}}"
      cases:
        - { match: exists, steps: [first] }
        - { match: exists, steps: [second] }
      default: [third]
  - { id: first, description: first, extension: Bash, condition: { if: "false" } }
  - { id: second, description: second, extension: Bash, condition: { if: "false" } }
  - { id: third, description: third, extension: Bash, condition: { if: "false" } }
"#);

        engine.start(&doc).await.unwrap();
        assert_eq!(invoker.calls(), vec!["sample", "first"]);

        let log = events(&engine).await;
        let route = of_type(&log, EventType::Completed, "route");
        assert_eq!(route[0].payload.selected.as_deref(), Some(&["first".to_string()][..]));
        assert_eq!(of_type(&log, EventType::Skipped, "second").len(), 1);
    }

    #[tokio::test]
    async fn test_false_condition_skips_sibling() {
        let invoker = ScriptedInvoker::default();
        invoker.reply("check_file", &[("stdout", "missing")]);
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: check_file, description: check, extension: Bash }
  - { id: convert, description: convert, extension: Bash, condition: { if: "{{check_file.stdout}} == exists" } }
  - { id: regenerate, description: regenerate, extension: Bash, condition: { if: "{{check_file.stdout}} == missing" } }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["check_file", "regenerate"]);

        let log = events(&engine).await;
        assert_eq!(of_type(&log, EventType::Skipped, "convert").len(), 1);
        assert!(of_type(&log, EventType::Started, "convert").is_empty());
        assert!(report.context.step_output("convert").is_none());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_aborts() {
        let invoker = ScriptedInvoker::default();
        invoker.fail("flaky", "exit 1");
        let engine = engine(&invoker);
        let doc = doc(r#"
  - id: flaky
    description: flaky
    extension: Bash
    on_failure: { strategy: retry, max_retries: 2 }
  - { id: never, description: never, extension: Bash }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert!(matches!(report.outcome, RunOutcome::Aborted { ref step_id, .. } if step_id.as_deref() == Some("flaky")));
        assert_eq!(report.outcome.status(), RunStatus::Aborted);
        assert_eq!(invoker.calls(), vec!["flaky", "flaky", "flaky"]);

        let log = events(&engine).await;
        let failed = of_type(&log, EventType::Failed, "flaky");
        assert_eq!(failed.len(), 3);
        let dispositions: Vec<Disposition> = failed.iter().map(|e| e.payload.disposition.unwrap()).collect();
        assert_eq!(
            dispositions,
            vec![Disposition::Retrying, Disposition::Retrying, Disposition::Aborted]
        );
        let attempts: Vec<u32> = failed.iter().map(|e| e.payload.attempt.unwrap()).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(log.last().unwrap().event_type, EventType::RunAborted);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let invoker = ScriptedInvoker::default();
        invoker.fail("flaky", "exit 1").reply("flaky", &[("stdout", "fine")]);
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: flaky, description: flaky, extension: Bash, on_failure: { strategy: retry, max_retries: 3 } }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.context.lookup("flaky", "stdout").as_deref(), Some("fine"));
    }

    #[tokio::test]
    async fn test_skip_policy_continues() {
        let invoker = ScriptedInvoker::default();
        invoker.fail("optional", "nope");
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: optional, description: optional, extension: Bash, on_failure: { strategy: skip } }
  - { id: next, description: next, extension: Bash }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["optional", "next"]);
        assert!(report.context.step_output("optional").is_none());
    }

    #[tokio::test]
    async fn test_skip_in_later_loop_pass_drops_stale_outputs() {
        let invoker = ScriptedInvoker::default();
        invoker.reply("fetch", &[("stdout", "v1")]).fail("fetch", "gone");
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: poll, loop_begin: { max_iterations: 5 } }
  - { id: fetch, description: fetch, extension: Bash, on_failure: { strategy: skip } }
  - { id: use_it, description: use, extension: Bash, inputs: { v: "{{fetch.stdout}}" }, on_failure: { strategy: skip } }
  - { id: poll_end, loop_end: { loop_id: poll, exit_when: "{{poll.counter}} >= 2" } }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["fetch", "use_it", "fetch"]);
        assert_eq!(invoker.requests()[1].inputs["v"], "v1");

        let log = events(&engine).await;
        let use_failures = of_type(&log, EventType::Failed, "use_it");
        assert_eq!(use_failures.len(), 1);
        assert!(use_failures[0].payload.error.as_deref().unwrap().contains("fetch.stdout"));
        assert!(report.context.step_output("fetch").is_none());
        assert!(report.context.step_output("use_it").is_none());

        let state = replay(&doc, &log);
        assert_eq!(state.context, report.context);
    }

    #[tokio::test]
    async fn test_fallback_forces_target() {
        let invoker = ScriptedInvoker::default();
        invoker.fail("primary", "down");
        let engine = engine(&invoker);
        let doc = doc(r#"
  - id: primary
    description: primary
    extension: Bash
    on_failure: { strategy: fallback, fallback_step: backup }
  - { id: middle, description: middle, extension: Bash }
  - { id: backup, description: backup, extension: Bash, condition: { if: "false" } }
  - { id: last, description: last, extension: Bash }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["primary", "backup", "last"]);

        let log = events(&engine).await;
        let failed = of_type(&log, EventType::Failed, "primary");
        assert_eq!(failed[0].payload.disposition, Some(Disposition::Fallback));
        assert_eq!(failed[0].payload.fallback_step.as_deref(), Some("backup"));
    }

    #[tokio::test]
    async fn test_missing_output_and_critical_empty_fail_step() {
        let invoker = ScriptedInvoker::default();
        invoker.reply("sample", &[("stdout", "")]);
        let engine = engine(&invoker);
        let doc = doc(r#"
  - id: sample
    description: sample
    extension: Bash
    outputs: { stdout: { critical: true } }
"#);

        let report = engine.start(&doc).await.unwrap();
        match report.outcome {
            RunOutcome::Aborted { error, .. } => assert!(error.contains("empty critical output")),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_dispatch_failure() {
        struct Slow;
        impl ExtensionInvoker for Slow {
            fn has_extension(&self, _: &str) -> bool {
                true
            }
            async fn invoke(&self, _: ExtensionRequest) -> Result<ExtensionResponse, DispatchError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ExtensionResponse::success(BTreeMap::new()))
            }
        }

        let engine = WorkflowEngine::new(Slow, InMemoryEventStore::new())
            .with_default_timeout(Duration::from_millis(20));
        let report = engine
            .start(&doc("  - { id: slow, description: slow, extension: Bash }\n"))
            .await
            .unwrap();
        match report.outcome {
            RunOutcome::Aborted { error, .. } => assert!(error.contains("timed out")),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validator_rejection_fails_step() {
        struct RejectAll;
        impl OutputValidator for RejectAll {
            async fn validate(&self, _: ValidationRequest) -> Result<ValidationVerdict, ValidatorError> {
                Ok(ValidationVerdict::reject("output looks wrong"))
            }
        }

        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker).with_validator(BoxOutputValidator::new(RejectAll));
        let report = engine
            .start(&doc("  - { id: a, description: a, extension: Bash, on_failure: { strategy: skip } }\n"))
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);

        let log = events(&engine).await;
        let failed = of_type(&log, EventType::Failed, "a");
        assert!(failed[0].payload.error.as_deref().unwrap().contains("output looks wrong"));
    }

    #[tokio::test]
    async fn test_entitlement_denial_is_step_failure() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc: WorkflowDocument = serde_yaml_ng::from_str(
            r#"
provider:
  name: Localhost
  entitlements: [ { scope: "Read ./data/", capability: "File Access" } ]
user_inputs: { prompt: hi }
steps:
  - { id: a, description: a, extension: Bash, inputs: { command: ls } }
"#,
        )
        .unwrap();

        let report = engine.start(&doc).await.unwrap();
        match report.outcome {
            RunOutcome::Aborted { error, .. } => assert!(error.contains("entitlement denied")),
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_condition_error_uses_failure_policy() {
        let invoker = ScriptedInvoker::default();
        invoker.reply("sample", &[("stdout", "abc")]);
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: sample, description: sample, extension: Bash }
  - id: gated
    description: gated
    extension: Bash
    condition: { if: "{{sample.stdout}} > 3" }
    on_failure: { strategy: skip }
  - { id: tail, description: tail, extension: Bash }
"#);

        let report = engine.start(&doc).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["sample", "tail"]);
        let log = events(&engine).await;
        assert_eq!(
            of_type(&log, EventType::Failed, "gated")[0].payload.disposition,
            Some(Disposition::Skipped)
        );
    }

    #[tokio::test]
    async fn test_resume_after_second_step() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc = doc(THREE_STEPS);
        engine.start(&doc).await.unwrap();

        // Keep everything up to and including convert's completion.
        let full = events(&engine).await;
        let cut = full
            .iter()
            .position(|e| e.event_type == EventType::Completed && e.step_id.as_deref() == Some("convert"))
            .unwrap();
        let truncated = full[..=cut].to_vec();

        let resumed_invoker = ScriptedInvoker::default();
        let resumed = WorkflowEngine::new(resumed_invoker.clone(), InMemoryEventStore::with_events(truncated));
        let report = resumed
            .resume(&doc, ResumeInstruction::default())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(resumed_invoker.calls(), vec!["publish"]);
        assert_eq!(resumed_invoker.requests()[0].inputs["command"], "echo ok");

        let log = events(&resumed).await;
        assert_eq!(log[cut + 1].event_type, EventType::RunResumed);
        assert_eq!(log[cut + 1].seq, full[cut].seq + 1);
    }

    #[tokio::test]
    async fn test_self_heal_pauses_then_resumes() {
        let invoker = ScriptedInvoker::default();
        invoker.fail("convert", "ffmpeg: not found");
        let (tx, mut rx) = mpsc::channel(1);
        let engine = engine(&invoker).with_planner_channel(tx);
        let doc = doc(r#"
  - { id: fetch, description: fetch, extension: Bash }
  - id: convert
    description: Convert the video
    extension: Bash
    on_failure: { strategy: self_heal }
  - { id: publish, description: publish, extension: Bash }
"#);

        let report = engine.start(&doc).await.unwrap();
        let RunOutcome::Paused(request) = &report.outcome else {
            panic!("expected pause, got {:?}", report.outcome);
        };
        assert_eq!(report.outcome.status(), RunStatus::Paused);
        assert_eq!(request.failed_step.id, "convert");
        assert!(request.error.contains("ffmpeg"));
        assert_eq!(request.context_summary.completed_steps, vec!["fetch"]);
        assert_eq!(rx.recv().await.unwrap(), **request);

        let log = events(&engine).await;
        let failed = of_type(&log, EventType::Failed, "convert");
        assert_eq!(failed[0].payload.disposition, Some(Disposition::SelfHeal));
        assert!(failed[0].payload.snapshot.is_some());
        assert_eq!(log.last().unwrap().event_type, EventType::RunPaused);

        // The planner revises convert; resume re-dispatches it.
        invoker.script.lock().unwrap().replies.remove("convert");
        invoker.reply("convert", &[("stdout", "out.gif")]);
        let revised = doc.clone();
        let report = engine
            .resume(&revised, ResumeInstruction::RetryFailedStep)
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["fetch", "convert", "convert", "publish"]);
        assert!(invoker.requests()[2].attempt_id.ends_with("-convert-2"));
        assert_eq!(report.context.lookup("convert", "stdout").as_deref(), Some("out.gif"));
    }

    #[tokio::test]
    async fn test_resume_can_skip_failed_step() {
        let invoker = ScriptedInvoker::default();
        invoker.fail("convert", "boom");
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: convert, description: convert, extension: Bash, on_failure: { strategy: self_heal } }
  - { id: publish, description: publish, extension: Bash }
"#);

        engine.start(&doc).await.unwrap();
        let report = engine
            .resume(&doc, ResumeInstruction::SkipFailedStep)
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["convert", "publish"]);
        let log = events(&engine).await;
        let skipped = of_type(&log, EventType::Skipped, "convert");
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].payload.reason.as_deref().is_some_and(|r| r.contains("boom")));
    }

    #[tokio::test]
    async fn test_resume_point_missing_from_revised_document() {
        let invoker = ScriptedInvoker::default();
        invoker.fail("b", "boom");
        let engine = engine(&invoker);
        let doc = doc(r#"
  - { id: a, description: a, extension: Bash }
  - { id: b, description: b, extension: Bash, on_failure: { strategy: self_heal } }
"#);
        engine.start(&doc).await.unwrap();

        let revised = self::doc("  - { id: z, description: z, extension: Bash }\n");
        let err = engine.resume(&revised, ResumeInstruction::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::ResumePointMissing { ref step_id } if step_id == "a"));
    }

    #[tokio::test]
    async fn test_resume_finished_run_is_noop() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc = doc(THREE_STEPS);
        engine.start(&doc).await.unwrap();
        let before = events(&engine).await.len();

        let report = engine.resume(&doc, ResumeInstruction::default()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(events(&engine).await.len(), before);
        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_at_step_boundary() {
        let invoker = ScriptedInvoker::default();
        let token = CancellationToken::new();
        invoker.cancel_after("fetch", token.clone());
        let engine = engine(&invoker).with_cancellation(token);

        let report = engine.start(&doc(THREE_STEPS)).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.outcome.status(), RunStatus::Cancelled);
        // The in-flight dispatch finished and was recorded.
        assert_eq!(invoker.calls(), vec!["fetch"]);
        assert!(report.context.step_output("fetch").is_some());
        let log = events(&engine).await;
        assert_eq!(log.last().unwrap().event_type, EventType::RunCancelled);

        // A cancelled run resumes where it stopped.
        let engine = WorkflowEngine::new(invoker.clone(), InMemoryEventStore::with_events(log));
        let report = engine.resume(&doc(THREE_STEPS), ResumeInstruction::default()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(invoker.calls(), vec!["fetch", "convert", "publish"]);
    }

    #[tokio::test]
    async fn test_start_refuses_used_store() {
        let invoker = ScriptedInvoker::default();
        let engine = engine(&invoker);
        let doc = doc(THREE_STEPS);
        engine.start(&doc).await.unwrap();
        assert!(matches!(engine.start(&doc).await, Err(EngineError::RunAlreadyStarted)));
    }
}
