//! Ready-set scheduler that drives one workflow run to completion.
//!
//! Steps move Pending → Ready once every dependency is Completed. A Ready step
//! is handed to a task when a concurrency slot is free; the task waits for its
//! handler slot (serialized handlers admit one invocation at a time) and then
//! asks the scheduler to start it. Only then is the step committed as Running
//! and its timeout started. Every transition is committed to the state store
//! before the scheduler acts on it. Control commands, start requests, and step
//! completions are awaited together, so the scheduler never polls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_types::{
    ExecutionRecord, RecordError, RunControl, RunEvent, RunStatus, StepError, StepErrorKind, StepStatus,
    WorkflowDefinition,
};
use cadence_util::{EngineConfig, RecordStore, StoreError, redact_params};
use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::EventSink;
use super::planning::ExecutionPlan;
use crate::error::EngineError;
use crate::handler::{HandlerParams, HandlerRegistry, RegistryError};
use crate::resolve::{ResolutionScope, resolve_params};

/// Effective scheduling policy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub max_concurrency: usize,
    pub step_timeout: Duration,
    pub continue_on_error: bool,
}

impl RunSettings {
    /// Workflow-level overrides layered over the engine configuration.
    pub fn resolve(config: &EngineConfig, workflow: &WorkflowDefinition) -> Self {
        Self {
            max_concurrency: workflow.max_concurrency.unwrap_or(config.max_concurrency).max(1),
            step_timeout: workflow
                .step_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.step_timeout()),
            continue_on_error: workflow.continue_on_error.unwrap_or(config.continue_on_error),
        }
    }
}

/// How a run ended, before it is committed to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SchedulerOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
}

impl SchedulerOutcome {
    pub(crate) fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            error: Some("cancelled by request".to_string()),
        }
    }
}

/// Sent by a step task once it holds its handler slot.
struct StartRequest {
    step_id: String,
    /// `true` lets the task invoke the handler.
    reply: oneshot::Sender<bool>,
}

enum StepOutcome {
    Finished(Result<HandlerParams, StepError>),
    /// The scheduler stopped dispatching while the task waited for its slot.
    NotStarted,
}

struct StepCompletion {
    step_id: String,
    outcome: StepOutcome,
    duration_ms: u64,
}

/// Resolved inputs of a dispatched step that has not started yet.
struct Launch {
    params: HandlerParams,
    handler: String,
    provenance: &'static str,
}

enum LoopEvent {
    Joined(Option<Result<StepCompletion, tokio::task::JoinError>>),
    StartRequested(Option<StartRequest>),
    Control(Option<RunControl>),
}

#[derive(Default)]
struct RunState {
    statuses: HashMap<String, StepStatus>,
    results: HashMap<String, HandlerParams>,
    ready: VecDeque<String>,
    launching: HashMap<String, Launch>,
    /// First step that failed on its own, with its error.
    root_failure: Option<(String, StepError)>,
    halted_by: Option<String>,
    cancelled: bool,
}

impl RunState {
    fn accepting(&self) -> bool {
        !self.cancelled && self.halted_by.is_none()
    }
}

pub(crate) struct Scheduler {
    instruction_id: String,
    plan: ExecutionPlan,
    settings: RunSettings,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn RecordStore>,
    events: EventSink,
}

impl Scheduler {
    pub(crate) fn new(
        instruction_id: String,
        plan: ExecutionPlan,
        settings: RunSettings,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn RecordStore>,
        events: EventSink,
    ) -> Self {
        Self {
            instruction_id,
            plan,
            settings,
            registry,
            store,
            events,
        }
    }

    /// Run every step of the plan that can run, starting from `record`.
    ///
    /// Steps already Completed in `record` (carried over by a retry) are
    /// treated as satisfied dependencies and never re-run.
    pub(crate) async fn run(
        self,
        record: &ExecutionRecord,
        control_rx: &mut UnboundedReceiver<RunControl>,
    ) -> Result<SchedulerOutcome, EngineError> {
        let mut state = RunState::default();
        for (step_id, step) in &record.steps {
            state.statuses.insert(step_id.clone(), step.status);
            if step.status == StepStatus::Completed
                && let Some(result) = &step.result
            {
                state.results.insert(step_id.clone(), result.clone());
            }
        }

        let mut in_flight: JoinSet<StepCompletion> = JoinSet::new();
        let (start_tx, mut start_rx) = unbounded_channel();
        let mut control_open = true;

        loop {
            control_open = self.drain_pending_commands(&mut state, control_rx, control_open);

            if state.accepting() {
                self.promote_ready(&mut state)?;
                while state.accepting() && in_flight.len() < self.settings.max_concurrency {
                    let Some(step_id) = state.ready.pop_front() else {
                        break;
                    };
                    self.dispatch(step_id, &mut state, &mut in_flight, &start_tx)?;
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                joined = in_flight.join_next() => LoopEvent::Joined(joined),
                request = start_rx.recv() => LoopEvent::StartRequested(request),
                command = control_rx.recv(), if control_open => LoopEvent::Control(command),
            };

            match event {
                LoopEvent::Joined(Some(Ok(completion))) => self.finish(completion, &mut state)?,
                LoopEvent::Joined(Some(Err(source))) => {
                    return Err(EngineError::RunTask {
                        id: self.instruction_id.clone(),
                        source,
                    });
                }
                LoopEvent::Joined(None) | LoopEvent::StartRequested(None) => {}
                LoopEvent::StartRequested(Some(request)) => self.start_step(request, &mut state)?,
                LoopEvent::Control(Some(command)) => self.process_command(command, &mut state),
                LoopEvent::Control(None) => control_open = false,
            }
        }

        if !state.cancelled
            && let Some(failed_step) = state.halted_by.clone()
        {
            self.abort_remaining(&failed_step, &mut state)?;
        }

        Ok(self.outcome(&state))
    }

    fn drain_pending_commands(
        &self,
        state: &mut RunState,
        control_rx: &mut UnboundedReceiver<RunControl>,
        control_open: bool,
    ) -> bool {
        if !control_open {
            return false;
        }
        loop {
            match control_rx.try_recv() {
                Ok(command) => self.process_command(command, state),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn process_command(&self, command: RunControl, state: &mut RunState) {
        match command {
            RunControl::Cancel => {
                if !state.cancelled {
                    state.cancelled = true;
                    info!(instruction_id = %self.instruction_id, "cancellation requested; no further steps will start");
                    self.events.emit(RunEvent::CancelRequested {
                        instruction_id: self.instruction_id.clone(),
                    });
                }
            }
        }
    }

    /// Move every Pending step whose dependencies are all Completed to Ready.
    fn promote_ready(&self, state: &mut RunState) -> Result<(), EngineError> {
        let newly_ready: Vec<String> = self
            .plan
            .steps()
            .filter(|step| state.statuses.get(&step.definition.step_id) == Some(&StepStatus::Pending))
            .filter(|step| {
                step.dependencies
                    .iter()
                    .all(|dependency| state.statuses.get(dependency) == Some(&StepStatus::Completed))
            })
            .map(|step| step.definition.step_id.clone())
            .collect();

        if newly_ready.is_empty() {
            return Ok(());
        }

        self.commit(&mut |record| {
            for step_id in &newly_ready {
                record.transition_step(step_id, StepStatus::Ready)?;
            }
            Ok(())
        })?;

        for step_id in newly_ready {
            debug!(instruction_id = %self.instruction_id, step_id = %step_id, "step ready");
            state.statuses.insert(step_id.clone(), StepStatus::Ready);
            self.events.emit(RunEvent::StepReady {
                instruction_id: self.instruction_id.clone(),
                step_id: step_id.clone(),
            });
            state.ready.push_back(step_id);
        }
        Ok(())
    }

    /// Resolve parameters and handler for a Ready step and hand it to a task.
    ///
    /// Resolution failures fail the step without invoking any handler. The
    /// step stays Ready until its task holds the handler slot.
    fn dispatch(
        &self,
        step_id: String,
        state: &mut RunState,
        in_flight: &mut JoinSet<StepCompletion>,
        start_tx: &UnboundedSender<StartRequest>,
    ) -> Result<(), EngineError> {
        let Some(planned) = self.plan.step(&step_id) else {
            return Err(StoreError::Record(RecordError::UnknownStep { step_id }).into());
        };
        let definition = &planned.definition;

        let mut scope = ResolutionScope::default();
        for ancestor in &planned.ancestors {
            if let Some(result) = state.results.get(ancestor) {
                scope.insert(ancestor.clone(), result.clone());
            }
        }

        let params = match resolve_params(&step_id, &definition.params, &scope) {
            Ok(params) => params,
            Err(error) => {
                warn!(instruction_id = %self.instruction_id, step_id = %step_id, error = %error, "template resolution failed");
                let failure = StepError::new(StepErrorKind::TemplateResolution, EngineError::from(error).to_string());
                return self.record_failure(&step_id, failure, None, 0, state);
            }
        };

        let handler = match self.registry.resolve(&definition.handler) {
            Ok(handler) => handler,
            Err(error @ RegistryError::NotFound { .. }) => {
                warn!(instruction_id = %self.instruction_id, step_id = %step_id, handler = %definition.handler, "handler not found");
                let failure = StepError::new(StepErrorKind::HandlerNotFound, EngineError::from(error).to_string());
                return self.record_failure(&step_id, failure, Some(params), 0, state);
            }
            Err(error) => return Err(error.into()),
        };

        state.launching.insert(
            step_id.clone(),
            Launch {
                params: params.clone(),
                handler: handler.name().to_string(),
                provenance: handler.descriptor().provenance.label(),
            },
        );

        let timeout = definition.timeout_secs.map(Duration::from_secs).unwrap_or(self.settings.step_timeout);
        let start_tx = start_tx.clone();
        in_flight.spawn(async move {
            let slot = handler.acquire().await;
            let (reply, approval) = oneshot::channel();
            let request = StartRequest {
                step_id: step_id.clone(),
                reply,
            };
            let approved = start_tx.send(request).is_ok() && approval.await.unwrap_or(false);
            if !approved {
                return StepCompletion {
                    step_id,
                    outcome: StepOutcome::NotStarted,
                    duration_ms: 0,
                };
            }

            let clock = Instant::now();
            let outcome = match tokio::time::timeout(timeout, slot.invoke(params)).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(source)) => Err(StepError::new(
                    StepErrorKind::HandlerExecution,
                    EngineError::handler_execution(slot.name(), source).to_string(),
                )),
                Err(_) => Err(StepError::new(
                    StepErrorKind::Timeout,
                    EngineError::Timeout {
                        handler: slot.name().to_string(),
                        timeout,
                    }
                    .to_string(),
                )),
            };
            StepCompletion {
                step_id,
                outcome: StepOutcome::Finished(outcome),
                duration_ms: clock.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
            }
        });
        Ok(())
    }

    /// Commit a dispatched step as Running once its task holds the handler slot.
    ///
    /// Refused when the run stopped dispatching in the meantime; the step then
    /// keeps its Ready status.
    fn start_step(&self, request: StartRequest, state: &mut RunState) -> Result<(), EngineError> {
        let StartRequest { step_id, reply } = request;
        let Some(launch) = state.launching.remove(&step_id) else {
            let _ = reply.send(false);
            return Ok(());
        };
        if !state.accepting() {
            debug!(instruction_id = %self.instruction_id, step_id = %step_id, "step not started; dispatch has stopped");
            let _ = reply.send(false);
            return Ok(());
        }

        let started_at = Utc::now();
        self.commit(&mut |record| {
            let step = record.transition_step(&step_id, StepStatus::Running)?;
            step.resolved_params = Some(launch.params.clone());
            step.started_at = Some(started_at);
            Ok(())
        })?;
        state.statuses.insert(step_id.clone(), StepStatus::Running);

        let redacted = serde_json::Value::Object(redact_params(&launch.params));
        info!(
            instruction_id = %self.instruction_id,
            step_id = %step_id,
            handler = %launch.handler,
            provenance = launch.provenance,
            params = %redacted,
            "invoking handler"
        );
        self.events.emit(RunEvent::StepStarted {
            instruction_id: self.instruction_id.clone(),
            step_id: step_id.clone(),
            handler: launch.handler,
            started_at,
        });
        let _ = reply.send(true);
        Ok(())
    }

    fn finish(&self, completion: StepCompletion, state: &mut RunState) -> Result<(), EngineError> {
        let StepCompletion {
            step_id,
            outcome,
            duration_ms,
        } = completion;

        match outcome {
            StepOutcome::NotStarted => {
                debug!(instruction_id = %self.instruction_id, step_id = %step_id, "dispatched step released without running");
                Ok(())
            }
            StepOutcome::Finished(Ok(result)) => {
                let finished_at = Utc::now();
                self.commit(&mut |record| {
                    let step = record.transition_step(&step_id, StepStatus::Completed)?;
                    step.result = Some(result.clone());
                    step.finished_at = Some(finished_at);
                    Ok(())
                })?;
                info!(instruction_id = %self.instruction_id, step_id = %step_id, duration_ms, "step completed");
                state.statuses.insert(step_id.clone(), StepStatus::Completed);
                state.results.insert(step_id.clone(), result);
                self.events.emit(RunEvent::StepFinished {
                    instruction_id: self.instruction_id.clone(),
                    step_id,
                    status: StepStatus::Completed,
                    error: None,
                    duration_ms,
                });
                Ok(())
            }
            StepOutcome::Finished(Err(failure)) => {
                warn!(
                    instruction_id = %self.instruction_id,
                    step_id = %step_id,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "step failed"
                );
                self.record_failure(&step_id, failure, None, duration_ms, state)
            }
        }
    }

    /// Fail `step_id`, fail its Pending descendants, and apply the failure policy.
    fn record_failure(
        &self,
        step_id: &str,
        failure: StepError,
        resolved_params: Option<HandlerParams>,
        duration_ms: u64,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        let descendants: Vec<String> = self
            .plan
            .descendants(step_id)
            .into_iter()
            .filter(|descendant| matches!(state.statuses.get(descendant), Some(StepStatus::Pending | StepStatus::Ready)))
            .collect();
        let upstream = StepError::new(StepErrorKind::UpstreamFailed, format!("dependency '{step_id}' failed"));
        let finished_at = Utc::now();

        self.commit(&mut |record| {
            let step = record.transition_step(step_id, StepStatus::Failed)?;
            step.error = Some(failure.clone());
            step.finished_at = Some(finished_at);
            if resolved_params.is_some() {
                step.resolved_params = resolved_params.clone();
            }
            for descendant in &descendants {
                let step = record.transition_step(descendant, StepStatus::Failed)?;
                step.error = Some(upstream.clone());
                step.finished_at = Some(finished_at);
            }
            Ok(())
        })?;

        state.statuses.insert(step_id.to_string(), StepStatus::Failed);
        if state.root_failure.is_none() {
            state.root_failure = Some((step_id.to_string(), failure.clone()));
        }
        self.events.emit(RunEvent::StepFinished {
            instruction_id: self.instruction_id.clone(),
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            error: Some(failure),
            duration_ms,
        });
        for descendant in descendants {
            debug!(instruction_id = %self.instruction_id, step_id = %descendant, upstream = %step_id, "abandoning downstream step");
            state.ready.retain(|queued| queued != &descendant);
            state.statuses.insert(descendant.clone(), StepStatus::Failed);
            self.events.emit(RunEvent::StepFinished {
                instruction_id: self.instruction_id.clone(),
                step_id: descendant,
                status: StepStatus::Failed,
                error: Some(upstream.clone()),
                duration_ms: 0,
            });
        }

        let continue_on_error = self
            .plan
            .step(step_id)
            .and_then(|step| step.definition.continue_on_error)
            .unwrap_or(self.settings.continue_on_error);
        if !continue_on_error && state.halted_by.is_none() {
            info!(instruction_id = %self.instruction_id, step_id = %step_id, "halting run after step failure");
            state.halted_by = Some(step_id.to_string());
        }
        Ok(())
    }

    /// Fail every step that never started once a fail-fast halt has drained.
    fn abort_remaining(&self, failed_step: &str, state: &mut RunState) -> Result<(), EngineError> {
        let remaining: Vec<String> = self
            .plan
            .order()
            .iter()
            .filter(|step_id| matches!(state.statuses.get(*step_id), Some(StepStatus::Pending | StepStatus::Ready)))
            .cloned()
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let aborted = StepError::new(StepErrorKind::Aborted, format!("run halted after step '{failed_step}' failed"));
        let finished_at = Utc::now();
        self.commit(&mut |record| {
            for step_id in &remaining {
                let step = record.transition_step(step_id, StepStatus::Failed)?;
                step.error = Some(aborted.clone());
                step.finished_at = Some(finished_at);
            }
            Ok(())
        })?;

        for step_id in remaining {
            state.statuses.insert(step_id.clone(), StepStatus::Failed);
            self.events.emit(RunEvent::StepFinished {
                instruction_id: self.instruction_id.clone(),
                step_id,
                status: StepStatus::Failed,
                error: Some(aborted.clone()),
                duration_ms: 0,
            });
        }
        state.ready.clear();
        Ok(())
    }

    fn outcome(&self, state: &RunState) -> SchedulerOutcome {
        if state.cancelled {
            return SchedulerOutcome::cancelled();
        }

        match &state.root_failure {
            Some((step_id, failure)) => {
                let handler = self.plan.step(step_id).map(|step| step.definition.handler.as_str()).unwrap_or_default();
                SchedulerOutcome {
                    status: RunStatus::Failed,
                    error: Some(format!("step '{step_id}' (handler '{handler}') failed: {}", failure.message)),
                }
            }
            None => SchedulerOutcome {
                status: RunStatus::Completed,
                error: None,
            },
        }
    }

    fn commit(&self, mutator: &mut dyn FnMut(&mut ExecutionRecord) -> Result<(), RecordError>) -> Result<(), EngineError> {
        let record = self.store.update(&self.instruction_id, mutator)?;
        debug!(instruction_id = %self.instruction_id, revision = record.revision, "committed step transition");
        Ok(())
    }
}
