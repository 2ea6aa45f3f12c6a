//! Execution engine.
//!
//! [`Engine`] validates an instruction, plans it, creates its durable record,
//! and drives it on a Tokio task. Callers follow a run through the returned
//! [`RunHandle`], the optional event stream, or the state store.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cadence_engine::{Engine, HandlerRegistry};
//! use cadence_util::{EngineConfig, InMemoryRecordStore};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), cadence_engine::EngineError> {
//! let engine = Engine::new(
//!     Arc::new(HandlerRegistry::with_builtins()),
//!     Arc::new(InMemoryRecordStore::new()),
//!     EngineConfig::default(),
//! );
//! let record = engine
//!     .execute(&json!({ "kind": "direct", "direct": { "handler": "echo", "params": { "n": 1 } } }))
//!     .await?;
//! println!("{} finished as {}", record.id, record.status);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use cadence_types::{
    CapabilitySpec, CommandSpec, ExecutionRecord, HandlerDescriptor, InstalledCapability, InstructionDocument, InstructionKind,
    InstructionPayload, Provenance, RecordError, RecordFilter, RunControl, RunEvent, RunStatus, StepStatus,
    ValidatedInstruction, ValidationError, WorkflowDefinition, generate_instruction_id, validate, validate_document,
};
use cadence_util::{CapabilityStore, EngineConfig, RecordStore};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::{CapabilityGenerator, IntentPlanner};
use crate::error::EngineError;
use crate::gateway::ExtensionGateway;
use crate::handler::{Handler, HandlerRegistry};

pub mod planning;
mod scheduler;

pub use planning::{ExecutionPlan, PlannedStep};
pub use scheduler::RunSettings;

use scheduler::{Scheduler, SchedulerOutcome};

/// Optional receiver of [`RunEvent`]s; a dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink(Option<UnboundedSender<RunEvent>>);

impl EventSink {
    pub(crate) fn emit(&self, event: RunEvent) {
        if let Some(sender) = &self.0 {
            let _ = sender.send(event);
        }
    }
}

type ControlMap = Arc<Mutex<HashMap<String, UnboundedSender<RunControl>>>>;

/// What a run does once its record exists.
enum RunBody {
    Workflow { plan: ExecutionPlan, settings: RunSettings },
    Intent { intent: String, planner: Arc<dyn IntentPlanner> },
    Capability { spec: CapabilitySpec, generator: Arc<dyn CapabilityGenerator> },
}

/// Engine shared by every instruction it runs.
///
/// The registry and store are injected, so several engines (for example one
/// per test) can coexist in a process. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn RecordStore>,
    config: Arc<EngineConfig>,
    planner: Option<Arc<dyn IntentPlanner>>,
    generator: Option<Arc<dyn CapabilityGenerator>>,
    capabilities: Option<Arc<CapabilityStore>>,
    events: EventSink,
    controls: ControlMap,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("planner", &self.planner.is_some())
            .field("generator", &self.generator.is_some())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(registry: Arc<HandlerRegistry>, store: Arc<dyn RecordStore>, config: EngineConfig) -> Self {
        Self {
            registry,
            store,
            config: Arc::new(config),
            planner: None,
            generator: None,
            capabilities: None,
            events: EventSink::default(),
            controls: ControlMap::default(),
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn IntentPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn CapabilityGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Persist command capabilities installed by this engine in `store`.
    ///
    /// Call [`Engine::restore_capabilities`] to reinstall what earlier
    /// processes left there.
    pub fn with_capability_store(mut self, store: Arc<CapabilityStore>) -> Self {
        self.capabilities = Some(store);
        self
    }

    /// Stream lifecycle events of every run to `sender`.
    pub fn with_event_sink(mut self, sender: UnboundedSender<RunEvent>) -> Self {
        self.events = EventSink(Some(sender));
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gateway installing into this engine's registry.
    pub fn gateway(&self) -> ExtensionGateway {
        ExtensionGateway::new(Arc::clone(&self.registry))
    }

    /// Register a handler alongside the built-ins; existing names are refused.
    pub fn register_handler(&self, descriptor: HandlerDescriptor, handler: Arc<dyn Handler>) -> Result<(), EngineError> {
        Ok(self.registry.register(descriptor, handler, false)?)
    }

    /// Reinstall every capability in the capability store.
    ///
    /// Entries the gateway rejects (for example a name now taken) are logged
    /// and skipped. Returns the descriptors that were installed.
    pub fn restore_capabilities(&self) -> Result<Vec<HandlerDescriptor>, EngineError> {
        let Some(store) = &self.capabilities else {
            return Ok(Vec::new());
        };
        let gateway = self.gateway();
        let mut restored = Vec::new();
        for installed in store.load_all()? {
            match gateway.reinstall(&installed) {
                Ok(descriptor) => restored.push(descriptor),
                Err(rejection) => {
                    warn!(capability = %installed.name(), error = %rejection, "skipping persisted capability");
                }
            }
        }
        debug!(restored = restored.len(), "restored installed capabilities");
        Ok(restored)
    }

    /// Validate, plan, and start `raw`.
    ///
    /// Validation and planning errors are returned before any record is
    /// created. Must be called from within a Tokio runtime.
    pub fn submit(&self, raw: &Value) -> Result<RunHandle, EngineError> {
        let instruction = validate(raw)?;
        self.start(instruction, None)
    }

    /// Submit `raw` and wait for its final record.
    pub async fn execute(&self, raw: &Value) -> Result<ExecutionRecord, EngineError> {
        self.submit(raw)?.wait().await
    }

    /// Ask a run to stop dispatching new steps.
    ///
    /// Returns `false` when the run exists but is no longer in flight.
    pub fn cancel(&self, id: &str) -> Result<bool, EngineError> {
        let sender = self.controls.lock().expect("run control lock poisoned").get(id).cloned();
        match sender {
            Some(sender) => {
                info!(instruction_id = %id, "cancellation requested");
                Ok(sender.send(RunControl::Cancel).is_ok())
            }
            None => {
                self.store.get(id)?;
                Ok(false)
            }
        }
    }

    /// Start a new run for a Failed or Cancelled record.
    ///
    /// Steps that Completed in the original run keep their results and are
    /// not re-run. An intent run reuses the workflow its planner produced.
    pub fn retry(&self, id: &str) -> Result<RunHandle, EngineError> {
        self.ensure_idle(id)?;
        let original = self.store.get(id)?;
        if !matches!(original.status, RunStatus::Failed | RunStatus::Cancelled) {
            return Err(EngineError::NotRetryable {
                id: id.to_string(),
                status: original.status,
            });
        }
        let Some(mut document) = original.instruction.clone() else {
            return Err(ValidationError::single("instruction", "record does not carry its instruction document").into());
        };
        document.id = Some(generate_instruction_id());
        let instruction = validate_document(&document)?;
        info!(instruction_id = %instruction.id, retry_of = %id, "retrying run");
        self.start(instruction, Some(original))
    }

    pub fn status(&self, id: &str) -> Result<ExecutionRecord, EngineError> {
        Ok(self.store.get(id)?)
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>, EngineError> {
        Ok(self.store.list(filter)?)
    }

    /// Revert a record to its previous snapshot. Refused while the run is in flight.
    pub fn rollback(&self, id: &str) -> Result<ExecutionRecord, EngineError> {
        self.ensure_idle(id)?;
        let record = self.store.rollback(id)?;
        info!(instruction_id = %id, revision = record.revision, status = %record.status, "rolled back record");
        Ok(record)
    }

    fn ensure_idle(&self, id: &str) -> Result<(), EngineError> {
        if self.controls.lock().expect("run control lock poisoned").contains_key(id) {
            return Err(EngineError::RunInProgress { id: id.to_string() });
        }
        Ok(())
    }

    fn start(&self, instruction: ValidatedInstruction, retry_of: Option<ExecutionRecord>) -> Result<RunHandle, EngineError> {
        let mut record = ExecutionRecord::new(instruction.id.clone(), instruction.kind());
        record.instruction = Some(instruction.to_document());

        let replanned = retry_of.as_ref().and_then(|original| original.planned_workflow.clone());
        let body = match (&instruction.payload, replanned) {
            (InstructionPayload::Intent(_), Some(workflow)) => {
                let body = self.workflow_body(&workflow, &mut record)?;
                record.planned_workflow = Some(workflow);
                body
            }
            (InstructionPayload::Direct(_) | InstructionPayload::Workflow(_), _) => {
                let workflow = instruction.executable_workflow().ok_or_else(|| {
                    ValidationError::single(instruction.kind().as_str(), "instruction has no executable workflow")
                })?;
                self.workflow_body(&workflow, &mut record)?
            }
            (InstructionPayload::Intent(intent), None) => RunBody::Intent {
                intent: intent.clone(),
                planner: self
                    .planner
                    .clone()
                    .ok_or(EngineError::CollaboratorUnavailable { collaborator: "intent planner" })?,
            },
            (InstructionPayload::CapabilityRequest(spec), _) => RunBody::Capability {
                spec: spec.clone(),
                generator: self
                    .generator
                    .clone()
                    .ok_or(EngineError::CollaboratorUnavailable { collaborator: "capability generator" })?,
            },
        };

        if let Some(original) = &retry_of {
            record.retry_of = Some(original.id.clone());
            if let RunBody::Workflow { plan, .. } = &body {
                carry_over_completed_steps(original, plan, &mut record);
            }
        }

        let record = self.store.create(record)?;
        let id = record.id.clone();
        info!(instruction_id = %id, kind = %record.kind, steps = record.steps.len(), "accepted instruction");

        let (control_tx, control_rx) = unbounded_channel();
        self.controls
            .lock()
            .expect("run control lock poisoned")
            .insert(id.clone(), control_tx.clone());

        let engine = self.clone();
        let task = tokio::spawn(async move {
            let run_id = record.id.clone();
            let result = engine.drive(record, body, control_rx).await;
            engine.controls.lock().expect("run control lock poisoned").remove(&run_id);
            result
        });

        Ok(RunHandle {
            id,
            control: control_tx,
            task,
        })
    }

    fn workflow_body(&self, workflow: &WorkflowDefinition, record: &mut ExecutionRecord) -> Result<RunBody, EngineError> {
        let plan = ExecutionPlan::build(workflow)?;
        record.seed_steps(plan.order().iter().map(String::as_str), workflow);
        Ok(RunBody::Workflow {
            settings: RunSettings::resolve(&self.config, workflow),
            plan,
        })
    }

    async fn drive(
        &self,
        record: ExecutionRecord,
        body: RunBody,
        mut control_rx: UnboundedReceiver<RunControl>,
    ) -> Result<ExecutionRecord, EngineError> {
        let id = record.id.clone();
        let outcome = match self.mark_running(&record) {
            Ok(running) => match body {
                RunBody::Workflow { plan, settings } => self.schedule(&running, plan, settings, &mut control_rx).await,
                RunBody::Intent { intent, planner } => {
                    self.run_intent(&running, &intent, planner.as_ref(), &mut control_rx).await
                }
                RunBody::Capability { spec, generator } => {
                    self.run_capability(&id, &spec, generator.as_ref(), &mut control_rx).await
                }
            },
            Err(error) => Err(error),
        };

        match outcome {
            Ok(outcome) => self.finalize(&id, outcome),
            Err(error) => {
                warn!(instruction_id = %id, error = %error, "run failed before completing");
                let failed = SchedulerOutcome {
                    status: RunStatus::Failed,
                    error: Some(error.to_string()),
                };
                if let Err(commit_error) = self.finalize(&id, failed) {
                    warn!(instruction_id = %id, error = %commit_error, "failed to record run failure");
                }
                Err(error)
            }
        }
    }

    fn mark_running(&self, record: &ExecutionRecord) -> Result<ExecutionRecord, EngineError> {
        let started_at = Utc::now();
        let running = self.commit(&record.id, &mut |record| {
            record.set_status(RunStatus::Running)?;
            record.started_at = Some(started_at);
            Ok(())
        })?;
        info!(instruction_id = %running.id, kind = %running.kind, revision = running.revision, "run started");
        self.events.emit(RunEvent::RunStarted {
            instruction_id: running.id.clone(),
            kind: running.kind,
            at: started_at,
        });
        Ok(running)
    }

    async fn schedule(
        &self,
        record: &ExecutionRecord,
        plan: ExecutionPlan,
        settings: RunSettings,
        control_rx: &mut UnboundedReceiver<RunControl>,
    ) -> Result<SchedulerOutcome, EngineError> {
        debug!(
            instruction_id = %record.id,
            steps = plan.len(),
            carried_over = record.count_steps(StepStatus::Completed),
            max_concurrency = settings.max_concurrency,
            "scheduling workflow"
        );
        Scheduler::new(
            record.id.clone(),
            plan,
            settings,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.events.clone(),
        )
        .run(record, control_rx)
        .await
    }

    async fn run_intent(
        &self,
        record: &ExecutionRecord,
        intent: &str,
        planner: &dyn IntentPlanner,
        control_rx: &mut UnboundedReceiver<RunControl>,
    ) -> Result<SchedulerOutcome, EngineError> {
        info!(instruction_id = %record.id, "planning intent");
        let Some(planned) = self.until_cancelled(&record.id, control_rx, planner.plan(intent)).await else {
            return Ok(SchedulerOutcome::cancelled());
        };
        let workflow = planned.map_err(|source| EngineError::Planning { source })?;

        validate_document(&InstructionDocument {
            id: Some(record.id.clone()),
            kind: InstructionKind::Workflow,
            direct: None,
            workflow: Some(workflow.clone()),
            intent: None,
            capability_request: None,
        })?;
        let plan = ExecutionPlan::build(&workflow)?;
        let settings = RunSettings::resolve(&self.config, &workflow);

        let planned_record = self.commit(&record.id, &mut |record| {
            record.planned_workflow = Some(workflow.clone());
            record.seed_steps(plan.order().iter().map(String::as_str), &workflow);
            Ok(())
        })?;
        info!(instruction_id = %record.id, steps = plan.len(), "intent planned");
        self.schedule(&planned_record, plan, settings, control_rx).await
    }

    async fn run_capability(
        &self,
        id: &str,
        spec: &CapabilitySpec,
        generator: &dyn CapabilityGenerator,
        control_rx: &mut UnboundedReceiver<RunControl>,
    ) -> Result<SchedulerOutcome, EngineError> {
        info!(instruction_id = %id, capability = %spec.name, "generating capability");
        let Some(generated) = self.until_cancelled(id, control_rx, generator.generate(spec)).await else {
            return Ok(SchedulerOutcome::cancelled());
        };
        let implementation = generated.map_err(|source| EngineError::Generation { source })?;
        let command = implementation.command.clone();
        let descriptor = self.gateway().install_capability(spec, implementation)?;
        if let (Some(store), Some(command)) = (&self.capabilities, command) {
            self.persist_capability(store, spec, command, &descriptor)?;
        }
        self.commit(id, &mut |record| {
            record.installed_handler = Some(descriptor.clone());
            Ok(())
        })?;
        Ok(SchedulerOutcome {
            status: RunStatus::Completed,
            error: None,
        })
    }

    fn persist_capability(
        &self,
        store: &CapabilityStore,
        spec: &CapabilitySpec,
        command: CommandSpec,
        descriptor: &HandlerDescriptor,
    ) -> Result<(), EngineError> {
        let installed_at = match &descriptor.provenance {
            Provenance::Installed { installed_at, .. } => *installed_at,
            Provenance::Builtin => Utc::now(),
        };
        let installed = InstalledCapability {
            spec: spec.clone(),
            command,
            parameters: descriptor.parameters.clone(),
            returns: descriptor.returns.clone(),
            concurrency_safe: descriptor.concurrency_safe,
            installed_at,
        };
        if let Err(error) = store.save(&installed) {
            // An install that cannot be persisted is undone.
            if let Err(deregister_error) = self.registry.deregister(&descriptor.name) {
                warn!(handler = %descriptor.name, error = %deregister_error, "failed to undo unpersisted install");
            }
            return Err(error.into());
        }
        info!(handler = %descriptor.name, program = %installed.command.program, "persisted installed capability");
        Ok(())
    }

    /// Await `future` unless a cancel command arrives first.
    async fn until_cancelled<T>(
        &self,
        id: &str,
        control_rx: &mut UnboundedReceiver<RunControl>,
        future: impl Future<Output = T>,
    ) -> Option<T> {
        tokio::select! {
            output = future => Some(output),
            () = next_cancel(control_rx) => {
                info!(instruction_id = %id, "cancelled while waiting on collaborator");
                self.events.emit(RunEvent::CancelRequested { instruction_id: id.to_string() });
                None
            }
        }
    }

    fn finalize(&self, id: &str, outcome: SchedulerOutcome) -> Result<ExecutionRecord, EngineError> {
        let finished_at = Utc::now();
        let record = self.commit(id, &mut |record| {
            record.set_status(outcome.status)?;
            record.finished_at = Some(finished_at);
            record.error = outcome.error.clone();
            Ok(())
        })?;
        info!(
            instruction_id = %id,
            status = %record.status,
            revision = record.revision,
            completed = record.count_steps(StepStatus::Completed),
            failed = record.count_steps(StepStatus::Failed),
            "run finished"
        );
        self.events.emit(RunEvent::RunCompleted {
            instruction_id: id.to_string(),
            status: record.status,
            finished_at,
            error: record.error.clone(),
        });
        Ok(record)
    }

    fn commit(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut ExecutionRecord) -> Result<(), RecordError>,
    ) -> Result<ExecutionRecord, EngineError> {
        Ok(self.store.update(id, mutator)?)
    }
}

/// Resolves once a cancel command is received; never resolves if the channel closes.
async fn next_cancel(control_rx: &mut UnboundedReceiver<RunControl>) {
    while let Some(command) = control_rx.recv().await {
        match command {
            RunControl::Cancel => return,
        }
    }
    std::future::pending::<()>().await;
}

/// Copy Completed steps of `original` into `record`.
///
/// A step is carried over only when its handler is unchanged and every one of
/// its ancestors was carried over too, so no kept result depends on a step
/// that will run again.
fn carry_over_completed_steps(original: &ExecutionRecord, plan: &ExecutionPlan, record: &mut ExecutionRecord) {
    let mut carried: HashSet<&str> = HashSet::new();
    for step_id in plan.order() {
        let (Some(planned), Some(previous)) = (plan.step(step_id), original.steps.get(step_id)) else {
            continue;
        };
        if previous.status != StepStatus::Completed
            || !planned.ancestors.iter().all(|ancestor| carried.contains(ancestor.as_str()))
        {
            continue;
        }
        if let Some(step) = record.steps.get_mut(step_id)
            && step.handler == previous.handler
        {
            *step = previous.clone();
            carried.insert(step_id.as_str());
        }
    }
}

/// Handle to a submitted run.
#[derive(Debug)]
pub struct RunHandle {
    id: String,
    control: UnboundedSender<RunControl>,
    task: JoinHandle<Result<ExecutionRecord, EngineError>>,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation; `false` once the run has finished.
    pub fn cancel(&self) -> bool {
        self.control.send(RunControl::Cancel).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish and return its final record.
    pub async fn wait(self) -> Result<ExecutionRecord, EngineError> {
        match self.task.await {
            Ok(result) => result,
            Err(source) => Err(EngineError::RunTask { id: self.id, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::StepErrorKind;
    use cadence_util::InMemoryRecordStore;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(
            Arc::new(HandlerRegistry::with_builtins()),
            Arc::new(InMemoryRecordStore::new()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn direct_instruction_runs_as_a_single_step() {
        let record = engine()
            .execute(&json!({ "id": "hello", "kind": "direct", "direct": { "handler": "echo", "params": { "n": 7 } } }))
            .await
            .expect("run");

        assert_eq!(record.status, RunStatus::Completed);
        let step = record.step("direct").expect("direct step");
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.result.as_ref().and_then(|result| result.get("n")), Some(&json!(7)));
        assert!(record.started_at.is_some() && record.finished_at.is_some());
    }

    #[tokio::test]
    async fn invalid_instruction_never_creates_a_record() {
        let engine = engine();
        let error = engine
            .submit(&json!({ "id": "broken", "kind": "workflow", "workflow": { "steps": [] } }))
            .expect_err("invalid");
        assert!(matches!(error, EngineError::Validation(_)));
        assert!(matches!(engine.status("broken"), Err(EngineError::Store(_))));
    }

    #[tokio::test]
    async fn intent_without_planner_is_unavailable() {
        let error = engine()
            .submit(&json!({ "kind": "intent", "intent": "tidy the downloads folder" }))
            .expect_err("no planner");
        assert!(matches!(error, EngineError::CollaboratorUnavailable { collaborator: "intent planner" }));
    }

    #[tokio::test]
    async fn unknown_handler_fails_the_step_and_the_run() {
        let record = engine()
            .execute(&json!({ "kind": "direct", "direct": { "handler": "nope", "params": {} } }))
            .await
            .expect("run");
        assert_eq!(record.status, RunStatus::Failed);
        let error = record.step("direct").and_then(|step| step.error.clone()).expect("step error");
        assert_eq!(error.kind, StepErrorKind::HandlerNotFound);
        assert!(record.error.as_deref().unwrap_or_default().contains("handler 'nope'"));
    }

    #[tokio::test]
    async fn completed_runs_are_not_retryable_and_cancel_reports_idle() {
        let engine = engine();
        let record = engine
            .execute(&json!({ "id": "done", "kind": "direct", "direct": { "handler": "echo", "params": {} } }))
            .await
            .expect("run");
        assert_eq!(record.status, RunStatus::Completed);

        assert!(matches!(engine.retry("done"), Err(EngineError::NotRetryable { status: RunStatus::Completed, .. })));
        assert!(!engine.cancel("done").expect("known id"));
        assert!(engine.cancel("missing").is_err());
    }

    #[test]
    fn carry_over_skips_changed_handlers_and_their_dependents() {
        use cadence_types::StepDefinition;

        let workflow = WorkflowDefinition {
            steps: vec![
                StepDefinition::new("a", "echo"),
                StepDefinition::new("b", "sleep"),
                StepDefinition::new("c", "echo").depends_on(["b"]),
                StepDefinition::new("d", "echo").depends_on(["a"]),
            ],
            ..Default::default()
        };
        let order = ["a", "b", "c", "d"];
        let mut original = ExecutionRecord::new("first", InstructionKind::Workflow);
        original.seed_steps(order, &workflow);
        for step_id in order {
            original.transition_step(step_id, StepStatus::Ready).expect("ready");
            original.transition_step(step_id, StepStatus::Running).expect("running");
            original.transition_step(step_id, StepStatus::Completed).expect("completed").result = Some(Default::default());
        }

        let mut changed = workflow.clone();
        changed.steps[1].handler = "echo".into();
        let plan = ExecutionPlan::build(&changed).expect("plan");
        let mut retried = ExecutionRecord::new("second", InstructionKind::Workflow);
        retried.seed_steps(plan.order().iter().map(String::as_str), &changed);
        carry_over_completed_steps(&original, &plan, &mut retried);

        let status = |step_id: &str| retried.step(step_id).map(|step| step.status);
        assert_eq!(status("a"), Some(StepStatus::Completed));
        assert_eq!(status("d"), Some(StepStatus::Completed));
        assert_eq!(status("b"), Some(StepStatus::Pending));
        assert_eq!(status("c"), Some(StepStatus::Pending), "c depends on the re-run step b");
    }

    #[test]
    fn register_handler_refuses_existing_and_invalid_names() {
        let engine = engine();
        let handler: Arc<dyn Handler> = Arc::new(crate::handler::handler_fn(|params| async move { Ok(params) }));
        let error = engine
            .register_handler(cadence_types::HandlerDescriptor::builtin("echo", vec![], vec![]), handler)
            .expect_err("duplicate");
        assert!(matches!(error, EngineError::DuplicateHandler { ref name } if name == "echo"));

        let handler: Arc<dyn Handler> = Arc::new(crate::handler::handler_fn(|params| async move { Ok(params) }));
        let error = engine
            .register_handler(cadence_types::HandlerDescriptor::builtin("no spaces", vec![], vec![]), handler)
            .expect_err("invalid name");
        assert!(matches!(error, EngineError::InvalidHandlerName { .. }));
    }
}
