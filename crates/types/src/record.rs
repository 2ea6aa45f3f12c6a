//! Durable execution records.
//!
//! An [`ExecutionRecord`] is the queryable run state of one instruction. The
//! engine is its only writer; every mutation goes through the state store and
//! bumps `revision`. Step transitions are checked here so that terminal states
//! stay immutable no matter which code path writes the record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::handler::HandlerDescriptor;
use crate::instruction::{InstructionDocument, InstructionKind, WorkflowDefinition};

/// Overall status of an instruction run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Lifecycle state of a single step.
///
/// `Pending → Ready → Running → {Completed, Failed}`. A step that is abandoned
/// before dispatch (failed dependency, fail-fast abort, unresolvable template)
/// moves straight to `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Ready)
                | (Self::Pending, Self::Failed)
                | (Self::Ready, Self::Running)
                | (Self::Ready, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Category of a per-step failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    TemplateResolution,
    HandlerNotFound,
    HandlerExecution,
    Timeout,
    /// A dependency failed, so the step was never dispatched.
    UpstreamFailed,
    /// Fail-fast halted the run before the step was dispatched.
    Aborted,
}

/// Persisted failure detail of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Run state of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    /// Handler name the step was declared with.
    pub handler: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    /// Result mapping returned by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Parameters after template resolution, kept for diagnosis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_params: Option<JsonMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(handler: impl Into<String>, depends_on: Vec<String>) -> Self {
        Self {
            handler: handler.into(),
            depends_on,
            status: StepStatus::Pending,
            result: None,
            error: None,
            resolved_params: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Errors raised by record mutations that would break the step lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has no step '{step_id}'")]
    UnknownStep { step_id: String },

    #[error("step '{step_id}' cannot move from {from} to {to}")]
    InvalidTransition { step_id: String, from: StepStatus, to: StepStatus },

    #[error("run cannot move from terminal status {from} to {to}")]
    RunAlreadyTerminal { from: RunStatus, to: RunStatus },
}

/// Durable run record for an instruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: String,
    pub kind: InstructionKind,
    pub status: RunStatus,
    /// Per-step state in planning order.
    #[serde(default)]
    pub steps: IndexMap<String, StepRecord>,
    /// Monotonic revision, bumped on every stored write.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Instruction-level failure summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submitted document, kept so a run can be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<InstructionDocument>,
    /// Workflow obtained from the intent planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_workflow: Option<WorkflowDefinition>,
    /// Handler installed by a capability request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_handler: Option<HandlerDescriptor>,
    /// Record this run retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

impl ExecutionRecord {
    /// Fresh pending record with no steps; revision 0 until first stored.
    pub fn new(id: impl Into<String>, kind: InstructionKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: RunStatus::Pending,
            steps: IndexMap::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            instruction: None,
            planned_workflow: None,
            installed_handler: None,
            retry_of: None,
        }
    }

    /// Add Pending entries for every step of `workflow`, in the given order.
    pub fn seed_steps<'a, I>(&mut self, step_order: I, workflow: &WorkflowDefinition)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for step_id in step_order {
            if let Some(step) = workflow.steps.iter().find(|step| step.step_id == step_id) {
                self.steps
                    .insert(step.step_id.clone(), StepRecord::pending(step.handler.clone(), step.depends_on.clone()));
            }
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id)
    }

    /// Apply a lifecycle transition to a step, rejecting moves the lifecycle forbids.
    pub fn transition_step(&mut self, step_id: &str, next: StepStatus) -> Result<&mut StepRecord, RecordError> {
        let step = self.steps.get_mut(step_id).ok_or_else(|| RecordError::UnknownStep {
            step_id: step_id.to_string(),
        })?;
        if !step.status.can_transition_to(next) {
            return Err(RecordError::InvalidTransition {
                step_id: step_id.to_string(),
                from: step.status,
                to: next,
            });
        }
        step.status = next;
        Ok(step)
    }

    /// Move the run to `next`; terminal run statuses are final.
    pub fn set_status(&mut self, next: RunStatus) -> Result<(), RecordError> {
        if self.status.is_terminal() && self.status != next {
            return Err(RecordError::RunAlreadyTerminal {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Number of steps currently in `status`.
    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|step| step.status == status).count()
    }
}

/// Filter for record listings; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub status: Option<RunStatus>,
    pub kind: Option<InstructionKind>,
}

impl RecordFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.status.is_none_or(|status| record.status == status) && self.kind.is_none_or(|kind| record.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::StepDefinition;

    fn two_step_record() -> ExecutionRecord {
        let workflow = WorkflowDefinition {
            steps: vec![StepDefinition::new("a", "echo"), StepDefinition::new("b", "echo").depends_on(["a"])],
            ..Default::default()
        };
        let mut record = ExecutionRecord::new("run", InstructionKind::Workflow);
        record.seed_steps(["a", "b"], &workflow);
        record
    }

    #[test]
    fn terminal_step_states_are_immutable() {
        let mut record = two_step_record();
        record.transition_step("a", StepStatus::Ready).expect("pending -> ready");
        record.transition_step("a", StepStatus::Running).expect("ready -> running");
        record.transition_step("a", StepStatus::Completed).expect("running -> completed");

        let error = record.transition_step("a", StepStatus::Failed).expect_err("completed is terminal");
        assert_eq!(
            error,
            RecordError::InvalidTransition {
                step_id: "a".into(),
                from: StepStatus::Completed,
                to: StepStatus::Failed
            }
        );
    }

    #[test]
    fn pending_cannot_skip_to_running() {
        let mut record = two_step_record();
        assert!(record.transition_step("b", StepStatus::Running).is_err());
        assert!(record.transition_step("missing", StepStatus::Ready).is_err());
    }

    #[test]
    fn run_status_is_final_once_terminal() {
        let mut record = two_step_record();
        record.set_status(RunStatus::Running).expect("pending -> running");
        record.set_status(RunStatus::Cancelled).expect("running -> cancelled");
        assert!(record.set_status(RunStatus::Completed).is_err());
        record.set_status(RunStatus::Cancelled).expect("same terminal status is a no-op");
    }

    #[test]
    fn filter_matches_on_status_and_kind() {
        let record = two_step_record();
        assert!(RecordFilter::default().matches(&record));
        assert!(
            RecordFilter {
                status: Some(RunStatus::Pending),
                kind: Some(InstructionKind::Workflow)
            }
            .matches(&record)
        );
        assert!(
            !RecordFilter {
                status: Some(RunStatus::Failed),
                kind: None
            }
            .matches(&record)
        );
    }

    #[test]
    fn run_status_parses_both_spellings_of_cancelled() {
        assert_eq!("canceled".parse::<RunStatus>(), Ok(RunStatus::Cancelled));
        assert_eq!("Completed".parse::<RunStatus>(), Ok(RunStatus::Completed));
        assert!("paused".parse::<RunStatus>().is_err());
    }
}
