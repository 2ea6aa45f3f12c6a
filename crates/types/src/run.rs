//! Lifecycle events and control commands exchanged with a running instruction.
//!
//! The engine emits [`RunEvent`]s over an optional Tokio channel so callers
//! (the CLI, tests) can follow progress without polling the state store, and
//! accepts [`RunControl`] commands on a per-run control channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instruction::InstructionKind;
use crate::record::{RunStatus, StepError, StepStatus};

/// Commands accepted by a running instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunControl {
    /// Stop dispatching new steps; running steps finish or time out on their own.
    Cancel,
}

/// Lifecycle events streamed while an instruction runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        instruction_id: String,
        kind: InstructionKind,
        at: DateTime<Utc>,
    },
    StepReady {
        instruction_id: String,
        step_id: String,
    },
    StepStarted {
        instruction_id: String,
        step_id: String,
        handler: String,
        started_at: DateTime<Utc>,
    },
    StepFinished {
        instruction_id: String,
        step_id: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StepError>,
        duration_ms: u64,
    },
    CancelRequested {
        instruction_id: String,
    },
    RunCompleted {
        instruction_id: String,
        status: RunStatus,
        finished_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunEvent {
    /// Identifier of the instruction the event belongs to.
    pub fn instruction_id(&self) -> &str {
        match self {
            Self::RunStarted { instruction_id, .. }
            | Self::StepReady { instruction_id, .. }
            | Self::StepStarted { instruction_id, .. }
            | Self::StepFinished { instruction_id, .. }
            | Self::CancelRequested { instruction_id }
            | Self::RunCompleted { instruction_id, .. } => instruction_id,
        }
    }
}
