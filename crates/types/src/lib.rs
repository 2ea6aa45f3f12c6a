//! # Cadence Types
//!
//! Plain data shared by every Cadence crate:
//!
//! - **`instruction`**: the instruction document model and its schema validator
//! - **`record`**: durable execution records and step lifecycle rules
//! - **`handler`**: handler descriptors, provenance, and parameter/return contracts
//! - **`run`**: lifecycle events and control commands for in-flight runs
//!
//! Nothing in this crate performs I/O.

pub mod handler;
pub mod instruction;
pub mod record;
pub mod run;

pub use handler::{
    CommandSpec, ContractField, FieldType, HandlerDescriptor, InstalledCapability, Provenance, is_valid_handler_name,
};
pub use instruction::validation::{ValidationError, Violation, is_valid_instruction_id, is_valid_step_id, validate, validate_document};
pub use instruction::{
    CapabilitySpec, DIRECT_STEP_ID, DirectCall, InstructionDocument, InstructionKind, InstructionPayload, StepDefinition,
    ValidatedInstruction, WorkflowDefinition, generate_instruction_id,
};
pub use record::{ExecutionRecord, RecordError, RecordFilter, RunStatus, StepError, StepErrorKind, StepRecord, StepStatus};
pub use run::{RunControl, RunEvent};
