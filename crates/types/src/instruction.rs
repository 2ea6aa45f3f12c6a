//! Strongly typed instruction documents shared by the validator, engine, and CLI.
//!
//! An instruction arrives as a loosely structured document (JSON or YAML). The
//! [`validation`] module is the only way to turn that raw document into a
//! [`ValidatedInstruction`], whose payload enum makes the "exactly one payload,
//! consistent with `kind`" rule unrepresentable to break.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::handler::ContractField;

pub mod validation;

/// Step identifier used when a `direct` instruction runs as a one-step workflow.
pub const DIRECT_STEP_ID: &str = "direct";

/// Enumerates the four instruction kinds understood by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    /// Invoke a single handler.
    Direct,
    /// Run a multi-step dependency graph.
    Workflow,
    /// Natural-language intent compiled into a workflow by an external planner.
    Intent,
    /// Ask an external generator for a new handler and install it.
    CapabilityRequest,
}

impl InstructionKind {
    pub const ALL: [InstructionKind; 4] = [
        InstructionKind::Direct,
        InstructionKind::Workflow,
        InstructionKind::Intent,
        InstructionKind::CapabilityRequest,
    ];

    /// Wire spelling; doubles as the name of the payload key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Workflow => "workflow",
            Self::Intent => "intent",
            Self::CapabilityRequest => "capability_request",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == text)
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Wire shape of an instruction document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InstructionDocument {
    /// Caller-chosen identifier; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Selects which payload field is populated.
    pub kind: InstructionKind,
    /// Payload for `kind: direct`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<DirectCall>,
    /// Payload for `kind: workflow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowDefinition>,
    /// Payload for `kind: intent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Payload for `kind: capability_request`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_request: Option<CapabilitySpec>,
}

/// Single handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DirectCall {
    /// Registry name of the handler to invoke.
    pub handler: String,
    /// Parameters passed to the handler.
    pub params: JsonMap<String, JsonValue>,
    /// Optional timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Multi-step workflow with explicit dependencies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Steps in authoring order; execution order is derived from `depends_on`.
    pub steps: Vec<StepDefinition>,
    /// Workflow-wide failure policy; falls back to the engine configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    /// Upper bound on concurrently running steps; falls back to the engine configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Default per-step timeout in seconds; falls back to the engine configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
}

/// One node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    /// Identifier unique within the workflow, referenced by templates and `depends_on`.
    pub step_id: String,
    /// Registry name, resolved when the step is dispatched.
    pub handler: String,
    /// Parameters; string values may embed `{{step_id.path}}` references.
    #[serde(default)]
    pub params: JsonMap<String, JsonValue>,
    /// Steps that must be Completed before this one becomes Ready.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-step timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Per-step failure policy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
}

impl StepDefinition {
    /// Convenience constructor used by tests and planners.
    pub fn new(step_id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            handler: handler.into(),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        if let JsonValue::Object(map) = params {
            self.params = map;
        }
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

/// Request to acquire a new handler at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CapabilitySpec {
    /// Handler name the capability will be registered under.
    pub name: String,
    /// What the capability should do.
    pub description: String,
    /// Parameter contract the implementation must accept.
    #[serde(default)]
    pub parameters: Vec<ContractField>,
    /// Result fields the implementation must declare.
    #[serde(default)]
    pub returns: Vec<ContractField>,
    /// Free-form guidance forwarded to the generator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

/// Kind-specific payload of a validated instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum InstructionPayload {
    Direct(DirectCall),
    Workflow(WorkflowDefinition),
    Intent(String),
    CapabilityRequest(CapabilitySpec),
}

/// Instruction that passed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedInstruction {
    /// Caller-supplied or generated identifier.
    pub id: String,
    pub payload: InstructionPayload,
}

impl ValidatedInstruction {
    pub fn kind(&self) -> InstructionKind {
        match &self.payload {
            InstructionPayload::Direct(_) => InstructionKind::Direct,
            InstructionPayload::Workflow(_) => InstructionKind::Workflow,
            InstructionPayload::Intent(_) => InstructionKind::Intent,
            InstructionPayload::CapabilityRequest(_) => InstructionKind::CapabilityRequest,
        }
    }

    /// Executable workflow for `direct` and `workflow` instructions.
    ///
    /// A direct call becomes a single step named [`DIRECT_STEP_ID`].
    pub fn executable_workflow(&self) -> Option<WorkflowDefinition> {
        match &self.payload {
            InstructionPayload::Workflow(workflow) => Some(workflow.clone()),
            InstructionPayload::Direct(call) => Some(WorkflowDefinition {
                steps: vec![StepDefinition {
                    step_id: DIRECT_STEP_ID.to_string(),
                    handler: call.handler.clone(),
                    params: call.params.clone(),
                    depends_on: Vec::new(),
                    timeout_secs: call.timeout_secs,
                    continue_on_error: None,
                }],
                ..Default::default()
            }),
            InstructionPayload::Intent(_) | InstructionPayload::CapabilityRequest(_) => None,
        }
    }

    /// Wire form, with the resolved identifier filled in.
    pub fn to_document(&self) -> InstructionDocument {
        let mut document = InstructionDocument {
            id: Some(self.id.clone()),
            kind: self.kind(),
            direct: None,
            workflow: None,
            intent: None,
            capability_request: None,
        };
        match &self.payload {
            InstructionPayload::Direct(call) => document.direct = Some(call.clone()),
            InstructionPayload::Workflow(workflow) => document.workflow = Some(workflow.clone()),
            InstructionPayload::Intent(intent) => document.intent = Some(intent.clone()),
            InstructionPayload::CapabilityRequest(spec) => document.capability_request = Some(spec.clone()),
        }
        document
    }
}

/// Generate a fresh instruction identifier.
pub fn generate_instruction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
