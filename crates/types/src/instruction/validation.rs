//! Schema validation for raw instruction documents.
//!
//! [`validate`] is a pure function over a JSON value. It walks the whole
//! document and reports every violation it finds, in document order, so that
//! validating the same input twice always yields the same error set. Only when
//! the document is clean is it deserialized into typed structures.

use std::collections::HashSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

use super::{InstructionDocument, InstructionKind, InstructionPayload, ValidatedInstruction, generate_instruction_id};
use crate::handler::{FieldType, is_valid_handler_name};

static INSTRUCTION_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("instruction id regex should compile"));
static STEP_ID_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("step id regex should compile"));

const TOP_LEVEL_FIELDS: [&str; 6] = ["id", "kind", "direct", "workflow", "intent", "capability_request"];
const DIRECT_FIELDS: [&str; 3] = ["handler", "params", "timeout_secs"];
const WORKFLOW_FIELDS: [&str; 4] = ["steps", "continue_on_error", "max_concurrency", "step_timeout_secs"];
const STEP_FIELDS: [&str; 6] = ["step_id", "handler", "params", "depends_on", "timeout_secs", "continue_on_error"];
const CAPABILITY_FIELDS: [&str; 5] = ["name", "description", "parameters", "returns", "guidance"];
const CONTRACT_FIELD_FIELDS: [&str; 3] = ["name", "type", "required"];

/// A single schema violation located by a dotted/indexed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Location inside the document, for example `workflow.steps[2].depends_on[0]`.
    pub path: String,
    /// What is wrong at that location.
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every violation found in a document. Never partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("instruction is invalid: {}", join_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Build an error holding exactly one violation.
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            violations: vec![Violation::new(path, message)],
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Returns true when `id` is acceptable as an instruction identifier.
pub fn is_valid_instruction_id(id: &str) -> bool {
    INSTRUCTION_ID_REGEX.is_match(id)
}

/// Returns true when `step_id` is acceptable as a workflow step identifier.
pub fn is_valid_step_id(step_id: &str) -> bool {
    STEP_ID_REGEX.is_match(step_id)
}

/// Validate a raw instruction document.
///
/// Checks required top-level fields, the `kind` enumeration, kind-specific
/// requirements, and that every `depends_on` entry names a step declared in
/// the same document. Returns all violations rather than stopping at the first.
pub fn validate(raw: &Value) -> Result<ValidatedInstruction, ValidationError> {
    let Some(object) = raw.as_object() else {
        return Err(ValidationError::single("$", "instruction must be an object"));
    };

    let mut collector = ViolationCollector::default();
    collector.unknown_fields("", object, &TOP_LEVEL_FIELDS);

    if let Some(id) = object.get("id") {
        match id.as_str() {
            Some(text) if is_valid_instruction_id(text) => {}
            Some(_) => collector.push("id", "must match ^[A-Za-z0-9][A-Za-z0-9._-]*$"),
            None => collector.push("id", "must be a string"),
        }
    }

    let kind = match object.get("kind") {
        None => {
            collector.push("kind", "is required");
            None
        }
        Some(Value::String(text)) => {
            let parsed = InstructionKind::parse(text);
            if parsed.is_none() {
                collector.push("kind", format!("'{text}' is not one of direct, workflow, intent, capability_request"));
            }
            parsed
        }
        Some(_) => {
            collector.push("kind", "must be a string");
            None
        }
    };

    if let Some(kind) = kind {
        for other in InstructionKind::ALL.into_iter().filter(|other| *other != kind) {
            if object.contains_key(other.as_str()) {
                collector.push(other.as_str(), format!("payload does not match kind '{kind}'"));
            }
        }

        match object.get(kind.as_str()) {
            None => collector.push(kind.as_str(), format!("is required for kind '{kind}'")),
            Some(payload) => match kind {
                InstructionKind::Direct => check_direct(payload, &mut collector),
                InstructionKind::Workflow => check_workflow(payload, &mut collector),
                InstructionKind::Intent => check_intent(payload, &mut collector),
                InstructionKind::CapabilityRequest => check_capability_request(payload, &mut collector),
            },
        }
    }

    collector.finish()?;

    let document: InstructionDocument =
        serde_json::from_value(raw.clone()).map_err(|error| ValidationError::single("$", error.to_string()))?;
    into_validated(document)
}

/// Validate an already typed document by round-tripping it through the raw checks.
pub fn validate_document(document: &InstructionDocument) -> Result<ValidatedInstruction, ValidationError> {
    let raw = serde_json::to_value(document).map_err(|error| ValidationError::single("$", error.to_string()))?;
    validate(&raw)
}

fn into_validated(document: InstructionDocument) -> Result<ValidatedInstruction, ValidationError> {
    let kind = document.kind;
    let payload = match kind {
        InstructionKind::Direct => document.direct.map(InstructionPayload::Direct),
        InstructionKind::Workflow => document.workflow.map(InstructionPayload::Workflow),
        InstructionKind::Intent => document.intent.map(InstructionPayload::Intent),
        InstructionKind::CapabilityRequest => document.capability_request.map(InstructionPayload::CapabilityRequest),
    }
    .ok_or_else(|| ValidationError::single(kind.as_str(), format!("is required for kind '{kind}'")))?;

    Ok(ValidatedInstruction {
        id: document.id.unwrap_or_else(generate_instruction_id),
        payload,
    })
}

fn check_direct(payload: &Value, collector: &mut ViolationCollector) {
    let Some(object) = collector.object("direct", payload) else {
        return;
    };
    collector.unknown_fields("direct", object, &DIRECT_FIELDS);
    collector.handler_name("direct.handler", object.get("handler"));
    match object.get("params") {
        None => collector.push("direct.params", "is required"),
        Some(params) if !params.is_object() => collector.push("direct.params", "must be an object"),
        Some(_) => {}
    }
    collector.optional_positive_integer("direct.timeout_secs", object.get("timeout_secs"));
}

fn check_intent(payload: &Value, collector: &mut ViolationCollector) {
    match payload.as_str() {
        Some(text) if !text.trim().is_empty() => {}
        Some(_) => collector.push("intent", "must not be empty"),
        None => collector.push("intent", "must be a string"),
    }
}

fn check_workflow(payload: &Value, collector: &mut ViolationCollector) {
    let Some(object) = collector.object("workflow", payload) else {
        return;
    };
    collector.unknown_fields("workflow", object, &WORKFLOW_FIELDS);
    collector.optional_bool("workflow.continue_on_error", object.get("continue_on_error"));
    collector.optional_positive_integer("workflow.max_concurrency", object.get("max_concurrency"));
    collector.optional_positive_integer("workflow.step_timeout_secs", object.get("step_timeout_secs"));

    let steps = match object.get("steps") {
        None => {
            collector.push("workflow.steps", "is required");
            return;
        }
        Some(Value::Array(steps)) if steps.is_empty() => {
            collector.push("workflow.steps", "must contain at least one step");
            return;
        }
        Some(Value::Array(steps)) => steps,
        Some(_) => {
            collector.push("workflow.steps", "must be an array");
            return;
        }
    };

    // Declared identifiers are collected up front so forward references in
    // `depends_on` are judged against the whole document.
    let mut declared = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        if let Some(step_id) = step.get("step_id").and_then(Value::as_str)
            && !declared.insert(step_id)
        {
            collector.push(format!("workflow.steps[{index}].step_id"), format!("duplicate step_id '{step_id}'"));
        }
    }

    for (index, step) in steps.iter().enumerate() {
        check_step(index, step, &declared, collector);
    }
}

fn check_step(index: usize, step: &Value, declared: &HashSet<&str>, collector: &mut ViolationCollector) {
    let base = format!("workflow.steps[{index}]");
    let Some(object) = collector.object(&base, step) else {
        return;
    };
    collector.unknown_fields(&base, object, &STEP_FIELDS);

    let step_id = match object.get("step_id") {
        None => {
            collector.push(format!("{base}.step_id"), "is required");
            None
        }
        Some(Value::String(text)) if is_valid_step_id(text) => Some(text.as_str()),
        Some(Value::String(_)) => {
            collector.push(format!("{base}.step_id"), "must match ^[A-Za-z0-9_-]+$");
            None
        }
        Some(_) => {
            collector.push(format!("{base}.step_id"), "must be a string");
            None
        }
    };

    collector.handler_name(&format!("{base}.handler"), object.get("handler"));

    if let Some(params) = object.get("params")
        && !params.is_object()
    {
        collector.push(format!("{base}.params"), "must be an object");
    }

    match object.get("depends_on") {
        None => {}
        Some(Value::Array(dependencies)) => {
            for (dependency_index, dependency) in dependencies.iter().enumerate() {
                let path = format!("{base}.depends_on[{dependency_index}]");
                match dependency.as_str() {
                    Some(name) if Some(name) == step_id => collector.push(path, "a step cannot depend on itself"),
                    Some(name) if !declared.contains(name) => collector.push(path, format!("references undeclared step '{name}'")),
                    Some(_) => {}
                    None => collector.push(path, "must be a string"),
                }
            }
        }
        Some(_) => collector.push(format!("{base}.depends_on"), "must be an array of step ids"),
    }

    collector.optional_positive_integer(&format!("{base}.timeout_secs"), object.get("timeout_secs"));
    collector.optional_bool(&format!("{base}.continue_on_error"), object.get("continue_on_error"));
}

fn check_capability_request(payload: &Value, collector: &mut ViolationCollector) {
    let Some(object) = collector.object("capability_request", payload) else {
        return;
    };
    collector.unknown_fields("capability_request", object, &CAPABILITY_FIELDS);
    collector.handler_name("capability_request.name", object.get("name"));

    match object.get("description") {
        None => collector.push("capability_request.description", "is required"),
        Some(Value::String(text)) if text.trim().is_empty() => collector.push("capability_request.description", "must not be empty"),
        Some(Value::String(_)) => {}
        Some(_) => collector.push("capability_request.description", "must be a string"),
    }

    for list in ["parameters", "returns"] {
        let path = format!("capability_request.{list}");
        match object.get(list) {
            None => {}
            Some(Value::Array(fields)) => check_contract_fields(&path, fields, collector),
            Some(_) => collector.push(path, "must be an array"),
        }
    }

    if let Some(guidance) = object.get("guidance")
        && !guidance.is_string()
    {
        collector.push("capability_request.guidance", "must be a string");
    }
}

fn check_contract_fields(path: &str, fields: &[Value], collector: &mut ViolationCollector) {
    let mut seen = HashSet::new();
    for (index, field) in fields.iter().enumerate() {
        let base = format!("{path}[{index}]");
        let Some(object) = collector.object(&base, field) else {
            continue;
        };
        collector.unknown_fields(&base, object, &CONTRACT_FIELD_FIELDS);
        match object.get("name").and_then(Value::as_str) {
            Some(name) if name.trim().is_empty() => collector.push(format!("{base}.name"), "must not be empty"),
            Some(name) => {
                if !seen.insert(name) {
                    collector.push(format!("{base}.name"), format!("duplicate field '{name}'"));
                }
            }
            None => collector.push(format!("{base}.name"), "is required and must be a string"),
        }
        match object.get("type") {
            None => {}
            Some(Value::String(text)) if FieldType::parse(text).is_some() => {}
            Some(_) => collector.push(
                format!("{base}.type"),
                "must be one of string, number, integer, boolean, object, array, any",
            ),
        }
        collector.optional_bool(&format!("{base}.required"), object.get("required"));
    }
}

#[derive(Default)]
struct ViolationCollector {
    violations: Vec<Violation>,
}

impl ViolationCollector {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            path: path.into(),
            message: message.into(),
        });
    }

    fn finish(self) -> Result<(), ValidationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                violations: self.violations,
            })
        }
    }

    fn object<'a>(&mut self, path: &str, value: &'a Value) -> Option<&'a JsonMap<String, Value>> {
        let object = value.as_object();
        if object.is_none() {
            self.push(path, "must be an object");
        }
        object
    }

    fn unknown_fields(&mut self, base: &str, object: &JsonMap<String, Value>, allowed: &[&str]) {
        for key in object.keys().filter(|key| !allowed.contains(&key.as_str())) {
            let path = if base.is_empty() { key.clone() } else { format!("{base}.{key}") };
            self.push(path, "unknown field");
        }
    }

    fn handler_name(&mut self, path: &str, value: Option<&Value>) {
        match value {
            None => self.push(path, "is required"),
            Some(Value::String(text)) if text.is_empty() => self.push(path, "must not be empty"),
            Some(Value::String(text)) if !is_valid_handler_name(text) => {
                self.push(path, "must start with a letter and contain only letters, digits, '_', '.', '-'")
            }
            Some(Value::String(_)) => {}
            Some(_) => self.push(path, "must be a string"),
        }
    }

    fn optional_bool(&mut self, path: &str, value: Option<&Value>) {
        if let Some(value) = value
            && !value.is_boolean()
        {
            self.push(path, "must be a boolean");
        }
    }

    fn optional_positive_integer(&mut self, path: &str, value: Option<&Value>) {
        if let Some(value) = value {
            match value.as_u64() {
                Some(number) if number > 0 => {}
                _ => self.push(path, "must be a positive integer"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(error: &ValidationError) -> Vec<&str> {
        error.violations.iter().map(|violation| violation.path.as_str()).collect()
    }

    #[test]
    fn accepts_minimal_direct_instruction_and_generates_id() {
        let validated = validate(&json!({
            "kind": "direct",
            "direct": { "handler": "echo", "params": { "message": "hi" } }
        }))
        .expect("valid direct instruction");

        assert_eq!(validated.kind(), InstructionKind::Direct);
        assert!(!validated.id.is_empty());
    }

    #[test]
    fn keeps_caller_supplied_id() {
        let validated = validate(&json!({ "id": "run-7", "kind": "intent", "intent": "rotate logs" })).expect("valid intent");
        assert_eq!(validated.id, "run-7");
    }

    #[test]
    fn rejects_non_object_documents() {
        let error = validate(&json!(["not", "an", "object"])).expect_err("arrays are rejected");
        assert_eq!(paths(&error), vec!["$"]);
    }

    #[test]
    fn reports_missing_and_unknown_kind() {
        let missing = validate(&json!({ "direct": {} })).expect_err("kind is required");
        assert!(paths(&missing).contains(&"kind"));

        let unknown = validate(&json!({ "kind": "teleport" })).expect_err("unknown kind");
        assert_eq!(unknown.violations[0].path, "kind");
        assert!(unknown.violations[0].message.contains("teleport"));
    }

    #[test]
    fn rejects_payload_that_does_not_match_kind() {
        let error = validate(&json!({
            "kind": "intent",
            "intent": "do things",
            "workflow": { "steps": [] }
        }))
        .expect_err("mismatched payload");
        assert_eq!(paths(&error), vec!["workflow"]);
    }

    #[test]
    fn direct_requires_handler_and_params() {
        let error = validate(&json!({ "kind": "direct", "direct": {} })).expect_err("missing fields");
        assert_eq!(paths(&error), vec!["direct.handler", "direct.params"]);
    }

    #[test]
    fn workflow_requires_non_empty_steps() {
        let error = validate(&json!({ "kind": "workflow", "workflow": { "steps": [] } })).expect_err("empty steps");
        assert_eq!(paths(&error), vec!["workflow.steps"]);
    }

    #[test]
    fn capability_request_requires_name_and_description() {
        let error = validate(&json!({ "kind": "capability_request", "capability_request": { "guidance": "fast" } }))
            .expect_err("missing name and description");
        assert_eq!(paths(&error), vec!["capability_request.name", "capability_request.description"]);
    }

    #[test]
    fn reports_every_violation_in_a_workflow() {
        let error = validate(&json!({
            "kind": "workflow",
            "workflow": {
                "max_concurrency": 0,
                "steps": [
                    { "step_id": "a", "handler": "echo" },
                    { "step_id": "a", "handler": "echo", "depends_on": ["ghost"] },
                    { "step_id": "c", "depends_on": ["c"], "extra": true }
                ]
            }
        }))
        .expect_err("several violations");

        assert_eq!(
            paths(&error),
            vec![
                "workflow.max_concurrency",
                "workflow.steps[1].step_id",
                "workflow.steps[1].depends_on[0]",
                "workflow.steps[2].extra",
                "workflow.steps[2].handler",
                "workflow.steps[2].depends_on[0]",
            ]
        );
    }

    #[test]
    fn forward_dependencies_on_declared_steps_are_accepted() {
        validate(&json!({
            "kind": "workflow",
            "workflow": {
                "steps": [
                    { "step_id": "late", "handler": "echo", "depends_on": ["early"] },
                    { "step_id": "early", "handler": "echo" }
                ]
            }
        }))
        .expect("dependency order is not declaration order");
    }

    #[test]
    fn validating_the_same_malformed_instruction_twice_is_idempotent() {
        let raw = json!({
            "id": "bad id!",
            "kind": "workflow",
            "direct": { "handler": "echo", "params": {} },
            "workflow": {
                "steps": [
                    { "step_id": "x", "handler": "", "params": "nope", "depends_on": ["y", 3] },
                    { "handler": "echo", "timeout_secs": -1 }
                ]
            }
        });

        let first = validate(&raw).expect_err("malformed");
        let second = validate(&raw).expect_err("malformed");
        assert_eq!(first, second);
        assert!(first.violations.len() >= 6, "expected many violations, got {:?}", first.violations);
    }

    #[test]
    fn contract_field_types_are_checked() {
        let error = validate(&json!({
            "kind": "capability_request",
            "capability_request": {
                "name": "summarize",
                "description": "Summarize text",
                "parameters": [ { "name": "text", "type": "string" }, { "name": "text", "type": "blob" } ]
            }
        }))
        .expect_err("bad contract");
        assert_eq!(
            paths(&error),
            vec!["capability_request.parameters[1].name", "capability_request.parameters[1].type"]
        );
    }

    #[test]
    fn validate_document_round_trips_typed_input() {
        let validated = validate(&json!({
            "id": "wf",
            "kind": "workflow",
            "workflow": { "steps": [ { "step_id": "only", "handler": "echo" } ] }
        }))
        .expect("valid");
        let again = validate_document(&validated.to_document()).expect("still valid");
        assert_eq!(validated, again);
    }
}
