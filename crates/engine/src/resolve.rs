//! # Variable Resolution
//!
//! Substitutes `{{step_id.path}}` references in a step's parameters with values
//! from the results of its already-Completed dependencies.
//!
//! A parameter string that consists of exactly one template is replaced by the
//! referenced value with its JSON type intact; templates embedded in a longer
//! string are rendered to text.
//!
//! ```rust
//! use cadence_engine::resolve::{ResolutionScope, resolve_params};
//! use serde_json::json;
//!
//! let mut scope = ResolutionScope::default();
//! scope.insert("A", json!({ "value": 42 }).as_object().cloned().unwrap_or_default());
//!
//! let params = json!({ "x": "{{A.value}}", "label": "answer={{A.value}}" });
//! let resolved = resolve_params("B", params.as_object().expect("object"), &scope)?;
//! assert_eq!(resolved["x"], json!(42));
//! assert_eq!(resolved["label"], json!("answer=42"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;

use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

use crate::templates::{TemplateReference, TemplateSegment, contains_template, parse_template_string};

/// A template that could not be substituted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step '{step_id}': cannot resolve template '{template}': {reason}")]
pub struct TemplateResolutionError {
    /// Step whose parameters contain the template.
    pub step_id: String,
    /// Offending template text.
    pub template: String,
    pub reason: String,
}

/// Results visible to a step during resolution, keyed by step id.
#[derive(Debug, Default, Clone)]
pub struct ResolutionScope {
    steps: HashMap<String, Value>,
}

impl ResolutionScope {
    pub fn insert(&mut self, step_id: impl Into<String>, result: JsonMap<String, Value>) {
        self.steps.insert(step_id.into(), Value::Object(result));
    }

    pub fn get(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Resolve every template in `params` on behalf of `step_id`.
pub fn resolve_params(
    step_id: &str,
    params: &JsonMap<String, Value>,
    scope: &ResolutionScope,
) -> Result<JsonMap<String, Value>, TemplateResolutionError> {
    let mut resolved = JsonMap::with_capacity(params.len());
    for (key, value) in params {
        resolved.insert(key.clone(), resolve_tree(step_id, value, scope)?);
    }
    Ok(resolved)
}

fn resolve_tree(step_id: &str, value: &Value, scope: &ResolutionScope) -> Result<Value, TemplateResolutionError> {
    match value {
        Value::String(text) if contains_template(text) => resolve_value(step_id, text, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_tree(step_id, item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_params(step_id, map, scope).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve a single parameter string.
///
/// Returns the typed value for a whole-string template and a string otherwise.
pub fn resolve_value(step_id: &str, template: &str, scope: &ResolutionScope) -> Result<Value, TemplateResolutionError> {
    let segments = parse_template_string(template).map_err(|error| TemplateResolutionError {
        step_id: step_id.to_string(),
        template: error.template,
        reason: error.reason,
    })?;

    if let [TemplateSegment::Reference(reference)] = segments.as_slice() {
        return lookup_reference(step_id, reference, scope).cloned();
    }

    let mut rendered = String::with_capacity(template.len());
    for segment in &segments {
        match segment {
            TemplateSegment::Literal(text) => rendered.push_str(text),
            TemplateSegment::Reference(reference) => {
                let value = lookup_reference(step_id, reference, scope)?;
                rendered.push_str(&render_embedded(value));
            }
        }
    }
    Ok(Value::String(rendered))
}

fn lookup_reference<'a>(
    step_id: &str,
    reference: &TemplateReference,
    scope: &'a ResolutionScope,
) -> Result<&'a Value, TemplateResolutionError> {
    let failure = |reason: String| TemplateResolutionError {
        step_id: step_id.to_string(),
        template: format!("{{{{{}}}}}", reference.expression),
        reason,
    };

    let mut current = scope
        .get(&reference.step_id)
        .ok_or_else(|| failure(format!("step '{}' has no completed result in scope", reference.step_id)))?;

    for (depth, segment) in reference.path.iter().enumerate() {
        let location = || reference.path[..depth].join(".");
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| {
                if depth == 0 {
                    failure(format!("result of '{}' has no field '{segment}'", reference.step_id))
                } else {
                    failure(format!("'{}' has no field '{segment}'", location()))
                }
            })?,
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| failure(format!("'{}' is a list; '{segment}' is not an index", location())))?;
                items
                    .get(index)
                    .ok_or_else(|| failure(format!("index {index} is out of bounds for '{}' (length {})", location(), items.len())))?
            }
            other => {
                return Err(failure(format!(
                    "cannot take '{segment}' of {} value at '{}'",
                    json_type_name(other),
                    location()
                )));
            }
        };
    }
    Ok(current)
}

fn render_embedded(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> ResolutionScope {
        let mut scope = ResolutionScope::default();
        scope.insert(
            "fetch",
            json!({
                "value": 42,
                "items": [{ "id": "a1" }, { "id": "b2" }],
                "meta": { "ok": true, "owner": null }
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        );
        scope
    }

    #[test]
    fn whole_string_template_keeps_type() {
        assert_eq!(resolve_value("next", "{{fetch.value}}", &scope()).expect("resolve"), json!(42));
        assert_eq!(resolve_value("next", "{{ fetch.meta }}", &scope()).expect("resolve"), json!({ "ok": true, "owner": null }));
    }

    #[test]
    fn embedded_templates_render_as_text() {
        let value = resolve_value("next", "{{fetch.items[1].id}}/{{fetch.value}}/{{fetch.meta.ok}}", &scope()).expect("resolve");
        assert_eq!(value, json!("b2/42/true"));
    }

    #[test]
    fn integer_segments_index_into_lists() {
        assert_eq!(resolve_value("next", "{{fetch.items.0.id}}", &scope()).expect("resolve"), json!("a1"));
    }

    #[test]
    fn nested_params_are_resolved_recursively() {
        let params = json!({ "args": ["--id", "{{fetch.items[0].id}}"], "body": { "n": "{{fetch.value}}" }, "keep": 1 });
        let resolved = resolve_params("next", params.as_object().expect("object"), &scope()).expect("resolve");
        assert_eq!(Value::Object(resolved), json!({ "args": ["--id", "a1"], "body": { "n": 42 }, "keep": 1 }));
    }

    #[test]
    fn missing_step_field_and_type_mismatch_are_errors() {
        let missing_step = resolve_value("next", "{{other.value}}", &scope()).expect_err("missing step");
        assert_eq!(missing_step.step_id, "next");
        assert_eq!(missing_step.template, "{{other.value}}");

        let missing_field = resolve_value("next", "{{fetch.nope}}", &scope()).expect_err("missing field");
        assert!(missing_field.reason.contains("no field 'nope'"));

        let out_of_bounds = resolve_value("next", "{{fetch.items[5]}}", &scope()).expect_err("out of bounds");
        assert!(out_of_bounds.reason.contains("out of bounds"));

        let mismatch = resolve_value("next", "{{fetch.value.deeper}}", &scope()).expect_err("type mismatch");
        assert!(mismatch.reason.contains("number"));
    }
}
