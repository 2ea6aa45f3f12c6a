//! Template reference parsing.
//!
//! Parameter strings may embed `{{step_id.path}}` references to the results of
//! earlier steps. A path is dotted (`{{fetch.body.items}}`) and may index into
//! lists either as a plain integer segment (`{{fetch.items.0}}`) or with
//! brackets (`{{fetch.items[0].id}}`). A bare `{{step_id}}` refers to the whole
//! result mapping.

use serde_json::Value;

/// Parsed `{{step_id.path}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateReference {
    /// Raw expression between the delimiters, trimmed.
    pub expression: String,
    pub step_id: String,
    /// Path segments below the step result; empty for the whole result.
    pub path: Vec<String>,
}

/// Piece of a parameter string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment<'a> {
    Literal(&'a str),
    Reference(TemplateReference),
}

/// Syntax problem in a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSyntaxError {
    pub template: String,
    pub reason: String,
}

/// Split `text` into literal and reference segments.
pub fn parse_template_string(text: &str) -> Result<Vec<TemplateSegment<'_>>, TemplateSyntaxError> {
    let mut segments = Vec::new();
    let mut remainder = text;

    while let Some(start) = remainder.find("{{") {
        if start > 0 {
            segments.push(TemplateSegment::Literal(&remainder[..start]));
        }
        let after_start = &remainder[start + 2..];
        let Some(end) = after_start.find("}}") else {
            return Err(TemplateSyntaxError {
                template: remainder[start..].to_string(),
                reason: "unterminated template; expected '}}'".into(),
            });
        };
        let expression = after_start[..end].trim();
        let reference = parse_reference_expression(expression).ok_or_else(|| TemplateSyntaxError {
            template: format!("{{{{{}}}}}", &after_start[..end]),
            reason: "expected a step reference of the form {{step_id.path}}".into(),
        })?;
        segments.push(TemplateSegment::Reference(reference));
        remainder = &after_start[end + 2..];
    }

    if !remainder.is_empty() {
        segments.push(TemplateSegment::Literal(remainder));
    }
    Ok(segments)
}

/// Returns true when `text` contains a template opener.
pub fn contains_template(text: &str) -> bool {
    text.contains("{{")
}

/// Parse a reference expression (without delimiters).
///
/// Supports:
/// - `step_id`
/// - `step_id.field`
/// - `step_id.0.field`
/// - `step_id[0].field`
/// - `step_id.items[0].id`
pub fn parse_reference_expression(expression: &str) -> Option<TemplateReference> {
    let trimmed = expression.trim();
    let (step_id, path_part) = split_step_identifier_and_path(trimmed)?;
    let path = normalize_reference_path(path_part)?;
    Some(TemplateReference {
        expression: trimmed.to_string(),
        step_id,
        path,
    })
}

fn split_step_identifier_and_path(raw: &str) -> Option<(String, &str)> {
    let mut step_identifier = String::new();
    let mut split_index = None;

    for (index, character) in raw.char_indices() {
        if character.is_ascii_alphanumeric() || character == '_' || character == '-' {
            step_identifier.push(character);
            continue;
        }
        if character == '.' || character == '[' {
            split_index = Some(index);
            break;
        }
        return None;
    }

    if step_identifier.is_empty() {
        return None;
    }

    let index = split_index.unwrap_or(raw.len());
    Some((step_identifier, &raw[index..]))
}

fn normalize_reference_path(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    let mut expect_segment = false;

    while let Some(character) = chars.next() {
        match character {
            '.' => {
                if expect_segment && current.is_empty() {
                    return None;
                }
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                expect_segment = true;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut inner = String::new();
                let mut closed = false;
                for next_character in chars.by_ref() {
                    if next_character == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(next_character);
                }
                let index = inner.trim();
                if !closed || index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                segments.push(index.to_string());
                expect_segment = false;
            }
            c if c.is_whitespace() => return None,
            c => {
                current.push(c);
                expect_segment = false;
            }
        }
    }

    if expect_segment {
        return None;
    }
    if !current.is_empty() {
        segments.push(current);
    }
    Some(segments)
}

/// Template found while walking a parameter tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateOccurrence {
    /// Location of the string below the params mapping, e.g. `args[1]` or `body.name`.
    pub source_path: String,
    pub outcome: Result<TemplateReference, TemplateSyntaxError>,
}

/// Collect every template occurrence in a JSON value tree.
pub fn collect_templates_from_value(value: &Value, source_path: &str, occurrences: &mut Vec<TemplateOccurrence>) {
    match value {
        Value::String(raw_text) => {
            if !contains_template(raw_text) {
                return;
            }
            match parse_template_string(raw_text) {
                Ok(segments) => {
                    for segment in segments {
                        if let TemplateSegment::Reference(reference) = segment {
                            occurrences.push(TemplateOccurrence {
                                source_path: source_path.to_string(),
                                outcome: Ok(reference),
                            });
                        }
                    }
                }
                Err(error) => occurrences.push(TemplateOccurrence {
                    source_path: source_path.to_string(),
                    outcome: Err(error),
                }),
            }
        }
        Value::Array(values) => {
            for (index, nested_value) in values.iter().enumerate() {
                collect_templates_from_value(nested_value, format!("{source_path}[{index}]").as_str(), occurrences);
            }
        }
        Value::Object(map) => {
            for (key, nested_value) in map {
                let nested_path = if source_path.is_empty() {
                    key.clone()
                } else {
                    format!("{source_path}.{key}")
                };
                collect_templates_from_value(nested_value, nested_path.as_str(), occurrences);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_reference_supports_dot_index() {
        let parsed = parse_reference_expression("find_service.0.service.id").expect("parsed");
        assert_eq!(parsed.step_id, "find_service");
        assert_eq!(parsed.path, vec!["0", "service", "id"]);
    }

    #[test]
    fn parse_reference_supports_bracket_index() {
        let parsed = parse_reference_expression("find_service[0].service.id").expect("parsed");
        assert_eq!(parsed.step_id, "find_service");
        assert_eq!(parsed.path, vec!["0", "service", "id"]);
    }

    #[test]
    fn bare_step_reference_has_empty_path() {
        let parsed = parse_reference_expression(" fetch ").expect("parsed");
        assert_eq!(parsed.step_id, "fetch");
        assert!(parsed.path.is_empty());
    }

    #[test]
    fn malformed_references_are_rejected() {
        for expression in ["", "a..b", "a.", "a[x]", "a[1", "a b", "$a.b"] {
            assert!(parse_reference_expression(expression).is_none(), "accepted {expression:?}");
        }
    }

    #[test]
    fn parse_template_string_splits_literals_and_references() {
        let segments = parse_template_string("id={{a.id}} name={{ b.name }}").expect("parsed");
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], TemplateSegment::Literal("id="));
        assert!(matches!(&segments[3], TemplateSegment::Reference(reference) if reference.step_id == "b"));
    }

    #[test]
    fn unterminated_template_is_a_syntax_error() {
        let error = parse_template_string("prefix {{a.value").expect_err("unterminated");
        assert!(error.reason.contains("unterminated"));
    }

    #[test]
    fn collect_templates_reports_nested_locations() {
        let params = json!({ "args": ["plain", "{{fetch.content}}"], "body": { "name": "{{bad ref}}" } });
        let mut occurrences = Vec::new();
        collect_templates_from_value(&params, "", &mut occurrences);

        let paths: Vec<&str> = occurrences.iter().map(|occurrence| occurrence.source_path.as_str()).collect();
        assert_eq!(paths, vec!["args[1]", "body.name"]);
        assert!(occurrences[0].outcome.is_ok());
        assert!(occurrences[1].outcome.is_err());
    }
}
