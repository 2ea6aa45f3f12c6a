//! Secret redaction for anything that ends up in log output.
//!
//! Execution records keep resolved parameters verbatim for diagnosis; only the
//! copies written to logs are masked.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map as JsonMap, Value};

const REDACTED: &str = "[REDACTED]";

static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s*)([\w\-\.=:/+ ]+)",
        r"(?i)([A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
        r"(?i)(DATABASE_URL=)([^\s]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("redaction pattern should compile"))
    .collect()
});

static SENSITIVE_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(key|token|secret|password|credential|authorization)").expect("sensitive key regex should compile"));

/// Redacts values that look like secrets in a string.
///
/// ```rust
/// use cadence_util::redact_sensitive;
///
/// assert_eq!(redact_sensitive("API_KEY=abc123 region=us"), "API_KEY=[REDACTED] region=us");
/// ```
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in REDACT_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| {
                let prefix = captures.get(1).map(|matched| matched.as_str()).unwrap_or("");
                format!("{prefix}{REDACTED}")
            })
            .to_string();
    }
    redacted
}

/// Copy of a parameter mapping with sensitive keys masked and strings scrubbed.
pub fn redact_params(params: &JsonMap<String, Value>) -> JsonMap<String, Value> {
    params
        .iter()
        .map(|(key, value)| {
            let masked = if SENSITIVE_KEY_REGEX.is_match(key) {
                Value::String(REDACTED.to_string())
            } else {
                redact_value(value)
            };
            (key.clone(), masked)
        })
        .collect()
}

fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(redact_sensitive(text)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(redact_params(map)),
        other => other.clone(),
    }
}
