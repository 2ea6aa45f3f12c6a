//! Handler descriptors and parameter/return contracts.
//!
//! A descriptor is the enumerable, auditable face of a registered handler. The
//! engine keeps the invocable capability next to it; everything in this module
//! is plain data that can be listed, serialized, and compared.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::instruction::CapabilitySpec;

static HANDLER_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]*$").expect("handler name regex should compile"));

/// Returns true when `name` can be used as a handler name.
///
/// Handler names start with a letter and may contain letters, digits, `_`, `.` and `-`
/// (for example `file.read` or `deploy-app`).
pub fn is_valid_handler_name(name: &str) -> bool {
    HANDLER_NAME_REGEX.is_match(name)
}

/// Primitive type declared for a contract field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// Accepts any JSON value.
    #[default]
    Any,
}

impl FieldType {
    /// All variants, in declaration order.
    pub const ALL: [FieldType; 7] = [
        FieldType::String,
        FieldType::Number,
        FieldType::Integer,
        FieldType::Boolean,
        FieldType::Object,
        FieldType::Array,
        FieldType::Any,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }

    /// Parse the wire spelling of a field type.
    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == text)
    }

    /// Returns true when a JSON value inhabits this type.
    pub fn matches(self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Named, typed field in a parameter or return contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ContractField {
    /// Field name as it appears in the parameter or result mapping.
    pub name: String,
    /// Declared type of the field.
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// Whether callers must supply the field (parameters) or the handler must emit it (returns).
    #[serde(default = "default_required")]
    pub required: bool,
}

impl ContractField {
    /// Build a required field.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Build an optional field.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

fn default_required() -> bool {
    true
}

/// Where a registered handler came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    /// Shipped with the engine.
    Builtin,
    /// Installed at runtime through the extension gateway.
    Installed {
        /// Capability request name the handler was generated for.
        capability: String,
        /// Installation timestamp.
        installed_at: DateTime<Utc>,
    },
}

impl Provenance {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Installed { .. } => "installed",
        }
    }

    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }
}

/// Listing entry for a registered handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlerDescriptor {
    /// Registry name used by steps to reference the handler.
    pub name: String,
    /// Optional human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared parameters.
    #[serde(default)]
    pub parameters: Vec<ContractField>,
    /// Declared result fields.
    #[serde(default)]
    pub returns: Vec<ContractField>,
    /// When false the engine never runs two invocations of this handler at once.
    pub concurrency_safe: bool,
    /// Built-in or runtime-installed.
    pub provenance: Provenance,
}

impl HandlerDescriptor {
    /// Descriptor for a built-in handler with the given contract.
    pub fn builtin(name: impl Into<String>, parameters: Vec<ContractField>, returns: Vec<ContractField>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters,
            returns,
            concurrency_safe: true,
            provenance: Provenance::Builtin,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the concurrency-safety flag.
    pub fn with_concurrency_safe(mut self, concurrency_safe: bool) -> Self {
        self.concurrency_safe = concurrency_safe;
        self
    }

    /// Declared parameter names, in declaration order.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|field| field.name.as_str()).collect()
    }
}

/// External program behind a generated capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A command capability accepted by the gateway, as persisted for later processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledCapability {
    /// The request the capability was generated for.
    pub spec: CapabilitySpec,
    pub command: CommandSpec,
    pub parameters: Vec<ContractField>,
    pub returns: Vec<ContractField>,
    pub concurrency_safe: bool,
    pub installed_at: DateTime<Utc>,
}

impl InstalledCapability {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}
