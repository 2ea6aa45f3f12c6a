//! # Cadence Engine
//!
//! Runs structured instructions: single handler calls, multi-step workflows,
//! natural-language intents (through an external planner), and capability
//! requests (through an external generator and the extension gateway).
//!
//! ## Architecture
//!
//! - **`handler`**: the handler contract, the name-based registry, and built-ins
//! - **`templates`** / **`resolve`**: `{{step.path}}` parsing and substitution
//! - **`executor`**: dependency planning, the ready-set scheduler, and [`Engine`]
//! - **`gateway`**: structural validation and installation of generated handlers
//! - **`collaborators`**: planner and generator traits with subprocess implementations
//!
//! Durable state lives behind [`cadence_util::RecordStore`]; the engine is its
//! only writer.
//!
//! ## Usage
//!
//! ```rust
//! use cadence_engine::parse_instruction_file;
//!
//! let temp_dir = tempfile::tempdir()?;
//! let path = temp_dir.path().join("hello.yaml");
//! std::fs::write(&path, r#"
//! kind: direct
//! direct:
//!   handler: echo
//!   params: { greeting: hello }
//! "#)?;
//!
//! let raw = parse_instruction_file(&path)?;
//! assert_eq!(raw["kind"], "direct");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde_json::Value;

pub mod collaborators;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod handler;
pub mod resolve;
pub mod templates;

pub use collaborators::{CapabilityGenerator, CommandGenerator, CommandPlanner, IntentPlanner};
pub use error::EngineError;
pub use executor::{Engine, ExecutionPlan, RunHandle, RunSettings};
pub use gateway::{CapabilityImplementation, ExtensionGateway, RejectionError};
pub use handler::{Handler, HandlerParams, HandlerRegistry, ProcessHandler, RegistryError, handler_fn};
pub use resolve::{ResolutionScope, TemplateResolutionError, resolve_params, resolve_value};

/// Load an instruction document as raw JSON, ready for validation.
///
/// `.json` files are read as JSON; everything else is read as YAML, which
/// also accepts JSON text.
pub fn parse_instruction_file(file_path: impl AsRef<Path>) -> Result<Value> {
    let file_path = file_path.as_ref();
    let content =
        fs::read_to_string(file_path).with_context(|| format!("Failed to read instruction file: {}", file_path.display()))?;

    let is_json = file_path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", file_path.display()))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML in {}", file_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn yaml_and_json_files_parse_to_the_same_document() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let yaml_path = temp_dir.path().join("deploy.yml");
        let json_path = temp_dir.path().join("deploy.json");
        fs::write(
            &yaml_path,
            "kind: workflow\nworkflow:\n  steps:\n    - step_id: a\n      handler: echo\n      params: { n: 42 }\n",
        )
        .expect("write yaml");
        fs::write(
            &json_path,
            r#"{"kind":"workflow","workflow":{"steps":[{"step_id":"a","handler":"echo","params":{"n":42}}]}}"#,
        )
        .expect("write json");

        let from_yaml = parse_instruction_file(&yaml_path).expect("yaml");
        let from_json = parse_instruction_file(&json_path).expect("json");
        assert_eq!(from_yaml, from_json);
        assert_eq!(from_yaml["workflow"]["steps"][0]["params"]["n"], json!(42));
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let error = parse_instruction_file("/definitely/not/here.yaml").expect_err("missing");
        assert!(error.to_string().contains("/definitely/not/here.yaml"));
    }
}
