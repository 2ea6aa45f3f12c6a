//! Extension gateway: installs generated capabilities into the registry.
//!
//! An implementation is checked structurally against the capability request
//! (names and types of parameters and results). It is never executed to prove
//! correctness. Rejections list every problem so the generator can try again.

use std::collections::HashSet;
use std::sync::Arc;

use cadence_types::{
    CapabilitySpec, CommandSpec, ContractField, FieldType, HandlerDescriptor, InstalledCapability, Provenance,
    is_valid_handler_name,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::handler::{Handler, HandlerRegistry, ProcessHandler};

/// Generated capability awaiting installation.
#[derive(Clone)]
pub struct CapabilityImplementation {
    /// Parameters the implementation accepts.
    pub parameters: Vec<ContractField>,
    /// Result fields the implementation emits.
    pub returns: Vec<ContractField>,
    pub concurrency_safe: bool,
    pub handler: Arc<dyn Handler>,
    /// Program behind `handler`, when it is a subprocess; only such
    /// implementations outlive the process that installed them.
    pub command: Option<CommandSpec>,
}

impl CapabilityImplementation {
    /// Implementation running `command` through a [`ProcessHandler`] checked against `returns`.
    pub fn from_command(
        command: CommandSpec,
        parameters: Vec<ContractField>,
        returns: Vec<ContractField>,
        concurrency_safe: bool,
    ) -> Self {
        let handler = ProcessHandler::new(command.program.clone(), command.args.clone()).with_returns(returns.clone());
        Self {
            parameters,
            returns,
            concurrency_safe,
            handler: Arc::new(handler),
            command: Some(command),
        }
    }
}

impl std::fmt::Debug for CapabilityImplementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityImplementation")
            .field("parameters", &self.parameters)
            .field("returns", &self.returns)
            .field("concurrency_safe", &self.concurrency_safe)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Structural contract violations for a proposed capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("capability '{name}' was rejected: {}", .reasons.join("; "))]
pub struct RejectionError {
    pub name: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExtensionGateway {
    registry: Arc<HandlerRegistry>,
}

impl ExtensionGateway {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Validate `implementation` against `spec` and register it.
    ///
    /// The installed handler is tagged [`Provenance::Installed`].
    pub fn install_capability(
        &self,
        spec: &CapabilitySpec,
        implementation: CapabilityImplementation,
    ) -> Result<HandlerDescriptor, RejectionError> {
        self.install_at(spec, implementation, Utc::now())
    }

    /// Reinstall a capability persisted by an earlier process, keeping its
    /// original installation time. It goes through the same checks as a new one.
    pub fn reinstall(&self, installed: &InstalledCapability) -> Result<HandlerDescriptor, RejectionError> {
        let implementation = CapabilityImplementation::from_command(
            installed.command.clone(),
            installed.parameters.clone(),
            installed.returns.clone(),
            installed.concurrency_safe,
        );
        self.install_at(&installed.spec, implementation, installed.installed_at)
    }

    fn install_at(
        &self,
        spec: &CapabilitySpec,
        implementation: CapabilityImplementation,
        installed_at: DateTime<Utc>,
    ) -> Result<HandlerDescriptor, RejectionError> {
        let mut reasons = Vec::new();
        if !is_valid_handler_name(&spec.name) {
            reasons.push(format!("'{}' is not a valid handler name", spec.name));
        } else if self.registry.contains(&spec.name) {
            reasons.push(format!("a handler named '{}' is already registered", spec.name));
        }
        check_unique_names("parameter", &implementation.parameters, &mut reasons);
        check_unique_names("return field", &implementation.returns, &mut reasons);
        check_parameters(&spec.parameters, &implementation.parameters, &mut reasons);
        check_returns(&spec.returns, &implementation.returns, &mut reasons);

        if !reasons.is_empty() {
            return Err(self.reject(spec, reasons));
        }

        let descriptor = HandlerDescriptor {
            name: spec.name.clone(),
            description: Some(spec.description.clone()),
            parameters: implementation.parameters,
            returns: implementation.returns,
            concurrency_safe: implementation.concurrency_safe,
            provenance: Provenance::Installed {
                capability: spec.name.clone(),
                installed_at,
            },
        };

        match self.registry.register(descriptor.clone(), implementation.handler, false) {
            Ok(()) => {
                info!(handler = %descriptor.name, provenance = descriptor.provenance.label(), "installed capability");
                Ok(descriptor)
            }
            // Another install may have claimed the name since the check above.
            Err(error) => Err(self.reject(spec, vec![error.to_string()])),
        }
    }

    fn reject(&self, spec: &CapabilitySpec, reasons: Vec<String>) -> RejectionError {
        warn!(capability = %spec.name, reasons = ?reasons, "rejected capability");
        RejectionError {
            name: spec.name.clone(),
            reasons,
        }
    }
}

fn check_unique_names(label: &str, fields: &[ContractField], reasons: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            reasons.push(format!("{label} '{}' is declared more than once", field.name));
        }
    }
}

/// The implementation must accept every requested parameter with a compatible
/// type and must not require anything the request does not declare.
fn check_parameters(requested: &[ContractField], offered: &[ContractField], reasons: &mut Vec<String>) {
    for wanted in requested {
        match offered.iter().find(|field| field.name == wanted.name) {
            None => reasons.push(format!("missing parameter '{}'", wanted.name)),
            Some(field) if !accepts(field.field_type, wanted.field_type) => reasons.push(format!(
                "parameter '{}' has type {}, expected {}",
                wanted.name, field.field_type, wanted.field_type
            )),
            Some(field) if field.required && !wanted.required => reasons.push(format!(
                "parameter '{}' is optional in the request but required by the implementation",
                wanted.name
            )),
            Some(_) => {}
        }
    }
    for extra in offered.iter().filter(|field| field.required) {
        if !requested.iter().any(|wanted| wanted.name == extra.name) {
            reasons.push(format!("implementation requires undeclared parameter '{}'", extra.name));
        }
    }
}

/// The implementation must emit every requested result field with a compatible type.
fn check_returns(requested: &[ContractField], offered: &[ContractField], reasons: &mut Vec<String>) {
    for wanted in requested {
        match offered.iter().find(|field| field.name == wanted.name) {
            None => reasons.push(format!("missing return field '{}'", wanted.name)),
            Some(field) if !accepts(wanted.field_type, field.field_type) => reasons.push(format!(
                "return field '{}' has type {}, expected {}",
                wanted.name, field.field_type, wanted.field_type
            )),
            Some(field) if wanted.required && !field.required => {
                reasons.push(format!("return field '{}' is required but the implementation may omit it", wanted.name))
            }
            Some(_) => {}
        }
    }
}

/// Whether a slot of type `slot` can hold values of type `value`.
fn accepts(slot: FieldType, value: FieldType) -> bool {
    slot == FieldType::Any || slot == value || (slot == FieldType::Number && value == FieldType::Integer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn spec() -> CapabilitySpec {
        CapabilitySpec {
            name: "slugify".into(),
            description: "Turn a title into a URL slug".into(),
            parameters: vec![ContractField::required("title", FieldType::String)],
            returns: vec![ContractField::required("slug", FieldType::String)],
            guidance: None,
        }
    }

    fn implementation(parameters: Vec<ContractField>, returns: Vec<ContractField>) -> CapabilityImplementation {
        CapabilityImplementation {
            parameters,
            returns,
            concurrency_safe: true,
            handler: Arc::new(handler_fn(|params| async move { Ok(params) })),
            command: None,
        }
    }

    #[test]
    fn matching_implementation_is_installed_with_provenance() {
        let registry = Arc::new(HandlerRegistry::new());
        let gateway = ExtensionGateway::new(Arc::clone(&registry));
        let descriptor = gateway
            .install_capability(
                &spec(),
                implementation(
                    vec![ContractField::required("title", FieldType::String)],
                    vec![ContractField::required("slug", FieldType::String)],
                ),
            )
            .expect("install");

        assert!(descriptor.provenance.is_installed());
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], descriptor);
    }

    #[test]
    fn rejection_lists_every_structural_problem() {
        let gateway = ExtensionGateway::new(Arc::new(HandlerRegistry::new()));
        let error = gateway
            .install_capability(
                &spec(),
                implementation(
                    vec![
                        ContractField::required("title", FieldType::Integer),
                        ContractField::required("locale", FieldType::String),
                    ],
                    vec![],
                ),
            )
            .expect_err("rejected");

        assert_eq!(
            error.reasons,
            vec![
                "parameter 'title' has type integer, expected string",
                "implementation requires undeclared parameter 'locale'",
                "missing return field 'slug'",
            ]
        );
    }

    #[test]
    fn existing_names_are_rejected() {
        let registry = Arc::new(HandlerRegistry::with_builtins());
        let gateway = ExtensionGateway::new(registry);
        let mut echo_spec = spec();
        echo_spec.name = "echo".into();
        let error = gateway
            .install_capability(
                &echo_spec,
                implementation(
                    vec![ContractField::required("title", FieldType::String)],
                    vec![ContractField::required("slug", FieldType::String)],
                ),
            )
            .expect_err("duplicate");
        assert!(error.reasons[0].contains("already registered"));
    }

    #[test]
    fn reinstall_keeps_the_original_install_time() {
        let registry = Arc::new(HandlerRegistry::new());
        let gateway = ExtensionGateway::new(Arc::clone(&registry));
        let installed_at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").expect("timestamp").with_timezone(&Utc);
        let installed = InstalledCapability {
            spec: spec(),
            command: CommandSpec {
                program: "slugify-cli".into(),
                args: vec![],
            },
            parameters: vec![ContractField::required("title", FieldType::String)],
            returns: vec![ContractField::required("slug", FieldType::String)],
            concurrency_safe: false,
            installed_at,
        };

        let descriptor = gateway.reinstall(&installed).expect("reinstall");
        assert_eq!(
            descriptor.provenance,
            Provenance::Installed {
                capability: "slugify".into(),
                installed_at,
            }
        );
        assert!(!descriptor.concurrency_safe);
        assert!(gateway.reinstall(&installed).is_err());
    }

    #[test]
    fn wider_types_are_compatible() {
        assert!(accepts(FieldType::Any, FieldType::Object));
        assert!(accepts(FieldType::Number, FieldType::Integer));
        assert!(!accepts(FieldType::Integer, FieldType::Number));
    }
}
