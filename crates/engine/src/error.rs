//! Error taxonomy surfaced by the engine.

use std::time::Duration;

use cadence_types::{RunStatus, ValidationError};
use cadence_util::StoreError;
use thiserror::Error;

use crate::gateway::RejectionError;
use crate::handler::RegistryError;
use crate::resolve::TemplateResolutionError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("workflow contains a dependency cycle involving: {}", .steps.join(", "))]
    CyclicWorkflow { steps: Vec<String> },

    #[error(transparent)]
    TemplateResolution(#[from] TemplateResolutionError),

    #[error("no handler registered under '{name}'")]
    HandlerNotFound { name: String },

    #[error("a handler named '{name}' is already registered")]
    DuplicateHandler { name: String },

    #[error("'{name}' is not a valid handler name")]
    InvalidHandlerName { name: String },

    #[error("handler '{handler}' failed: {source:#}")]
    HandlerExecution {
        handler: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler '{handler}' timed out after {}s", .timeout.as_secs())]
    Timeout { handler: String, timeout: Duration },

    #[error("execution record '{id}' was modified concurrently; gave up after {attempts} attempts")]
    ConcurrentUpdate { id: String, attempts: u32 },

    #[error(transparent)]
    Rejection(#[from] RejectionError),

    #[error("intent planning failed: {source:#}")]
    Planning {
        #[source]
        source: anyhow::Error,
    },

    #[error("capability generation failed: {source:#}")]
    Generation {
        #[source]
        source: anyhow::Error,
    },

    #[error("no {collaborator} is configured")]
    CollaboratorUnavailable { collaborator: &'static str },

    #[error("run '{id}' is {status}; only failed or cancelled runs can be retried")]
    NotRetryable { id: String, status: RunStatus },

    #[error("run '{id}' is still in progress")]
    RunInProgress { id: String },

    #[error("run task for '{id}' ended abnormally: {source}")]
    RunTask {
        id: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("state store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn handler_execution(handler: impl Into<String>, source: anyhow::Error) -> Self {
        Self::HandlerExecution {
            handler: handler.into(),
            source,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ConcurrentUpdate { id, attempts } => Self::ConcurrentUpdate { id, attempts },
            other => Self::Store(other),
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound { name } => Self::HandlerNotFound { name },
            RegistryError::Duplicate { name } => Self::DuplicateHandler { name },
            RegistryError::InvalidName { name } => Self::InvalidHandlerName { name },
        }
    }
}
