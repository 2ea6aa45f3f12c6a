//! External collaborators the engine delegates to.
//!
//! Intent planning and capability generation are black boxes: only their
//! input and output contracts matter to the engine. The subprocess-backed
//! implementations in [`command`] let any program fill either role.

use async_trait::async_trait;
use cadence_types::{CapabilitySpec, WorkflowDefinition};

use crate::gateway::CapabilityImplementation;

pub mod command;

pub use command::{CommandGenerator, CommandPlanner};

/// Turns a natural-language intent into a workflow.
///
/// The engine validates and plans the returned workflow before any step runs.
#[async_trait]
pub trait IntentPlanner: Send + Sync {
    async fn plan(&self, intent: &str) -> anyhow::Result<WorkflowDefinition>;
}

/// Produces an implementation for a capability request.
#[async_trait]
pub trait CapabilityGenerator: Send + Sync {
    async fn generate(&self, spec: &CapabilitySpec) -> anyhow::Result<CapabilityImplementation>;
}
