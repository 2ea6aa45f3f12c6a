//! Handler contract, registry, and the handlers shipped with the engine.

use std::future::Future;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value};

pub mod builtin;
pub mod process;
pub mod registry;

pub use builtin::register_builtins;
pub use process::{ProcessHandler, ProcessOutput, run_process};
pub use registry::{HandlerRegistry, HandlerSlot, RegisteredHandler, RegistryError};

/// Parameter or result mapping exchanged with handlers.
pub type HandlerParams = JsonMap<String, Value>;

/// An invocable capability.
///
/// Handlers receive fully resolved parameters and return a result mapping or
/// an error describing why they failed. Side effects are the handler's own.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, params: HandlerParams) -> anyhow::Result<HandlerParams>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    function: F,
}

/// Wrap an async closure as a handler.
///
/// ```rust
/// use cadence_engine::handler::{Handler, handler_fn};
///
/// let double = handler_fn(|mut params| async move {
///     let n = params.get("n").and_then(|value| value.as_i64()).unwrap_or_default();
///     params.insert("n".into(), (n * 2).into());
///     Ok(params)
/// });
/// # let _ = &double as &dyn Handler;
/// ```
pub fn handler_fn<F, Fut>(function: F) -> FnHandler<F>
where
    F: Fn(HandlerParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerParams>> + Send + 'static,
{
    FnHandler { function }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerParams>> + Send + 'static,
{
    async fn invoke(&self, params: HandlerParams) -> anyhow::Result<HandlerParams> {
        (self.function)(params).await
    }
}
