//! Name-to-handler registry.
//!
//! Every invocable capability is reachable only through an entry in this
//! registry, so the callable surface is always enumerable. Lookups hand out an
//! `Arc` to the entry; a step keeps that `Arc` for its whole run, which is why
//! a replacement or deregistration never affects an in-flight step.

use std::sync::{Arc, RwLock};

use cadence_types::{HandlerDescriptor, is_valid_handler_name};
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::{Handler, HandlerParams};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no handler registered under '{name}'")]
    NotFound { name: String },

    #[error("a handler named '{name}' is already registered")]
    Duplicate { name: String },

    #[error("'{name}' is not a valid handler name")]
    InvalidName { name: String },
}

/// Descriptor plus the invocable capability behind it.
pub struct RegisteredHandler {
    descriptor: HandlerDescriptor,
    handler: Arc<dyn Handler>,
    /// Held by the running invocation when the handler is not concurrency-safe.
    exclusive: Option<Arc<Mutex<()>>>,
}

impl RegisteredHandler {
    fn new(descriptor: HandlerDescriptor, handler: Arc<dyn Handler>) -> Self {
        let exclusive = (!descriptor.concurrency_safe).then(|| Arc::new(Mutex::new(())));
        Self {
            descriptor,
            handler,
            exclusive,
        }
    }

    pub fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Wait until this handler may run.
    ///
    /// Resolves immediately for concurrency-safe handlers. Otherwise it waits
    /// for the previous slot to be dropped, so queue time is spent here and
    /// not inside [`HandlerSlot::invoke`].
    pub async fn acquire(self: Arc<Self>) -> HandlerSlot {
        let guard = match &self.exclusive {
            Some(lock) => Some(Arc::clone(lock).lock_owned().await),
            None => None,
        };
        HandlerSlot {
            handler: self,
            _guard: guard,
        }
    }
}

/// Right to invoke a handler, held until dropped.
pub struct HandlerSlot {
    handler: Arc<RegisteredHandler>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl HandlerSlot {
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    pub async fn invoke(&self, params: HandlerParams) -> anyhow::Result<HandlerParams> {
        self.handler.handler.invoke(params).await
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler").field("descriptor", &self.descriptor).finish_non_exhaustive()
    }
}

/// Registry shared by every engine run.
///
/// Mutations take the write lock; lookups and listings share the read lock.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: RwLock<IndexMap<String, Arc<RegisteredHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::register_builtins(&registry);
        registry
    }

    /// Register `handler` under `descriptor.name`.
    ///
    /// An existing name is an error unless `replace` is set.
    pub fn register(&self, descriptor: HandlerDescriptor, handler: Arc<dyn Handler>, replace: bool) -> Result<(), RegistryError> {
        let name = descriptor.name.clone();
        if !is_valid_handler_name(&name) {
            return Err(RegistryError::InvalidName { name });
        }

        let mut entries = self.entries.write().expect("handler registry lock poisoned");
        if entries.contains_key(&name) && !replace {
            return Err(RegistryError::Duplicate { name });
        }

        info!(
            handler = %name,
            provenance = descriptor.provenance.label(),
            concurrency_safe = descriptor.concurrency_safe,
            replaced = entries.contains_key(&name),
            "registered handler"
        );
        entries.insert(name, Arc::new(RegisteredHandler::new(descriptor, handler)));
        Ok(())
    }

    /// Look up a handler by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<RegisteredHandler>, RegistryError> {
        let entries = self.entries.read().expect("handler registry lock poisoned");
        entries.get(name).cloned().ok_or_else(|| RegistryError::NotFound { name: name.to_string() })
    }

    /// Remove a handler; in-flight invocations keep their reference.
    pub fn deregister(&self, name: &str) -> Result<HandlerDescriptor, RegistryError> {
        let mut entries = self.entries.write().expect("handler registry lock poisoned");
        let removed = entries
            .shift_remove(name)
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string() })?;
        debug!(handler = %name, "deregistered handler");
        Ok(removed.descriptor.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().expect("handler registry lock poisoned").contains_key(name)
    }

    /// Descriptors of every registered handler, sorted by name.
    pub fn list(&self) -> Vec<HandlerDescriptor> {
        let entries = self.entries.read().expect("handler registry lock poisoned");
        let mut descriptors: Vec<HandlerDescriptor> = entries.values().map(|entry| entry.descriptor.clone()).collect();
        descriptors.sort_by(|left, right| left.name.cmp(&right.name));
        descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn constant(value: i64) -> Arc<dyn Handler> {
        Arc::new(handler_fn(move |_params| async move {
            Ok(json!({ "value": value }).as_object().cloned().unwrap_or_default())
        }))
    }

    #[test]
    fn duplicate_registration_requires_replace_flag() {
        let registry = HandlerRegistry::new();
        let descriptor = HandlerDescriptor::builtin("answer", vec![], vec![]);
        registry.register(descriptor.clone(), constant(1), false).expect("first register");

        let error = registry.register(descriptor.clone(), constant(2), false).expect_err("duplicate");
        assert_eq!(error, RegistryError::Duplicate { name: "answer".into() });
        registry.register(descriptor, constant(2), true).expect("replace");
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn invalid_names_are_refused() {
        let registry = HandlerRegistry::new();
        let error = registry
            .register(HandlerDescriptor::builtin("bad name", vec![], vec![]), constant(1), false)
            .expect_err("invalid name");
        assert!(matches!(error, RegistryError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn resolved_reference_survives_replacement_and_deregistration() {
        let registry = HandlerRegistry::new();
        let descriptor = HandlerDescriptor::builtin("answer", vec![], vec![]);
        registry.register(descriptor.clone(), constant(1), false).expect("register");

        let held = registry.resolve("answer").expect("resolve");
        registry.register(descriptor, constant(2), true).expect("replace");
        registry.deregister("answer").expect("deregister");

        let result = held.acquire().await.invoke(HandlerParams::new()).await.expect("invoke");
        assert_eq!(result["value"], json!(1));
        assert!(matches!(registry.resolve("answer"), Err(RegistryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn unsafe_handlers_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handler_fn(move |params| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(params)
                }
            })
        };

        let registry = HandlerRegistry::new();
        registry
            .register(
                HandlerDescriptor::builtin("serial", vec![], vec![]).with_concurrency_safe(false),
                Arc::new(handler),
                false,
            )
            .expect("register");

        let entry = registry.resolve("serial").expect("resolve");
        let calls = (0..4).map(|_| {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.acquire().await.invoke(HandlerParams::new()).await })
        });
        for call in calls.collect::<Vec<_>>() {
            call.await.expect("join").expect("invoke");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn serialized_handler_slot_waits_for_the_holder() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                HandlerDescriptor::builtin("serial", vec![], vec![]).with_concurrency_safe(false),
                constant(1),
                false,
            )
            .expect("register");
        let entry = registry.resolve("serial").expect("resolve");

        let held = Arc::clone(&entry).acquire().await;
        let waiting = tokio::spawn(Arc::clone(&entry).acquire());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(held);
        let slot = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("slot released")
            .expect("join");
        assert_eq!(slot.name(), "serial");
    }

    #[test]
    fn builtins_are_listed_with_provenance() {
        let registry = HandlerRegistry::with_builtins();
        let names: Vec<String> = registry.list().into_iter().map(|descriptor| descriptor.name).collect();
        assert_eq!(names, vec!["command", "echo", "file.read", "file.write", "sleep"]);
        assert!(registry.list().iter().all(|descriptor| !descriptor.provenance.is_installed()));
    }
}
