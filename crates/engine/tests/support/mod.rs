//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_engine::{Engine, Handler, HandlerParams, HandlerRegistry, handler_fn};
use cadence_types::{ExecutionRecord, HandlerDescriptor, StepStatus};
use cadence_util::{EngineConfig, InMemoryRecordStore};
use serde_json::Value;

pub fn builtin_registry() -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::with_builtins())
}

pub fn memory_engine(registry: Arc<HandlerRegistry>) -> Engine {
    Engine::new(registry, Arc::new(InMemoryRecordStore::new()), EngineConfig::default())
}

pub fn register(registry: &HandlerRegistry, name: &str, handler: impl Handler + 'static) {
    registry
        .register(HandlerDescriptor::builtin(name, vec![], vec![]), Arc::new(handler), false)
        .expect("register test handler");
}

pub fn object(value: Value) -> HandlerParams {
    value.as_object().cloned().expect("object literal")
}

/// Number of times a spy handler was invoked.
#[derive(Debug, Clone, Default)]
pub struct CallCount(Arc<AtomicUsize>);

impl CallCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Register an echo handler that counts its calls.
pub fn counting_echo(registry: &HandlerRegistry, name: &str) -> CallCount {
    let calls = CallCount::default();
    let spy = calls.clone();
    register(
        registry,
        name,
        handler_fn(move |params| {
            let spy = spy.clone();
            async move {
                spy.bump();
                Ok(params)
            }
        }),
    );
    calls
}

/// Register a handler that always fails with `message`.
pub fn failing(registry: &HandlerRegistry, name: &str, message: &'static str) -> CallCount {
    let calls = CallCount::default();
    let spy = calls.clone();
    register(
        registry,
        name,
        handler_fn(move |_params| {
            let spy = spy.clone();
            async move {
                spy.bump();
                Err::<HandlerParams, _>(anyhow::anyhow!(message))
            }
        }),
    );
    calls
}

/// Register a handler that fails on its first `failures` calls, then echoes.
pub fn flaky(registry: &HandlerRegistry, name: &str, failures: usize) -> CallCount {
    let calls = CallCount::default();
    let spy = calls.clone();
    register(
        registry,
        name,
        handler_fn(move |params| {
            let spy = spy.clone();
            async move {
                if spy.bump() <= failures {
                    anyhow::bail!("transient failure");
                }
                Ok(params)
            }
        }),
    );
    calls
}

/// Register a handler that captures the parameters it receives.
pub fn capturing(registry: &HandlerRegistry, name: &str) -> Arc<Mutex<Vec<HandlerParams>>> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    register(
        registry,
        name,
        handler_fn(move |params| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().expect("capture lock").push(params.clone());
                Ok(params)
            }
        }),
    );
    captured
}

/// Ordered log of `start:<label>` / `end:<label>` entries.
pub type Timeline = Arc<Mutex<Vec<String>>>;

/// Register a handler that sleeps `delay_ms` and records when it starts and ends.
pub fn timed(registry: &HandlerRegistry, name: &str) -> Timeline {
    let timeline = Timeline::default();
    let log = Arc::clone(&timeline);
    register(
        registry,
        name,
        handler_fn(move |params| {
            let log = Arc::clone(&log);
            async move {
                let label = params.get("label").and_then(Value::as_str).unwrap_or("?").to_string();
                let delay_ms = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                log.lock().expect("timeline lock").push(format!("start:{label}"));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                log.lock().expect("timeline lock").push(format!("end:{label}"));
                Ok(params)
            }
        }),
    );
    timeline
}

pub fn step_status(record: &ExecutionRecord, step_id: &str) -> StepStatus {
    record.step(step_id).map(|step| step.status).expect("step present")
}
