//! Helpers shared by unit and integration tests.

pub mod mock_backends;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use modelgate_backends::BackendRegistry;
use modelgate_common::Record;

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::AppState;

pub use mock_backends::{CountingBackend, FixedOutputBackend, SlowBackend};

/// Built-in backends plus a `slow` echo backend.
pub fn slow_registry(delay: Duration) -> BackendRegistry {
    let mut registry = BackendRegistry::with_builtin();
    registry.register("slow", move || Box::new(SlowBackend::new(delay)));
    registry
}

/// Built-in backends plus a `counting` echo backend and its call counter.
pub fn counting_registry() -> (BackendRegistry, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = BackendRegistry::with_builtin();
    let counter = calls.clone();
    registry.register("counting", move || Box::new(CountingBackend::new(counter.clone())));
    (registry, calls)
}

/// Built-in backends plus a `fixed` backend answering with `output`.
pub fn fixed_registry(output: Record) -> BackendRegistry {
    let mut registry = BackendRegistry::with_builtin();
    registry.register("fixed", move || Box::new(FixedOutputBackend::new(output.clone())));
    registry
}

/// The `second = first + 2` script step.
pub fn script_step() -> serde_json::Value {
    json!({
        "type": "script",
        "name": "add",
        "code": "second = first + 2",
        "inputs": [{"name": "first", "kind": "list"}],
        "outputs": [{"name": "second", "kind": "list"}]
    })
}

/// A validated configuration running `steps`.
pub fn config_with_steps(steps: Vec<serde_json::Value>) -> GatewayConfig {
    let config: GatewayConfig = serde_json::from_value(json!({
        "listenHost": "127.0.0.1",
        "logging": {"level": "debug"},
        "pipeline": {"steps": steps}
    }))
    .unwrap();
    config.validate().unwrap();
    config
}

pub fn test_config() -> GatewayConfig {
    config_with_steps(vec![script_step()])
}

/// Build and start the pipeline described by `config`, ready for traffic.
pub async fn create_test_state(config: GatewayConfig, registry: BackendRegistry) -> Result<Arc<AppState>> {
    let state = AppState::start(config, &registry).await?;
    state.lifecycle.mark_running();
    Ok(state)
}
