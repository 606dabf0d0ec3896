//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use runloom::events::{EventPayload, InMemoryEventLog, StoredEvent};
use runloom::executor::{ComputeOutput, FnCompute, InProcessExecutor};
use runloom::graph::{GraphBuilder, GraphDefinition, InputDef, OutputDef, StepNode};
use runloom::io::InMemoryIoManager;
use runloom::run::RunCoordinator;

pub struct Harness {
    pub log: Arc<InMemoryEventLog>,
    pub io: Arc<InMemoryIoManager>,
    pub coordinator: RunCoordinator,
}

pub fn harness() -> Harness {
    runloom::utils::init_tracing();
    let log = Arc::new(InMemoryEventLog::new());
    let io = Arc::new(InMemoryIoManager::new());
    let coordinator = RunCoordinator::new(
        log.clone(),
        io.clone(),
        Arc::new(InProcessExecutor::new()),
    );
    Harness {
        log,
        io,
        coordinator,
    }
}

/// A versioned step that sums its integer inputs, adds the optional
/// `add` config value, and adds 1, emitting the total as `result`.
pub fn sum_step(name: &str, upstreams: &[&str]) -> StepNode {
    sum_step_with_config(name, upstreams, &[])
}

pub fn sum_step_with_config(name: &str, upstreams: &[&str], config_keys: &[&str]) -> StepNode {
    let names: Vec<String> = upstreams.iter().map(|u| u.to_string()).collect();
    StepNode {
        name: name.into(),
        inputs: upstreams
            .iter()
            .map(|u| InputDef::upstream(*u, *u, "result"))
            .collect(),
        outputs: vec![OutputDef::result()],
        required_config: config_keys.iter().map(|k| k.to_string()).collect(),
        resource_keys: vec![],
        tolerant: false,
        code_version: Some("v1".into()),
        compute: FnCompute::arc(move |ctx| {
            let names = names.clone();
            async move {
                let mut total: i64 = 1;
                for name in &names {
                    if let Some(value) = ctx.input(name) {
                        total += value.as_i64().unwrap_or(0);
                    }
                }
                total += ctx.config("add").and_then(Value::as_i64).unwrap_or(0);
                Ok(ComputeOutput::single(json!(total)))
            }
        }),
    }
}

/// A step that always fails with the given message.
pub fn failing_step(name: &str, upstreams: &[&str], message: &str) -> StepNode {
    let message = message.to_string();
    let mut step = sum_step(name, upstreams);
    step.compute = FnCompute::arc(move |_ctx| {
        let message = message.clone();
        async move { Err(runloom::executor::ComputeError::msg(message)) }
    });
    step
}

/// `a -> b -> d`, `a -> c -> d`.
pub fn diamond() -> GraphDefinition {
    GraphBuilder::new("diamond")
        .add_step(sum_step("a", &[]))
        .add_step(sum_step("b", &["a"]))
        .add_step(sum_step("c", &["a"]))
        .add_step(sum_step("d", &["b", "c"]))
        .build()
        .expect("diamond graph is valid")
}

/// Step names of `StepStarted` events, in log order.
pub fn started_order(events: &[StoredEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| matches!(e.event.payload, EventPayload::StepStarted { .. }))
        .filter_map(|e| e.event.step.as_ref().map(|s| s.as_str().to_string()))
        .collect()
}

/// Count of `StepStarted` events for one step.
pub fn start_count(events: &[StoredEvent], step: &str) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e.event.payload, EventPayload::StepStarted { .. })
                && e.event.step.as_ref().is_some_and(|s| s.as_str() == step)
        })
        .count()
}
