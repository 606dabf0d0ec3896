//! In-process execution backend.
//!
//! Runs compute bodies as spawned tokio tasks in the engine's own
//! process. Input loading, output materialization, and terminal event
//! emission all happen inside the spawned task, so the scheduler only
//! ever sees the resulting event stream.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::events::{EventPayload, FailureInfo, RunEvent};
use crate::executor::{ComputeContext, InputValue, StepExecutor, StepInvocation};
use crate::io::{IoManager, OutputAddress};

/// [`StepExecutor`] running computes on the local tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct InProcessExecutor;

impl InProcessExecutor {
    #[must_use]
    pub fn new() -> Self {
        InProcessExecutor
    }
}

impl StepExecutor for InProcessExecutor {
    fn execute(
        &self,
        invocation: StepInvocation,
        io: Arc<dyn IoManager>,
    ) -> BoxStream<'static, RunEvent> {
        let (tx, rx) = flume::unbounded();
        tokio::spawn(run_invocation(invocation, io, tx));
        rx.into_stream().boxed()
    }
}

#[instrument(skip_all, fields(run = %invocation.run_id, step = %invocation.step))]
async fn run_invocation(
    invocation: StepInvocation,
    io: Arc<dyn IoManager>,
    tx: flume::Sender<RunEvent>,
) {
    let run_id = invocation.run_id.clone();
    let step = invocation.step.clone();
    let fail = |tx: &flume::Sender<RunEvent>, failure: FailureInfo| {
        let _ = tx.send(RunEvent::step_scoped(
            run_id.clone(),
            step.clone(),
            EventPayload::StepFailed { failure },
        ));
    };

    // Resolve inputs before touching the compute. A missing artifact is
    // a step failure, not an engine failure.
    let mut inputs: FxHashMap<String, Value> = FxHashMap::default();
    for input in &invocation.inputs {
        match &input.value {
            InputValue::Literal(value) => {
                inputs.insert(input.name.clone(), value.clone());
            }
            InputValue::Stored(address) => match io.load_input(address).await {
                Ok(value) => {
                    inputs.insert(input.name.clone(), value);
                }
                Err(err) => {
                    fail(&tx, FailureInfo::from_error(&err));
                    return;
                }
            },
            InputValue::Absent => {}
        }
    }

    if *invocation.cancel.borrow() {
        fail(&tx, FailureInfo::msg("canceled before start"));
        return;
    }

    // Forward compute messages into the event stream as they arrive.
    let (msg_tx, msg_rx) = flume::unbounded::<String>();
    let forward_tx = tx.clone();
    let forward_run = run_id.clone();
    let forward_step = step.clone();
    let forwarder = tokio::spawn(async move {
        while let Ok(message) = msg_rx.recv_async().await {
            let _ = forward_tx.send(RunEvent::step_scoped(
                forward_run.clone(),
                forward_step.clone(),
                EventPayload::StepMessage { message },
            ));
        }
    });

    let ctx = ComputeContext {
        run_id: run_id.clone(),
        step: step.clone(),
        config: invocation.config.clone(),
        inputs,
        messages: msg_tx,
        cancel: invocation.cancel.clone(),
    };

    // The compute runs in its own task so a panic is contained there
    // and still yields a terminal event instead of a silent stall.
    let compute = Arc::clone(&invocation.compute);
    let result = match tokio::spawn(async move { compute.run(ctx).await }).await {
        Ok(result) => result,
        Err(join_err) => {
            let _ = forwarder.await;
            fail(
                &tx,
                FailureInfo::msg(format!("compute panicked: {join_err}")),
            );
            return;
        }
    };
    // Context (and its sender) is consumed by the compute; once the
    // compute returns the channel closes and the forwarder drains out.
    let _ = forwarder.await;

    let mut output = match result {
        Ok(output) => output,
        Err(err) => {
            fail(&tx, FailureInfo::from_error(&err));
            return;
        }
    };

    // The declared interface is a contract in both directions: every
    // declared output must be produced, and nothing undeclared may be.
    for name in output.names() {
        if !invocation.outputs.iter().any(|o| o == name) {
            fail(
                &tx,
                FailureInfo::msg(format!("compute produced undeclared output {name}")),
            );
            return;
        }
    }
    for name in &invocation.outputs {
        let Some(value) = output.take(name) else {
            fail(
                &tx,
                FailureInfo::msg(format!("compute did not produce declared output {name}")),
            );
            return;
        };
        let address = OutputAddress::new(run_id.clone(), step.clone(), name.clone());
        if let Err(err) = io
            .handle_output(&address, invocation.version.as_ref(), value)
            .await
        {
            warn!(%address, error = %err, "output materialization failed");
            fail(&tx, FailureInfo::from_error(&err));
            return;
        }
        let _ = tx.send(RunEvent::step_scoped(
            run_id.clone(),
            step.clone(),
            EventPayload::OutputHandled {
                output: name.clone(),
                address,
                version: invocation.version.clone(),
            },
        ));
    }

    let _ = tx.send(RunEvent::step_scoped(
        run_id,
        step,
        EventPayload::StepSucceeded {
            version: invocation.version,
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ComputeOutput, FnCompute, ResolvedInput};
    use crate::io::InMemoryIoManager;
    use crate::types::{RunId, StepKey};
    use serde_json::json;
    use tokio::sync::watch;

    fn invocation(
        compute: Arc<dyn crate::executor::Compute>,
        inputs: Vec<ResolvedInput>,
        outputs: Vec<String>,
    ) -> StepInvocation {
        let (_tx, cancel) = watch::channel(false);
        StepInvocation {
            run_id: RunId::new("r1"),
            step: StepKey::new("work"),
            attempt: 1,
            config: json!({"n": 21}),
            inputs,
            outputs,
            version: None,
            compute,
            cancel,
        }
    }

    async fn collect(mut stream: BoxStream<'static, RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Some(event) = stream.next().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn success_materializes_outputs_then_terminates() {
        let io = Arc::new(InMemoryIoManager::new());
        let compute = FnCompute::arc(|ctx| async move {
            let n = ctx.config("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(ComputeOutput::single(json!(n * 2)))
        });
        let events = collect(InProcessExecutor::new().execute(
            invocation(compute, vec![], vec!["result".into()]),
            io.clone(),
        ))
        .await;

        assert!(matches!(
            events.last().unwrap().payload,
            EventPayload::StepSucceeded { .. }
        ));
        let addr = OutputAddress::new(RunId::new("r1"), StepKey::new("work"), "result");
        assert_eq!(io.load_input(&addr).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn missing_declared_output_fails_the_step() {
        let io = Arc::new(InMemoryIoManager::new());
        let compute = FnCompute::arc(|_ctx| async move { Ok(ComputeOutput::empty()) });
        let events = collect(InProcessExecutor::new().execute(
            invocation(compute, vec![], vec!["result".into()]),
            io,
        ))
        .await;

        let EventPayload::StepFailed { failure } = &events.last().unwrap().payload else {
            panic!("expected failure");
        };
        assert!(failure.message.contains("declared output"));
    }

    #[tokio::test]
    async fn stored_inputs_are_loaded_before_the_compute_runs() {
        let io = Arc::new(InMemoryIoManager::new());
        let upstream = OutputAddress::new(RunId::new("r0"), StepKey::new("up"), "result");
        io.handle_output(&upstream, None, json!(7)).await.unwrap();

        let compute = FnCompute::arc(|ctx| async move {
            let v = ctx.require_input("seed")?.as_i64().unwrap_or(0);
            Ok(ComputeOutput::single(json!(v + 1)))
        });
        let events = collect(InProcessExecutor::new().execute(
            invocation(
                compute,
                vec![ResolvedInput {
                    name: "seed".into(),
                    value: InputValue::Stored(upstream),
                }],
                vec!["result".into()],
            ),
            io.clone(),
        ))
        .await;

        assert!(matches!(
            events.last().unwrap().payload,
            EventPayload::StepSucceeded { .. }
        ));
        let addr = OutputAddress::new(RunId::new("r1"), StepKey::new("work"), "result");
        assert_eq!(io.load_input(&addr).await.unwrap(), json!(8));
    }

    #[tokio::test]
    async fn panicking_compute_fails_the_step() {
        let io = Arc::new(InMemoryIoManager::new());
        let compute = FnCompute::arc(|_ctx| async move {
            panic!("kaboom");
            #[allow(unreachable_code)]
            Ok(ComputeOutput::empty())
        });
        let events = collect(InProcessExecutor::new().execute(
            invocation(compute, vec![], vec!["result".into()]),
            io,
        ))
        .await;

        let EventPayload::StepFailed { failure } = &events.last().unwrap().payload else {
            panic!("expected failure");
        };
        assert!(failure.message.contains("panicked"));
    }

    #[tokio::test]
    async fn messages_flow_into_the_event_stream() {
        let io = Arc::new(InMemoryIoManager::new());
        let compute = FnCompute::arc(|ctx| async move {
            ctx.emit("halfway");
            Ok(ComputeOutput::single(json!(null)))
        });
        let events = collect(InProcessExecutor::new().execute(
            invocation(compute, vec![], vec!["result".into()]),
            io,
        ))
        .await;

        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::StepMessage { message } if message == "halfway"
        )));
    }
}
