//! Execution backends and the compute-body contract.
//!
//! A step's work is a [`Compute`] implementation. The engine hands it a
//! [`ComputeContext`] carrying resolved inputs, config, a message
//! emitter, and a cancellation signal, and expects a [`ComputeOutput`]
//! naming every declared output.
//!
//! The scheduler never runs computes directly; it hands a
//! [`StepInvocation`] to a [`StepExecutor`] and consumes the resulting
//! event stream. The in-process backend lives in
//! [`InProcessExecutor`]; remote backends implement the same trait.

mod in_process;

pub use in_process::InProcessExecutor;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

use miette::Diagnostic;
use thiserror::Error;

use crate::events::RunEvent;
use crate::io::{IoManager, OutputAddress};
use crate::types::{RunId, StepKey};
use crate::version::StepVersion;

/// Failure of a compute body.
#[derive(Debug, Error, Diagnostic)]
pub enum ComputeError {
    #[error("{message}")]
    #[diagnostic(code(runloom::compute::failed))]
    Failed { message: String },

    #[error("input {name} was not provided")]
    #[diagnostic(code(runloom::compute::missing_input))]
    MissingInput { name: String },

    #[error("canceled")]
    #[diagnostic(code(runloom::compute::canceled))]
    Canceled,
}

impl ComputeError {
    pub fn msg(message: impl Into<String>) -> Self {
        ComputeError::Failed {
            message: message.into(),
        }
    }
}

/// Values produced by a compute body, keyed by declared output name.
#[derive(Clone, Debug, Default)]
pub struct ComputeOutput {
    values: FxHashMap<String, Value>,
}

impl ComputeOutput {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The conventional single `result` output.
    #[must_use]
    pub fn single(value: Value) -> Self {
        ComputeOutput::empty().with_output("result", value)
    }

    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }
}

/// Everything a compute body can see and do.
pub struct ComputeContext {
    pub run_id: RunId,
    pub step: StepKey,
    config: Value,
    inputs: FxHashMap<String, Value>,
    messages: flume::Sender<String>,
    cancel: watch::Receiver<bool>,
}

impl ComputeContext {
    /// A resolved input value, absent when a tolerant step's upstream
    /// failed.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// A resolved input value, erroring when absent.
    pub fn require_input(&self, name: &str) -> Result<&Value, ComputeError> {
        self.inputs.get(name).ok_or_else(|| ComputeError::MissingInput {
            name: name.to_string(),
        })
    }

    /// A config value by key.
    #[must_use]
    pub fn config(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Emit a free-form progress message; it lands in the event log as
    /// a step-scoped message event.
    pub fn emit(&self, message: impl Into<String>) {
        let _ = self.messages.send(message.into());
    }

    /// Cooperative cancellation flag; long computes should poll this at
    /// convenient boundaries and return [`ComputeError::Canceled`].
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// One unit of executable work.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to
/// invoke concurrently (one invocation per run at most, but several
/// runs may share a graph).
#[async_trait]
pub trait Compute: Send + Sync {
    async fn run(&self, ctx: ComputeContext) -> Result<ComputeOutput, ComputeError>;
}

/// Adapter turning an async closure into a [`Compute`].
///
/// # Examples
///
/// ```rust
/// use runloom::executor::{ComputeOutput, FnCompute};
/// use serde_json::json;
///
/// let compute = FnCompute::arc(|ctx| async move {
///     let n = ctx.config("n").and_then(|v| v.as_i64()).unwrap_or(0);
///     Ok(ComputeOutput::single(json!(n * 2)))
/// });
/// ```
pub struct FnCompute<F> {
    f: F,
}

impl<F, Fut> FnCompute<F>
where
    F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<ComputeOutput, ComputeError>> + Send + 'static,
{
    #[must_use]
    pub fn arc(f: F) -> Arc<dyn Compute> {
        Arc::new(FnCompute { f })
    }
}

#[async_trait]
impl<F, Fut> Compute for FnCompute<F>
where
    F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<ComputeOutput, ComputeError>> + Send + 'static,
{
    async fn run(&self, ctx: ComputeContext) -> Result<ComputeOutput, ComputeError> {
        (self.f)(ctx).await
    }
}

/// How one input of an invocation gets its value.
#[derive(Clone, Debug)]
pub enum InputValue {
    /// Supplied directly (run config literal).
    Literal(Value),
    /// Load from the I/O manager at execution time.
    Stored(OutputAddress),
    /// The producing upstream failed and this step is tolerant; the
    /// input is simply absent from the context.
    Absent,
}

/// One named, resolved input of an invocation.
#[derive(Clone, Debug)]
pub struct ResolvedInput {
    pub name: String,
    pub value: InputValue,
}

/// A fully resolved step handed to an execution backend.
pub struct StepInvocation {
    pub run_id: RunId,
    pub step: StepKey,
    pub attempt: u32,
    pub config: Value,
    pub inputs: Vec<ResolvedInput>,
    /// Declared output names; the compute must produce exactly these.
    pub outputs: Vec<String>,
    pub version: Option<StepVersion>,
    pub compute: Arc<dyn Compute>,
    pub cancel: watch::Receiver<bool>,
}

/// An execution backend.
///
/// `execute` returns immediately with a stream of step-scoped events:
/// zero or more message and output events, then exactly one terminal
/// event (succeeded or failed). The scheduler persists each event as it
/// arrives; the backend never touches the log itself.
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        invocation: StepInvocation,
        io: Arc<dyn IoManager>,
    ) -> BoxStream<'static, RunEvent>;
}
