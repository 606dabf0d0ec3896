//! Execution plans: the flattened, validated, schedulable form of a
//! graph.
//!
//! A plan is produced once per run by [`PlanBuilder`]: composites are
//! inlined, every input is bound to either a concrete upstream step
//! output or a literal from run config, the requested step subset is
//! applied, and the whole thing is put in deterministic topological
//! order. Downstream components (resolver, scheduler) never see graphs,
//! only plans.

mod builder;
mod selection;

pub use builder::PlanBuilder;
pub use selection::StepSelection;

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::executor::Compute;
use crate::types::StepKey;

/// Where a plan-level input gets its value.
#[derive(Clone, Debug)]
pub enum InputSource {
    /// A selected upstream step's named output.
    Upstream { step: StepKey, output: String },
    /// A literal supplied through run config (external inputs, and
    /// inputs whose producer was excluded by the step selection).
    Literal(Value),
}

/// One named, fully bound input of a plan step.
#[derive(Clone, Debug)]
pub struct PlanInput {
    pub name: String,
    pub source: InputSource,
}

/// One flattened, schedulable step.
#[derive(Clone)]
pub struct StepDefinition {
    pub key: StepKey,
    pub inputs: Vec<PlanInput>,
    pub outputs: Vec<String>,
    /// Validated config for this step, keyed by declared config key.
    pub config: serde_json::Map<String, Value>,
    pub resource_keys: Vec<String>,
    pub tolerant: bool,
    pub code_version: Option<String>,
    pub priority: i64,
    pub compute: Arc<dyn Compute>,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("key", &self.key)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs)
            .field("tolerant", &self.tolerant)
            .field("priority", &self.priority)
            .finish()
    }
}

impl StepDefinition {
    /// Distinct upstream step keys, in input declaration order.
    #[must_use]
    pub fn upstream_keys(&self) -> Vec<&StepKey> {
        let mut seen: Vec<&StepKey> = Vec::new();
        for input in &self.inputs {
            if let InputSource::Upstream { step, .. } = &input.source {
                if !seen.contains(&step) {
                    seen.push(step);
                }
            }
        }
        seen
    }

    /// This step's config as a JSON object value (for version hashing).
    #[must_use]
    pub fn config_value(&self) -> Value {
        Value::Object(self.config.clone())
    }
}

/// An immutable, topologically ordered plan.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub job: String,
    pub mode: String,
    steps: Vec<StepDefinition>,
    index: FxHashMap<StepKey, usize>,
    dependents: FxHashMap<StepKey, Vec<StepKey>>,
}

impl ExecutionPlan {
    pub(crate) fn new(job: String, mode: String, steps: Vec<StepDefinition>) -> Self {
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.clone(), i))
            .collect();
        let mut dependents: FxHashMap<StepKey, Vec<StepKey>> = FxHashMap::default();
        for step in &steps {
            for up in step.upstream_keys() {
                dependents.entry(up.clone()).or_default().push(step.key.clone());
            }
        }
        ExecutionPlan {
            job,
            mode,
            steps,
            index,
            dependents,
        }
    }

    /// Steps in topological order. Order is deterministic: dependency
    /// order first, graph declaration order as the tie-break.
    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    #[must_use]
    pub fn step(&self, key: &StepKey) -> Option<&StepDefinition> {
        self.index.get(key).map(|i| &self.steps[*i])
    }

    /// Position in the topological order; the scheduler's dispatch
    /// tie-break.
    #[must_use]
    pub fn index_of(&self, key: &StepKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Steps that consume any output of `key`.
    #[must_use]
    pub fn dependents_of(&self, key: &StepKey) -> &[StepKey] {
        self.dependents.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Failures while building a plan.
#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    /// All configuration mismatches found, reported together.
    #[error("run config is invalid ({} problem(s))", errors.len())]
    #[diagnostic(code(runloom::plan::invalid_config))]
    InvalidConfig {
        #[related]
        errors: Vec<ConfigError>,
    },

    #[error("selection references unknown step {name}")]
    #[diagnostic(code(runloom::plan::unknown_selection_step))]
    UnknownSelectionStep { name: String },

    #[error("malformed selection token {token}")]
    #[diagnostic(
        code(runloom::plan::bad_selection_token),
        help(
            "Tokens are `name`, `+name`/`name+` (plus signs stack per generation), \
             `*name`/`name*` for the full closure, or `*` alone for everything."
        )
    )]
    BadSelectionToken { token: String },

    #[error("selection matched no steps")]
    #[diagnostic(code(runloom::plan::empty_plan))]
    EmptyPlan,

    #[error("composite {composite}: inner input {inner_node}.{inner_input} has no mapping")]
    #[diagnostic(
        code(runloom::plan::unmapped_composite_input),
        help("Every externally-bound inner input must appear in the composite's input list.")
    )]
    UnmappedCompositeInput {
        composite: String,
        inner_node: String,
        inner_input: String,
    },
}
