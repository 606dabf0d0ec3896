//! Run configuration supplied at submission time.
//!
//! A [`RunConfig`] is a nested key-value structure keyed by step name,
//! plus top-level execution settings (mode, concurrency, resource pool
//! limits, priority tags). The plan builder validates it strictly:
//! every required key must be present, unknown keys are errors rather
//! than being silently ignored, and all mismatches are collected before
//! any are reported.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use miette::Diagnostic;
use thiserror::Error;

/// Per-step configuration: config values consumed by the compute body,
/// and explicit input values that stand in for upstream outputs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub config: FxHashMap<String, Value>,
    #[serde(default)]
    pub inputs: FxHashMap<String, Value>,
}

/// Execution backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Global cap on simultaneously started steps.
    pub max_concurrent: usize,
    /// Per-resource-key pool sizes; a resource not listed here is
    /// unlimited.
    #[serde(default)]
    pub resources: FxHashMap<String, usize>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let max_concurrent = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ExecutionConfig {
            max_concurrent,
            resources: FxHashMap::default(),
        }
    }
}

/// Complete run configuration.
///
/// # Examples
///
/// ```rust
/// use runloom::config::RunConfig;
/// use serde_json::json;
///
/// let config = RunConfig::new("default")
///     .with_step_config("train", "learning_rate", json!(0.1))
///     .with_step_input("report", "metrics", json!({"auc": 0.93}))
///     .with_priority("train", 10);
/// assert_eq!(config.mode, "default");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    pub mode: String,
    #[serde(default)]
    pub steps: FxHashMap<String, StepConfig>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Explicit dispatch priorities keyed by step; higher runs first
    /// among simultaneously-ready steps. Unlisted steps default to 0.
    #[serde(default)]
    pub priorities: FxHashMap<String, i64>,
    #[serde(default)]
    pub tags: FxHashMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl RunConfig {
    #[must_use]
    pub fn new(mode: impl Into<String>) -> Self {
        RunConfig {
            mode: mode.into(),
            steps: FxHashMap::default(),
            execution: ExecutionConfig::default(),
            priorities: FxHashMap::default(),
            tags: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_step_config(
        mut self,
        step: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.steps
            .entry(step.into())
            .or_default()
            .config
            .insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_step_input(
        mut self,
        step: impl Into<String>,
        input: impl Into<String>,
        value: Value,
    ) -> Self {
        self.steps
            .entry(step.into())
            .or_default()
            .inputs
            .insert(input.into(), value);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, step: impl Into<String>, priority: i64) -> Self {
        self.priorities.insert(step.into(), priority);
        self
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.execution.max_concurrent = if limit == 0 { 1 } else { limit };
        self
    }

    #[must_use]
    pub fn with_resource_limit(mut self, resource: impl Into<String>, limit: usize) -> Self {
        self.execution.resources.insert(resource.into(), limit);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Priority for a step, defaulting to 0.
    #[must_use]
    pub fn priority_of(&self, step: &str) -> i64 {
        self.priorities.get(step).copied().unwrap_or(0)
    }
}

/// A single configuration mismatch found at plan-build time.
///
/// These are collected, never reported one at a time; see
/// [`crate::plan::PlanError::InvalidConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ConfigError {
    #[error("step {step}: missing required config key {key}")]
    #[diagnostic(code(runloom::config::missing_key))]
    MissingConfigKey { step: String, key: String },

    #[error("step {step}: unknown config key {key}")]
    #[diagnostic(
        code(runloom::config::unknown_key),
        help("Unknown keys are rejected rather than silently ignored.")
    )]
    UnknownConfigKey { step: String, key: String },

    #[error("config references unknown step {step}")]
    #[diagnostic(code(runloom::config::unknown_step))]
    UnknownStep { step: String },

    #[error("step {step}: input {input} is unresolved (no upstream, no config value)")]
    #[diagnostic(code(runloom::config::unresolved_input))]
    UnresolvedInput { step: String, input: String },

    #[error(
        "step {step}: input {input} is produced by {excluded_upstream}, which is outside the \
         selected subset; supply it explicitly in config"
    )]
    #[diagnostic(
        code(runloom::config::missing_subset_input),
        help("Add the value under steps.<step>.inputs.<input> in run config.")
    )]
    MissingSubsetInput {
        step: String,
        input: String,
        excluded_upstream: String,
    },
}
