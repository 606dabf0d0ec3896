//! Graph-to-plan resolution.
//!
//! [`PlanBuilder`] inlines composite nodes, binds every input to a
//! concrete source, applies the step selection, validates run config
//! strictly (collecting every mismatch before reporting), and emits the
//! plan in deterministic topological order.

use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::{ConfigError, RunConfig};
use crate::executor::Compute;
use crate::graph::{CompositeNode, GraphDefinition, GraphNode, InputBinding};
use crate::plan::{
    ExecutionPlan, InputSource, PlanError, PlanInput, StepDefinition, StepSelection,
};
use crate::types::StepKey;

/// Builds an [`ExecutionPlan`] from a graph, a run config, and a step
/// selection.
///
/// # Examples
///
/// ```rust
/// use runloom::graph::{GraphBuilder, StepNode, OutputDef};
/// use runloom::config::RunConfig;
/// use runloom::plan::{PlanBuilder, StepSelection};
/// use runloom::executor::{ComputeOutput, FnCompute};
/// use serde_json::json;
///
/// let graph = GraphBuilder::new("demo")
///     .add_step(StepNode {
///         name: "only".into(),
///         inputs: vec![],
///         outputs: vec![OutputDef::result()],
///         required_config: vec![],
///         resource_keys: vec![],
///         tolerant: false,
///         code_version: None,
///         compute: FnCompute::arc(|_| async { Ok(ComputeOutput::single(json!(1))) }),
///     })
///     .build()
///     .unwrap();
/// let plan = PlanBuilder::new(&graph, &RunConfig::default())
///     .select(StepSelection::all())
///     .build()
///     .unwrap();
/// assert_eq!(plan.len(), 1);
/// ```
pub struct PlanBuilder<'a> {
    graph: &'a GraphDefinition,
    config: &'a RunConfig,
    selection: StepSelection,
}

impl<'a> PlanBuilder<'a> {
    #[must_use]
    pub fn new(graph: &'a GraphDefinition, config: &'a RunConfig) -> Self {
        PlanBuilder {
            graph,
            config,
            selection: StepSelection::all(),
        }
    }

    #[must_use]
    pub fn select(mut self, selection: StepSelection) -> Self {
        self.selection = selection;
        self
    }

    #[instrument(skip_all, fields(graph = %self.graph.name))]
    pub fn build(self) -> Result<ExecutionPlan, PlanError> {
        let mut flat = Vec::new();
        flatten(self.graph, None, None, &mut flat)?;

        let keys: Vec<StepKey> = flat.iter().map(|s| s.key.clone()).collect();
        let mut upstreams: FxHashMap<StepKey, Vec<StepKey>> = FxHashMap::default();
        let mut dependents: FxHashMap<StepKey, Vec<StepKey>> = FxHashMap::default();
        for step in &flat {
            for (_, binding) in &step.inputs {
                if let FlatBinding::Step { step: up, .. } = binding {
                    upstreams.entry(step.key.clone()).or_default().push(up.clone());
                    dependents.entry(up.clone()).or_default().push(step.key.clone());
                }
            }
        }
        let selected = self.selection.resolve(&keys, &upstreams, &dependents)?;

        let mut errors = Vec::new();
        let known: FxHashSet<&StepKey> = keys.iter().collect();
        for configured in self.config.steps.keys() {
            if !known.contains(&StepKey::new(configured.clone())) {
                errors.push(ConfigError::UnknownStep {
                    step: configured.clone(),
                });
            }
        }

        let mut steps = Vec::new();
        for flat_step in &flat {
            if !selected.contains(&flat_step.key) {
                continue;
            }
            if let Some(step) = self.resolve_step(flat_step, &selected, &mut errors) {
                steps.push(step);
            }
        }
        if !errors.is_empty() {
            return Err(PlanError::InvalidConfig { errors });
        }

        let ordered = topo_order(steps);
        debug!(steps = ordered.len(), "plan built");
        Ok(ExecutionPlan::new(
            self.graph.name.clone(),
            self.config.mode.clone(),
            ordered,
        ))
    }

    /// Validate one selected step's config and bind its inputs. Returns
    /// `None` when errors were pushed (the step cannot be materialized,
    /// but validation of the remaining steps continues).
    fn resolve_step(
        &self,
        flat_step: &FlatStep,
        selected: &FxHashSet<StepKey>,
        errors: &mut Vec<ConfigError>,
    ) -> Option<StepDefinition> {
        let step_name = flat_step.key.as_str();
        let step_config = self.config.steps.get(step_name);
        let before = errors.len();

        let mut config = serde_json::Map::new();
        for key in &flat_step.required_config {
            match step_config.and_then(|c| c.config.get(key)) {
                Some(value) => {
                    config.insert(key.clone(), value.clone());
                }
                None => errors.push(ConfigError::MissingConfigKey {
                    step: step_name.to_string(),
                    key: key.clone(),
                }),
            }
        }
        if let Some(step_config) = step_config {
            for key in step_config.config.keys() {
                if !flat_step.required_config.contains(key) {
                    errors.push(ConfigError::UnknownConfigKey {
                        step: step_name.to_string(),
                        key: key.clone(),
                    });
                }
            }
            let declared: FxHashSet<&str> =
                flat_step.inputs.iter().map(|(n, _)| n.as_str()).collect();
            for input in step_config.inputs.keys() {
                if !declared.contains(input.as_str()) {
                    errors.push(ConfigError::UnknownConfigKey {
                        step: step_name.to_string(),
                        key: format!("inputs.{input}"),
                    });
                }
            }
        }

        let mut inputs = Vec::new();
        for (name, binding) in &flat_step.inputs {
            let literal = step_config.and_then(|c| c.inputs.get(name));
            let source = match (binding, literal) {
                // An explicit config input always wins; it is how subset
                // runs and pinned-input experiments are fed.
                (_, Some(value)) => InputSource::Literal(value.clone()),
                (FlatBinding::Step { step, output }, None) => {
                    if selected.contains(step) {
                        InputSource::Upstream {
                            step: step.clone(),
                            output: output.clone(),
                        }
                    } else {
                        errors.push(ConfigError::MissingSubsetInput {
                            step: step_name.to_string(),
                            input: name.clone(),
                            excluded_upstream: step.as_str().to_string(),
                        });
                        continue;
                    }
                }
                (FlatBinding::External, None) => {
                    errors.push(ConfigError::UnresolvedInput {
                        step: step_name.to_string(),
                        input: name.clone(),
                    });
                    continue;
                }
            };
            inputs.push(PlanInput {
                name: name.clone(),
                source,
            });
        }

        if errors.len() > before {
            return None;
        }
        Some(StepDefinition {
            key: flat_step.key.clone(),
            inputs,
            outputs: flat_step.outputs.clone(),
            config,
            resource_keys: flat_step.resource_keys.clone(),
            tolerant: flat_step.tolerant,
            code_version: flat_step.code_version.clone(),
            priority: self.config.priority_of(step_name),
            compute: Arc::clone(&flat_step.compute),
        })
    }
}

/// A leaf step with composite scoping already resolved away.
struct FlatStep {
    key: StepKey,
    inputs: Vec<(String, FlatBinding)>,
    outputs: Vec<String>,
    required_config: Vec<String>,
    resource_keys: Vec<String>,
    tolerant: bool,
    code_version: Option<String>,
    compute: Arc<dyn Compute>,
}

#[derive(Clone, Debug)]
enum FlatBinding {
    Step { step: StepKey, output: String },
    External,
}

fn key_of(prefix: Option<&StepKey>, name: &str) -> StepKey {
    match prefix {
        Some(p) => p.child(name),
        None => StepKey::new(name),
    }
}

/// Resolve a node-level output reference down to the leaf step that
/// actually produces it, walking through composite output mappings.
fn resolve_output(
    graph: &GraphDefinition,
    prefix: Option<&StepKey>,
    node_name: &str,
    output_name: &str,
) -> (StepKey, String) {
    let node = graph
        .node(node_name)
        .expect("validated graph: upstream node exists");
    match node {
        GraphNode::Leaf(_) => (key_of(prefix, node_name), output_name.to_string()),
        GraphNode::Composite(c) => {
            let mapping = c
                .outputs
                .iter()
                .find(|o| o.name == output_name)
                .expect("validated graph: composite output exists");
            let inner_prefix = key_of(prefix, &c.name);
            resolve_output(&c.graph, Some(&inner_prefix), &mapping.inner_node, &mapping.inner_output)
        }
    }
}

/// Recursively inline a graph. `external` maps an inner `(node, input)`
/// to its binding in the outermost scope; `None` marks the top level,
/// where unmapped externals are legitimate (fed by run config).
fn flatten(
    graph: &GraphDefinition,
    prefix: Option<&StepKey>,
    external: Option<&ExternalMap>,
    out: &mut Vec<FlatStep>,
) -> Result<(), PlanError> {
    for node in graph.nodes() {
        match node {
            GraphNode::Leaf(step) => {
                let key = key_of(prefix, &step.name);
                let mut inputs = Vec::new();
                for input in &step.inputs {
                    let binding = match &input.binding {
                        InputBinding::Upstream { node, output } => {
                            let (step_key, output) =
                                resolve_output(graph, prefix, node, output);
                            FlatBinding::Step {
                                step: step_key,
                                output,
                            }
                        }
                        InputBinding::External => match external {
                            None => FlatBinding::External,
                            Some(map) => map
                                .resolve(&step.name, &input.name)
                                .ok_or_else(|| PlanError::UnmappedCompositeInput {
                                    composite: map.composite.clone(),
                                    inner_node: step.name.clone(),
                                    inner_input: input.name.clone(),
                                })?,
                        },
                    };
                    inputs.push((input.name.clone(), binding));
                }
                out.push(FlatStep {
                    key,
                    inputs,
                    outputs: step.outputs.iter().map(|o| o.name.clone()).collect(),
                    required_config: step.required_config.clone(),
                    resource_keys: step.resource_keys.clone(),
                    tolerant: step.tolerant,
                    code_version: step.code_version.clone(),
                    compute: Arc::clone(&step.compute),
                });
            }
            GraphNode::Composite(c) => {
                let inner_prefix = key_of(prefix, &c.name);
                let map = composite_external_map(graph, prefix, external, c)?;
                flatten(&c.graph, Some(&inner_prefix), Some(&map), out)?;
            }
        }
    }
    Ok(())
}

struct ExternalMap {
    composite: String,
    entries: FxHashMap<(String, String), FlatBinding>,
}

impl ExternalMap {
    fn resolve(&self, node: &str, input: &str) -> Option<FlatBinding> {
        self.entries
            .get(&(node.to_string(), input.to_string()))
            .cloned()
    }
}

/// Resolve a composite's declared inputs into bindings usable by its
/// inner graph.
fn composite_external_map(
    graph: &GraphDefinition,
    prefix: Option<&StepKey>,
    external: Option<&ExternalMap>,
    composite: &CompositeNode,
) -> Result<ExternalMap, PlanError> {
    let mut entries = FxHashMap::default();
    for mapping in &composite.inputs {
        let binding = match &mapping.binding {
            InputBinding::Upstream { node, output } => {
                let (step, output) = resolve_output(graph, prefix, node, output);
                FlatBinding::Step { step, output }
            }
            InputBinding::External => match external {
                None => FlatBinding::External,
                Some(map) => map.resolve(&composite.name, &mapping.name).ok_or_else(|| {
                    PlanError::UnmappedCompositeInput {
                        composite: map.composite.clone(),
                        inner_node: composite.name.clone(),
                        inner_input: mapping.name.clone(),
                    }
                })?,
            },
        };
        entries.insert(
            (mapping.inner_node.clone(), mapping.inner_input.clone()),
            binding,
        );
    }
    Ok(ExternalMap {
        composite: composite.name.clone(),
        entries,
    })
}

/// Kahn's algorithm with the flattening index as the tie-break, so the
/// order is a pure function of the graph and selection.
fn topo_order(steps: Vec<StepDefinition>) -> Vec<StepDefinition> {
    let index: FxHashMap<StepKey, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.key.clone(), i))
        .collect();
    let mut indegree = vec![0usize; steps.len()];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for up in step.upstream_keys() {
            if let Some(&j) = index.get(up) {
                indegree[i] += 1;
                downstream[j].push(i);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &j in &downstream[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    let mut slots: Vec<Option<StepDefinition>> = steps.into_iter().map(Some).collect();
    order
        .into_iter()
        .map(|i| slots[i].take().expect("each step ordered once"))
        .collect()
}
