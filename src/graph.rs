//! Immutable graph definitions consumed by the plan builder.
//!
//! A [`GraphDefinition`] is the validated output of the authoring layer:
//! a set of nodes with typed input/output specs and dependency edges.
//! Nodes are either [`Leaf`](GraphNode::Leaf) steps carrying a compute
//! body, or [`Composite`](GraphNode::Composite) sub-graphs with explicit
//! input/output mappings. The plan builder flattens composites before
//! the scheduler ever sees them, so everything downstream of
//! [`crate::plan`] deals in leaf steps only.
//!
//! The engine assumes structural validation (unique names, no dangling
//! references, acyclicity) happened at authoring time; [`GraphBuilder`]
//! performs that validation for graphs constructed through it.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::executor::Compute;

/// Where a node-level input gets its value from, in the scope of the
/// graph that declares the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputBinding {
    /// Fed by a sibling node's named output.
    Upstream { node: String, output: String },
    /// Must be satisfied externally: by run config for a top-level graph,
    /// or by the enclosing composite's input mapping for a nested one.
    External,
}

/// A named, bound input of a node.
#[derive(Clone, Debug)]
pub struct InputDef {
    pub name: String,
    pub binding: InputBinding,
}

impl InputDef {
    pub fn upstream(
        name: impl Into<String>,
        node: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        InputDef {
            name: name.into(),
            binding: InputBinding::Upstream {
                node: node.into(),
                output: output.into(),
            },
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        InputDef {
            name: name.into(),
            binding: InputBinding::External,
        }
    }
}

/// A named output with a type tag.
///
/// The tag is opaque to the engine; it is carried through to plan
/// metadata so I/O managers and UIs can interpret artifacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputDef {
    pub name: String,
    pub type_tag: String,
}

impl OutputDef {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        OutputDef {
            name: name.into(),
            type_tag: type_tag.into(),
        }
    }

    /// The conventional single output of a step.
    pub fn result() -> Self {
        OutputDef::new("result", "any")
    }
}

/// A leaf step: one unit of executable work.
#[derive(Clone)]
pub struct StepNode {
    pub name: String,
    pub inputs: Vec<InputDef>,
    pub outputs: Vec<OutputDef>,
    /// Config keys the step requires at plan-build time. Any key supplied
    /// in run config that is not listed here is a validation error.
    pub required_config: Vec<String>,
    /// Resource keys whose pool slots must be held while the step runs.
    pub resource_keys: Vec<String>,
    /// Proceed even if an upstream step failed; failed-upstream inputs
    /// are simply absent from the compute context.
    pub tolerant: bool,
    /// Memoization opt-in: a stable identity for the step's code. `None`
    /// means the step is always re-executed.
    pub code_version: Option<String>,
    pub compute: Arc<dyn Compute>,
}

impl std::fmt::Debug for StepNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("tolerant", &self.tolerant)
            .field("code_version", &self.code_version)
            .finish()
    }
}

/// Maps one externally-visible composite input onto an inner node input.
#[derive(Clone, Debug)]
pub struct CompositeInput {
    /// Name visible to the enclosing graph.
    pub name: String,
    /// Binding in the enclosing graph's scope.
    pub binding: InputBinding,
    /// Inner node whose `External` input this feeds.
    pub inner_node: String,
    pub inner_input: String,
}

/// Maps one externally-visible composite output onto an inner node output.
#[derive(Clone, Debug)]
pub struct CompositeOutput {
    pub name: String,
    pub inner_node: String,
    pub inner_output: String,
}

/// A reusable sub-graph embedded as a node.
#[derive(Clone, Debug)]
pub struct CompositeNode {
    pub name: String,
    pub graph: GraphDefinition,
    pub inputs: Vec<CompositeInput>,
    pub outputs: Vec<CompositeOutput>,
}

/// A node of a graph: either a directly executable step or a nested
/// sub-graph that the plan builder inlines.
#[derive(Clone, Debug)]
pub enum GraphNode {
    Leaf(StepNode),
    Composite(CompositeNode),
}

impl GraphNode {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            GraphNode::Leaf(s) => &s.name,
            GraphNode::Composite(c) => &c.name,
        }
    }
}

/// An immutable, validated pipeline graph.
///
/// Node order is the authoring order; the plan builder uses it as the
/// stable tie-break when producing a deterministic topological order.
#[derive(Clone, Debug, Default)]
pub struct GraphDefinition {
    pub name: String,
    nodes: Vec<GraphNode>,
}

impl GraphDefinition {
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }
}

/// Structural errors detected while building a graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate node name: {name}")]
    #[diagnostic(
        code(runloom::graph::duplicate_node),
        help("Node names must be unique within a graph.")
    )]
    DuplicateNode { name: String },

    #[error("node {node} input {input} references unknown node {upstream}")]
    #[diagnostic(code(runloom::graph::dangling_reference))]
    DanglingReference {
        node: String,
        input: String,
        upstream: String,
    },

    #[error("node {node} input {input} references unknown output {output} of {upstream}")]
    #[diagnostic(code(runloom::graph::unknown_output))]
    UnknownOutput {
        node: String,
        input: String,
        upstream: String,
        output: String,
    },

    #[error("dependency cycle involving node {node}")]
    #[diagnostic(
        code(runloom::graph::cycle),
        help("Pipeline graphs must be acyclic.")
    )]
    Cycle { node: String },

    #[error("composite {composite} mapping references unknown inner node {inner}")]
    #[diagnostic(code(runloom::graph::bad_composite_mapping))]
    BadCompositeMapping { composite: String, inner: String },
}

/// Fluent builder for [`GraphDefinition`].
///
/// # Examples
///
/// ```rust
/// use runloom::graph::{GraphBuilder, StepNode, InputDef, OutputDef};
/// use runloom::executor::FnCompute;
/// use serde_json::json;
///
/// let graph = GraphBuilder::new("etl")
///     .add_step(StepNode {
///         name: "extract".into(),
///         inputs: vec![],
///         outputs: vec![OutputDef::result()],
///         required_config: vec![],
///         resource_keys: vec![],
///         tolerant: false,
///         code_version: None,
///         compute: FnCompute::arc(|_ctx| async move {
///             Ok(runloom::executor::ComputeOutput::single(json!([1, 2, 3])))
///         }),
///     })
///     .build()
///     .unwrap();
/// assert_eq!(graph.nodes().len(), 1);
/// ```
pub struct GraphBuilder {
    name: String,
    nodes: Vec<GraphNode>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        GraphBuilder {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_step(mut self, step: StepNode) -> Self {
        self.nodes.push(GraphNode::Leaf(step));
        self
    }

    #[must_use]
    pub fn add_composite(mut self, composite: CompositeNode) -> Self {
        self.nodes.push(GraphNode::Composite(composite));
        self
    }

    /// Validate structure and produce the immutable definition.
    ///
    /// Checks name uniqueness, reference resolution (every upstream
    /// binding names an existing node and output), composite mapping
    /// targets, and acyclicity.
    pub fn build(self) -> Result<GraphDefinition, GraphError> {
        let graph = GraphDefinition {
            name: self.name,
            nodes: self.nodes,
        };
        validate(&graph)?;
        Ok(graph)
    }
}

fn node_outputs(node: &GraphNode) -> Vec<&str> {
    match node {
        GraphNode::Leaf(s) => s.outputs.iter().map(|o| o.name.as_str()).collect(),
        GraphNode::Composite(c) => c.outputs.iter().map(|o| o.name.as_str()).collect(),
    }
}

fn node_bindings(node: &GraphNode) -> Vec<(&str, &InputBinding)> {
    match node {
        GraphNode::Leaf(s) => s
            .inputs
            .iter()
            .map(|i| (i.name.as_str(), &i.binding))
            .collect(),
        GraphNode::Composite(c) => c
            .inputs
            .iter()
            .map(|i| (i.name.as_str(), &i.binding))
            .collect(),
    }
}

fn validate(graph: &GraphDefinition) -> Result<(), GraphError> {
    let mut by_name: FxHashMap<&str, &GraphNode> = FxHashMap::default();
    for node in graph.nodes() {
        if by_name.insert(node.name(), node).is_some() {
            return Err(GraphError::DuplicateNode {
                name: node.name().to_string(),
            });
        }
    }

    for node in graph.nodes() {
        for (input, binding) in node_bindings(node) {
            if let InputBinding::Upstream {
                node: upstream,
                output,
            } = binding
            {
                let Some(up) = by_name.get(upstream.as_str()) else {
                    return Err(GraphError::DanglingReference {
                        node: node.name().to_string(),
                        input: input.to_string(),
                        upstream: upstream.clone(),
                    });
                };
                if !node_outputs(up).contains(&output.as_str()) {
                    return Err(GraphError::UnknownOutput {
                        node: node.name().to_string(),
                        input: input.to_string(),
                        upstream: upstream.clone(),
                        output: output.clone(),
                    });
                }
            }
        }

        if let GraphNode::Composite(c) = node {
            validate(&c.graph)?;
            for mapping in &c.inputs {
                if c.graph.node(&mapping.inner_node).is_none() {
                    return Err(GraphError::BadCompositeMapping {
                        composite: c.name.clone(),
                        inner: mapping.inner_node.clone(),
                    });
                }
            }
            for mapping in &c.outputs {
                if c.graph.node(&mapping.inner_node).is_none() {
                    return Err(GraphError::BadCompositeMapping {
                        composite: c.name.clone(),
                        inner: mapping.inner_node.clone(),
                    });
                }
            }
        }
    }

    // Kahn's algorithm over node-level edges; leftovers mean a cycle.
    let mut indegree: FxHashMap<&str, usize> = FxHashMap::default();
    let mut downstream: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for node in graph.nodes() {
        indegree.entry(node.name()).or_insert(0);
        for (_, binding) in node_bindings(node) {
            if let InputBinding::Upstream { node: upstream, .. } = binding {
                *indegree.entry(node.name()).or_insert(0) += 1;
                downstream
                    .entry(upstream.as_str())
                    .or_default()
                    .push(node.name());
            }
        }
    }
    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0usize;
    while let Some(name) = queue.pop() {
        visited += 1;
        if let Some(deps) = downstream.get(name) {
            for dep in deps {
                let d = indegree
                    .get_mut(dep)
                    .expect("dependent present in indegree map");
                *d -= 1;
                if *d == 0 {
                    queue.push(dep);
                }
            }
        }
    }
    if visited != graph.nodes().len() {
        let stuck = indegree
            .iter()
            .find(|(_, d)| **d > 0)
            .map(|(n, _)| (*n).to_string())
            .unwrap_or_default();
        return Err(GraphError::Cycle { node: stuck });
    }

    Ok(())
}
