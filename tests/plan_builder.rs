mod common;

use common::{diamond, sum_step, sum_step_with_config};

use runloom::config::{ConfigError, RunConfig};
use runloom::executor::{ComputeOutput, FnCompute};
use runloom::graph::{
    CompositeInput, CompositeNode, CompositeOutput, GraphBuilder, InputBinding, InputDef,
    OutputDef, StepNode,
};
use runloom::plan::{InputSource, PlanBuilder, PlanError, StepSelection};
use runloom::types::StepKey;
use serde_json::json;

#[test]
fn diamond_plan_is_topologically_ordered() {
    let plan = PlanBuilder::new(&diamond(), &RunConfig::default())
        .select(StepSelection::all())
        .build()
        .unwrap();

    let keys: Vec<&str> = plan.steps().iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c", "d"]);
    assert_eq!(
        plan.dependents_of(&StepKey::new("a")).len(),
        2,
        "a feeds both branches"
    );
}

#[test]
fn subset_requires_excluded_inputs_in_config() {
    // b+ selects {b, d}; d still needs c's output, and b needs a's.
    let err = PlanBuilder::new(&diamond(), &RunConfig::default())
        .select(StepSelection::parse("b+").unwrap())
        .build()
        .unwrap_err();

    let PlanError::InvalidConfig { errors } = err else {
        panic!("expected collected config errors");
    };
    assert!(errors.iter().any(|e| matches!(
        e,
        ConfigError::MissingSubsetInput { step, excluded_upstream, .. }
            if step == "d" && excluded_upstream == "c"
    )));
    assert!(errors.iter().any(|e| matches!(
        e,
        ConfigError::MissingSubsetInput { step, excluded_upstream, .. }
            if step == "b" && excluded_upstream == "a"
    )));
}

#[test]
fn subset_with_supplied_inputs_builds() {
    let config = RunConfig::default()
        .with_step_input("b", "a", json!(10))
        .with_step_input("d", "c", json!(20));
    let plan = PlanBuilder::new(&diamond(), &config)
        .select(StepSelection::parse("b+").unwrap())
        .build()
        .unwrap();

    let keys: Vec<&str> = plan.steps().iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["b", "d"]);

    // d's c-input became a literal, its b-input stayed an upstream edge.
    let d = plan.step(&StepKey::new("d")).unwrap();
    let c_input = d.inputs.iter().find(|i| i.name == "c").unwrap();
    assert!(matches!(c_input.source, InputSource::Literal(_)));
    let b_input = d.inputs.iter().find(|i| i.name == "b").unwrap();
    assert!(matches!(b_input.source, InputSource::Upstream { .. }));
}

#[test]
fn config_mismatches_are_collected_not_first_reported() {
    let graph = GraphBuilder::new("g")
        .add_step(sum_step_with_config("a", &[], &["add"]))
        .add_step(sum_step("b", &["a"]))
        .build()
        .unwrap();
    // Three distinct problems: a is missing `add`, b has an unknown key,
    // and a step that does not exist is configured.
    let config = RunConfig::default()
        .with_step_config("b", "bogus", json!(1))
        .with_step_config("ghost", "x", json!(2));

    let err = PlanBuilder::new(&graph, &config)
        .select(StepSelection::all())
        .build()
        .unwrap_err();
    let PlanError::InvalidConfig { errors } = err else {
        panic!("expected collected config errors");
    };
    assert_eq!(errors.len(), 3, "all problems reported together: {errors:?}");
    assert!(errors
        .iter()
        .any(|e| matches!(e, ConfigError::MissingConfigKey { step, key } if step == "a" && key == "add")));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ConfigError::UnknownConfigKey { step, .. } if step == "b")));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ConfigError::UnknownStep { step } if step == "ghost")));
}

#[test]
fn composite_is_flattened_with_dotted_keys() {
    let inner = GraphBuilder::new("inner")
        .add_step(StepNode {
            name: "first".into(),
            inputs: vec![InputDef::external("seed")],
            outputs: vec![OutputDef::result()],
            required_config: vec![],
            resource_keys: vec![],
            tolerant: false,
            code_version: None,
            compute: FnCompute::arc(|ctx| async move {
                Ok(ComputeOutput::single(ctx.require_input("seed")?.clone()))
            }),
        })
        .add_step(sum_step("second", &["first"]))
        .build()
        .unwrap();

    let graph = GraphBuilder::new("outer")
        .add_step(sum_step("source", &[]))
        .add_composite(CompositeNode {
            name: "nested".into(),
            graph: inner,
            inputs: vec![CompositeInput {
                name: "seed".into(),
                binding: InputBinding::Upstream {
                    node: "source".into(),
                    output: "result".into(),
                },
                inner_node: "first".into(),
                inner_input: "seed".into(),
            }],
            outputs: vec![CompositeOutput {
                name: "result".into(),
                inner_node: "second".into(),
                inner_output: "result".into(),
            }],
        })
        .add_step(sum_step("sink", &["nested"]))
        .build()
        .unwrap();

    let plan = PlanBuilder::new(&graph, &RunConfig::default())
        .select(StepSelection::all())
        .build()
        .unwrap();

    let keys: Vec<&str> = plan.steps().iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["source", "nested.first", "nested.second", "sink"]);

    // The composite boundary is gone: sink reads directly from the
    // inner producer.
    let sink = plan.step(&StepKey::new("sink")).unwrap();
    let InputSource::Upstream { step, output } = &sink.inputs[0].source else {
        panic!("sink input should be an upstream edge");
    };
    assert_eq!(step.as_str(), "nested.second");
    assert_eq!(output, "result");

    // And the composite's external input resolved to the outer source.
    let first = plan.step(&StepKey::new("nested.first")).unwrap();
    let InputSource::Upstream { step, .. } = &first.inputs[0].source else {
        panic!("inner external input should bind to the outer source");
    };
    assert_eq!(step.as_str(), "source");
}

proptest::proptest! {
    /// Any generated DAG plans into a valid topological order, and
    /// every upstream edge in the plan was declared in the graph.
    #[test]
    fn plan_is_a_valid_topological_order(edge_rows in proptest::collection::vec(
        proptest::collection::vec(proptest::prelude::any::<bool>(), 8),
        1..8usize,
    )) {
        let names: Vec<String> = (0..edge_rows.len()).map(|i| format!("s{i}")).collect();
        let mut builder = GraphBuilder::new("prop");
        let mut declared: Vec<(&str, &str)> = Vec::new();
        for (i, row) in edge_rows.iter().enumerate() {
            let ups: Vec<&str> = row
                .iter()
                .take(i)
                .enumerate()
                .filter(|(_, on)| **on)
                .map(|(j, _)| names[j].as_str())
                .collect();
            for up in &ups {
                declared.push((*up, names[i].as_str()));
            }
            builder = builder.add_step(sum_step(&names[i], &ups));
        }
        let graph = builder.build().unwrap();
        let plan = PlanBuilder::new(&graph, &RunConfig::default())
            .build()
            .unwrap();

        proptest::prop_assert_eq!(plan.len(), names.len());
        let position: std::collections::HashMap<&str, usize> = plan
            .steps()
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.as_str(), i))
            .collect();
        for step in plan.steps() {
            for input in &step.inputs {
                let InputSource::Upstream { step: up, .. } = &input.source else {
                    continue;
                };
                proptest::prop_assert!(position[up.as_str()] < position[step.key.as_str()]);
                proptest::prop_assert!(declared.contains(&(up.as_str(), step.key.as_str())));
            }
        }
    }
}

#[test]
fn plan_order_is_stable_across_builds() {
    let config = RunConfig::default();
    let one = PlanBuilder::new(&diamond(), &config).build().unwrap();
    let two = PlanBuilder::new(&diamond(), &config).build().unwrap();
    let keys = |p: &runloom::plan::ExecutionPlan| {
        p.steps().iter().map(|s| s.key.clone()).collect::<Vec<_>>()
    };
    assert_eq!(keys(&one), keys(&two));
}
