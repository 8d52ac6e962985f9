// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Graph validation
//!
//! Checks a workflow graph before anything runs. Errors are collected in
//! a fixed order (structure, port kinds, acyclicity, completeness) so the
//! first one reported is the most fundamental.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::{FlowError, FlowResult};
use crate::pipeline::{Action, Dag, Graph, Node, PortDirection, PortRef};

/// Outcome of validating a graph
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<FlowError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Graph validator
pub struct GraphValidator;

impl GraphValidator {
    /// Run every check and collect all errors and warnings
    pub fn validate(graph: &Graph) -> ValidationResult {
        let mut result = ValidationResult::default();

        if graph.nodes.is_empty() {
            result.errors.push(FlowError::EmptyGraph);
            return result;
        }

        Self::check_nodes(graph, &mut result);
        Self::check_references(graph, &mut result);

        // Later checks assume names and references are sound
        if !result.is_valid() {
            return result;
        }

        Self::check_kinds(graph, &mut result);

        match Dag::build(graph) {
            Ok(_) => {}
            Err(e) => result.errors.push(e),
        }

        Self::check_completeness(graph, &mut result);
        Self::check_unused_outputs(graph, &mut result);

        result
    }

    fn check_nodes(graph: &Graph, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for node in &graph.nodes {
            if !seen.insert(node.name.as_str()) {
                result.errors.push(FlowError::DuplicateNode {
                    node: node.name.clone(),
                });
            }

            if node.name.is_empty() || node.name.contains(['.', '/', '{', '}']) {
                result.errors.push(FlowError::InvalidNode {
                    node: node.name.clone(),
                    reason: "names may not be empty or contain '.', '/', '{' or '}'".into(),
                });
            }

            for (ports, direction) in [
                (&node.inputs, PortDirection::Input),
                (&node.outputs, PortDirection::Output),
            ] {
                let mut names = HashSet::new();
                for port in ports {
                    if !names.insert(port.name.as_str()) {
                        result.errors.push(FlowError::DuplicatePort {
                            node: node.name.clone(),
                            port: port.name.clone(),
                            direction: direction.to_string(),
                        });
                    }
                }
            }

            Self::check_action(node, result);
        }
    }

    fn check_action(node: &Node, result: &mut ValidationResult) {
        let invalid = |reason: String| FlowError::InvalidNode {
            node: node.name.clone(),
            reason,
        };

        match &node.action {
            Action::Command {
                command, outputs, ..
            } => {
                if command.trim().is_empty() {
                    result.errors.push(invalid("command is empty".into()));
                }

                for port in &node.outputs {
                    if !outputs.contains_key(&port.name) {
                        result.errors.push(invalid(format!(
                            "output port '{}' has no path template",
                            port.name
                        )));
                    }
                }

                for name in outputs.keys() {
                    if node.output_port(name).is_none() {
                        result.errors.push(invalid(format!(
                            "path template given for undeclared output '{}'",
                            name
                        )));
                    }
                }
            }
            Action::Function { function } => {
                if function.trim().is_empty() {
                    result.errors.push(invalid("function name is empty".into()));
                }
            }
        }
    }

    fn check_references(graph: &Graph, result: &mut ValidationResult) {
        let mut check = |r: &PortRef, direction: PortDirection| {
            if let Err(e) = graph.require_port(&r.node, &r.port, direction) {
                result.errors.push(e);
            }
        };

        for edge in &graph.edges {
            check(&edge.from, PortDirection::Output);
            check(&edge.to, PortDirection::Input);
        }
        for binding in &graph.bindings {
            check(&binding.to, PortDirection::Input);
        }
        for output in &graph.outputs {
            check(&output.from, PortDirection::Output);
        }
    }

    fn check_kinds(graph: &Graph, result: &mut ValidationResult) {
        for edge in &graph.edges {
            let (Ok(source), Ok(target)) = (
                graph.require_port(&edge.from.node, &edge.from.port, PortDirection::Output),
                graph.require_port(&edge.to.node, &edge.to.port, PortDirection::Input),
            ) else {
                continue;
            };

            if source.kind != target.kind {
                result.errors.push(FlowError::PortKindMismatch {
                    source_node: edge.from.node.clone(),
                    source_port: edge.from.port.clone(),
                    source_kind: source.kind.to_string(),
                    target_node: edge.to.node.clone(),
                    target_port: edge.to.port.clone(),
                    target_kind: target.kind.to_string(),
                });
            }
        }
    }

    fn check_completeness(graph: &Graph, result: &mut ValidationResult) {
        let mut counts: HashMap<&PortRef, usize> = HashMap::new();
        for edge in &graph.edges {
            *counts.entry(&edge.to).or_default() += 1;
        }
        for binding in &graph.bindings {
            *counts.entry(&binding.to).or_default() += 1;
        }

        for node in &graph.nodes {
            for port in &node.inputs {
                let key = PortRef::new(&node.name, &port.name);
                match counts.get(&key).copied().unwrap_or(0) {
                    0 => result.errors.push(FlowError::UnboundInput {
                        node: node.name.clone(),
                        port: port.name.clone(),
                    }),
                    1 => {}
                    count => result.errors.push(FlowError::DuplicateBinding {
                        node: node.name.clone(),
                        port: port.name.clone(),
                        count,
                    }),
                }
            }
        }
    }

    fn check_unused_outputs(graph: &Graph, result: &mut ValidationResult) {
        let used: HashSet<&PortRef> = graph
            .edges
            .iter()
            .map(|e| &e.from)
            .chain(graph.outputs.iter().map(|o| &o.from))
            .collect();

        for node in &graph.nodes {
            for port in &node.outputs {
                if !used.contains(&PortRef::new(&node.name, &port.name)) {
                    result.add_warning(format!(
                        "Output {}.{} is neither consumed nor collected",
                        node.name, port.name
                    ));
                }
            }
        }
    }
}

/// Where an input port gets its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Output port of an upstream node (declaration index)
    Edge { node: usize, port: String },
    /// Dataset template resolved per run instance
    Template(String),
}

/// A graph that passed validation, with its DAG and input wiring
///
/// Only a validated graph can be executed.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    graph: Graph,
    dag: Dag,
    sources: Vec<BTreeMap<String, InputSource>>,
    warnings: Vec<String>,
}

impl ValidatedGraph {
    /// Validate `graph`, returning the first error in check order
    pub fn new(graph: Graph) -> FlowResult<Self> {
        let result = GraphValidator::validate(&graph);
        if let Some(error) = result.errors.into_iter().next() {
            return Err(error);
        }

        let dag = Dag::build(&graph)?;

        let mut sources: Vec<BTreeMap<String, InputSource>> =
            vec![BTreeMap::new(); graph.nodes.len()];
        for edge in &graph.edges {
            if let (Some(from), Some(to)) = (dag.index_of(&edge.from.node), dag.index_of(&edge.to.node)) {
                sources[to].insert(
                    edge.to.port.clone(),
                    InputSource::Edge {
                        node: from,
                        port: edge.from.port.clone(),
                    },
                );
            }
        }
        for binding in &graph.bindings {
            if let Some(to) = dag.index_of(&binding.to.node) {
                sources[to].insert(
                    binding.to.port.clone(),
                    InputSource::Template(binding.template.clone()),
                );
            }
        }

        Ok(Self {
            graph,
            dag,
            sources,
            warnings: result.warnings,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.graph.nodes[idx]
    }

    /// Input wiring of a node, keyed by input port name
    pub fn inputs_of(&self, idx: usize) -> &BTreeMap<String, InputSource> {
        &self.sources[idx]
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PortKind;

    fn two_node_graph() -> Graph {
        let mut graph = Graph::new("g");
        graph
            .add_node(
                Node::command("producer", "touch {out}")
                    .input("src", PortKind::FilePath)
                    .output("out", PortKind::FilePath, "out.txt"),
            )
            .unwrap();
        graph
            .add_node(Node::function("consumer", "identity").input("in_file", PortKind::FilePath))
            .unwrap();
        graph
    }

    #[test]
    fn test_valid_graph() {
        let mut graph = two_node_graph();
        graph.bind("producer", "src", "sub-{subject_id}/*.nii").unwrap();
        graph.connect("producer", "out", "consumer", "in_file").unwrap();

        let validated = graph.validate().unwrap();
        assert_eq!(
            validated.inputs_of(1).get("in_file"),
            Some(&InputSource::Edge {
                node: 0,
                port: "out".into()
            })
        );
        assert_eq!(
            validated.inputs_of(0).get("src"),
            Some(&InputSource::Template("sub-{subject_id}/*.nii".into()))
        );
        assert_eq!(validated.warnings().len(), 0);
    }

    #[test]
    fn test_unbound_input() {
        let mut graph = two_node_graph();
        graph.connect("producer", "out", "consumer", "in_file").unwrap();

        assert!(matches!(
            graph.validate(),
            Err(FlowError::UnboundInput { ref node, ref port }) if node == "producer" && port == "src"
        ));
    }

    #[test]
    fn test_double_binding() {
        let mut graph = two_node_graph();
        graph.bind("producer", "src", "a/*.nii").unwrap();
        graph.connect("producer", "out", "consumer", "in_file").unwrap();
        graph.bind("consumer", "in_file", "b/*.nii").unwrap();

        assert!(matches!(
            graph.validate(),
            Err(FlowError::DuplicateBinding { count: 2, .. })
        ));
    }

    #[test]
    fn test_kind_mismatch_reported_before_completeness() {
        let mut graph = Graph::new("g");
        graph
            .add_node(Node::function("a", "identity").output("value", PortKind::Scalar, ""))
            .unwrap();
        graph
            .add_node(
                Node::function("b", "identity")
                    .input("in_file", PortKind::FilePath)
                    .input("other", PortKind::Scalar),
            )
            .unwrap();
        graph.connect("a", "value", "b", "in_file").unwrap();

        let result = GraphValidator::validate(&graph);
        assert_eq!(result.errors.len(), 2);
        assert!(matches!(result.errors[0], FlowError::PortKindMismatch { .. }));
        assert!(matches!(result.errors[1], FlowError::UnboundInput { .. }));
    }

    #[test]
    fn test_command_outputs_need_templates() {
        let mut graph = Graph::new("g");
        let mut node = Node::command("a", "true");
        node.outputs.push(crate::pipeline::Port::new("out", PortKind::FilePath));
        graph.add_node(node).unwrap();

        assert!(matches!(graph.validate(), Err(FlowError::InvalidNode { .. })));
    }

    #[test]
    fn test_unknown_reference_in_yaml() {
        let graph = Graph::from_yaml(
            r#"
name: g
nodes:
  - name: a
    inputs: [{ name: x, kind: scalar }]
    action: { type: function, function: identity }
bindings:
  - to: a.y
    template: "{subject_id}"
"#,
        )
        .unwrap();

        let result = GraphValidator::validate(&graph);
        assert!(matches!(result.errors[0], FlowError::UnknownPort { .. }));
    }

    #[test]
    fn test_empty_graph() {
        assert!(matches!(Graph::new("g").validate(), Err(FlowError::EmptyGraph)));
    }

    #[test]
    fn test_unused_output_warning() {
        let mut graph = two_node_graph();
        graph.bind("producer", "src", "x").unwrap();
        graph.bind("consumer", "in_file", "y").unwrap();

        let result = GraphValidator::validate(&graph);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("producer.out"));
    }
}
