// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Node dependency DAG
//!
//! Builds the node-level dependency graph implied by a workflow's edges,
//! detects cycles and computes a deterministic execution order.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use crate::errors::{FlowError, FlowResult};
use crate::pipeline::Graph;

/// Dependency DAG over a graph's nodes
///
/// Node weights are indices into `Graph::nodes`, so declaration order is
/// available for tie-breaking.
#[derive(Debug, Clone)]
pub struct Dag {
    graph: DiGraph<usize, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    names: Vec<String>,
}

impl Dag {
    /// Build the DAG for a graph, rejecting unknown nodes and cycles
    pub fn build(workflow: &Graph) -> FlowResult<Self> {
        let dag = Self::construct(workflow)?;

        if let Some(nodes) = dag.find_cycle() {
            return Err(FlowError::CircularDependency { nodes });
        }

        Ok(dag)
    }

    fn construct(workflow: &Graph) -> FlowResult<Self> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();
        let mut names = Vec::with_capacity(workflow.nodes.len());

        for (idx, node) in workflow.nodes.iter().enumerate() {
            let ix = graph.add_node(idx);
            name_to_index.insert(node.name.clone(), ix);
            names.push(node.name.clone());
        }

        for edge in &workflow.edges {
            let lookup = |name: &str| {
                name_to_index
                    .get(name)
                    .copied()
                    .ok_or_else(|| FlowError::UnknownNode { node: name.to_string() })
            };
            let from = lookup(&edge.from.node)?;
            let to = lookup(&edge.to.node)?;

            // Several port edges between two nodes are one dependency
            if !graph.contains_edge(from, to) {
                graph.add_edge(from, to, ());
            }
        }

        Ok(Self {
            graph,
            name_to_index,
            names,
        })
    }

    /// Find one cycle, returned as a closed path (`a -> b -> a`)
    ///
    /// Roots and successors are visited in declaration order so the
    /// reported cycle is stable.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let count = self.graph.node_count();
        let mut marks = vec![Mark::Unvisited; count];

        for root in 0..count {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // Explicit stack of (node, remaining successors)
            let mut path: Vec<usize> = Vec::new();
            let mut stack: Vec<(usize, Vec<usize>)> = vec![(root, self.successors(root))];
            marks[root] = Mark::OnStack;
            path.push(root);

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                if pending.is_empty() {
                    marks[node] = Mark::Done;
                    stack.pop();
                    path.pop();
                    continue;
                }

                let next = pending.remove(0);
                match marks[next] {
                    Mark::OnStack => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&n| self.names[n].clone()).collect();
                        cycle.push(self.names[next].clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[next] = Mark::OnStack;
                        path.push(next);
                        stack.push((next, self.successors(next)));
                    }
                    Mark::Done => {}
                }
            }
        }

        None
    }

    /// Node indices in execution order
    ///
    /// Kahn's algorithm; among ready nodes the earliest declared runs first.
    pub fn topological_order(&self) -> Vec<usize> {
        let count = self.graph.node_count();
        let mut in_degree: Vec<usize> = (0..count).map(|i| self.predecessors(i).len()).collect();

        let mut ready: BinaryHeap<Reverse<usize>> = (0..count)
            .filter(|&i| in_degree[i] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(count);
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for succ in self.successors(node) {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        order
    }

    /// Node names in execution order
    pub fn topological_order_names(&self) -> Vec<String> {
        self.topological_order()
            .into_iter()
            .map(|i| self.names[i].clone())
            .collect()
    }

    /// Declaration index of a node
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).map(|ix| self.graph[*ix])
    }

    /// Node name at a declaration index
    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Direct upstream nodes, in declaration order
    pub fn predecessors(&self, idx: usize) -> Vec<usize> {
        self.neighbors(idx, Direction::Incoming)
    }

    /// Direct downstream nodes, in declaration order
    pub fn successors(&self, idx: usize) -> Vec<usize> {
        self.neighbors(idx, Direction::Outgoing)
    }

    fn neighbors(&self, idx: usize, direction: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(idx), direction)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Every node reachable downstream of `idx`, in declaration order
    pub fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.successors(idx).into();

        while let Some(node) = queue.pop_front() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            queue.extend(self.successors(node));
        }

        (0..self.len()).filter(|&i| seen[i]).collect()
    }

    /// Names of nodes that must run before `name`
    pub fn dependencies(&self, name: &str) -> Option<Vec<String>> {
        let idx = self.index_of(name)?;
        Some(
            self.predecessors(idx)
                .into_iter()
                .map(|i| self.names[i].clone())
                .collect(),
        )
    }

    /// Names of every node downstream of `name`, in declaration order
    pub fn dependents(&self, name: &str) -> Option<Vec<String>> {
        let idx = self.index_of(name)?;
        Some(
            self.descendants(idx)
                .into_iter()
                .map(|i| self.names[i].clone())
                .collect(),
        )
    }

    /// Whether `a` depends directly or transitively on `b`
    pub fn depends_on(&self, a: &str, b: &str) -> bool {
        let (Some(node_a), Some(node_b)) = (self.name_to_index.get(a), self.name_to_index.get(b))
        else {
            return false;
        };

        a != b && petgraph::algo::has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    /// Mermaid flowchart of the workflow, one arrow per port edge
    pub fn to_mermaid(&self, workflow: &Graph) -> String {
        let mut out = String::from("graph TD\n");

        for name in &self.names {
            out.push_str(&format!("    {}[{}]\n", name, name));
        }

        for edge in &workflow.edges {
            out.push_str(&format!(
                "    {} -->|{}| {}\n",
                edge.from.node, edge.from.port, edge.to.node
            ));
        }

        out
    }

    /// Graphviz DOT rendering of the node DAG
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph workflow {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for edge in self.graph.edge_references() {
            let from = &self.names[self.graph[edge.source()]];
            let to = &self.names[self.graph[edge.target()]];
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }

        for (idx, name) in self.names.iter().enumerate() {
            if self
                .graph
                .neighbors_undirected(NodeIndex::new(idx))
                .next()
                .is_none()
            {
                out.push_str(&format!("    \"{}\";\n", name));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Numbered execution order with each node's action and dependencies
    pub fn to_text(&self, workflow: &Graph) -> String {
        let mut out = String::new();

        for (i, idx) in self.topological_order().into_iter().enumerate() {
            let node = &workflow.nodes[idx];
            out.push_str(&format!("{}. {} ({})", i + 1, node.name, node.action_kind()));

            let deps: Vec<&str> = self
                .predecessors(idx)
                .into_iter()
                .map(|d| self.names[d].as_str())
                .collect();
            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }

            out.push('\n');
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Node, PortKind};

    /// Build a graph of scalar identity nodes; `edges` are `(from, to)` names
    fn make_graph(nodes: &[&str], edges: &[(&str, &str)]) -> Graph {
        let mut graph = Graph::new("test");
        for name in nodes {
            let mut node = Node::function(*name, "identity").output("value", PortKind::Scalar, "");
            for (from, to) in edges {
                if to == name {
                    node = node.input(format!("from_{}", from), PortKind::Scalar);
                }
            }
            graph.nodes.push(node);
        }
        for (from, to) in edges {
            graph.edges.push(crate::pipeline::Edge {
                from: crate::pipeline::PortRef::new(*from, "value"),
                to: crate::pipeline::PortRef::new(*to, format!("from_{}", from)),
            });
        }
        graph
    }

    #[test]
    fn test_linear_dag() {
        let graph = make_graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let dag = Dag::build(&graph).unwrap();

        assert_eq!(dag.topological_order_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        // d is declared before c, both only depend on a
        let graph = make_graph(&["a", "b", "d", "c"], &[("a", "c"), ("a", "d"), ("b", "c")]);
        let dag = Dag::build(&graph).unwrap();

        assert_eq!(dag.topological_order_names(), vec!["a", "b", "d", "c"]);
    }

    #[test]
    fn test_diamond_dag() {
        let graph = make_graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let dag = Dag::build(&graph).unwrap();

        assert_eq!(dag.topological_order_names(), vec!["a", "b", "c", "d"]);
        assert_eq!(dag.descendants(0), vec![1, 2, 3]);
        assert_eq!(dag.descendants(1), vec![3]);
        assert_eq!(dag.dependencies("d").unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_dependents_are_transitive() {
        let graph = make_graph(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("b", "d"), ("c", "d")],
        );
        let dag = Dag::build(&graph).unwrap();

        assert_eq!(dag.dependents("a").unwrap(), vec!["b", "d"]);
        assert_eq!(dag.dependents("c").unwrap(), vec!["d"]);
        assert!(dag.dependents("e").unwrap().is_empty());
        assert!(dag.dependents("missing").is_none());
    }

    #[test]
    fn test_cycle_is_reported_as_path() {
        let graph = make_graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]);

        match Dag::build(&graph) {
            Err(FlowError::CircularDependency { nodes }) => {
                assert_eq!(nodes, vec!["b", "c", "b"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop() {
        let graph = make_graph(&["a"], &[("a", "a")]);
        assert!(matches!(
            Dag::build(&graph),
            Err(FlowError::CircularDependency { ref nodes }) if nodes == &["a", "a"]
        ));
    }

    #[test]
    fn test_depends_on_check() {
        let graph = make_graph(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let dag = Dag::build(&graph).unwrap();

        assert!(dag.depends_on("c", "a"));
        assert!(dag.depends_on("c", "b"));
        assert!(!dag.depends_on("a", "c"));
        assert!(!dag.depends_on("a", "a"));
    }

    #[test]
    fn test_renderings() {
        let graph = make_graph(&["a", "b", "lonely"], &[("a", "b")]);
        let dag = Dag::build(&graph).unwrap();

        let mermaid = dag.to_mermaid(&graph);
        assert!(mermaid.contains("graph TD"));
        assert!(mermaid.contains("a -->|value| b"));

        let dot = dag.to_dot();
        assert!(dot.contains("\"a\" -> \"b\";"));
        assert!(dot.contains("\"lonely\";"));

        let text = dag.to_text(&graph);
        assert_eq!(text, "1. a (function)\n2. b (function) [depends: a]\n3. lonely (function)\n");
    }
}
