// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Function executor
//!
//! Runs registered in-process functions on the blocking thread pool.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use super::{ExecutionResult, Executor, NodeInputs};
use crate::errors::{FlowError, FlowResult};
use crate::pipeline::{Action, Node, PortKind, PortValue};

/// Everything a function sees when it runs
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub node: Node,
    pub inputs: NodeInputs,
    pub work_dir: PathBuf,
}

impl FunctionCall {
    /// Input value for a port, or an error naming the node
    pub fn input(&self, port: &str) -> FlowResult<&PortValue> {
        self.inputs.get(port).ok_or_else(|| FlowError::InvalidNode {
            node: self.node.name.clone(),
            reason: format!("missing input '{}'", port),
        })
    }

    /// The node's only output port
    pub fn single_output(&self) -> FlowResult<&str> {
        match self.node.outputs.as_slice() {
            [port] => Ok(&port.name),
            _ => Err(FlowError::InvalidNode {
                node: self.node.name.clone(),
                reason: "function needs exactly one output port".into(),
            }),
        }
    }
}

/// A function callable from a workflow node
pub type NodeFunction =
    Arc<dyn Fn(&FunctionCall) -> FlowResult<BTreeMap<String, PortValue>> + Send + Sync>;

/// In-process function executor
#[derive(Clone, Default)]
pub struct FunctionExecutor {
    registry: HashMap<String, NodeFunction>,
}

impl FunctionExecutor {
    /// Executor with no functions registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor with `join` and `identity` registered
    pub fn with_builtins() -> Self {
        let mut executor = Self::new();
        executor.register("join", join);
        executor.register("identity", identity);
        executor
    }

    /// Register a function under a name, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&FunctionCall) -> FlowResult<BTreeMap<String, PortValue>> + Send + Sync + 'static,
    {
        self.registry.insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    fn lookup(&self, node: &Node) -> FlowResult<NodeFunction> {
        let Action::Function { function } = &node.action else {
            return Err(FlowError::InvalidNode {
                node: node.name.clone(),
                reason: "Expected function action".to_string(),
            });
        };

        self.registry
            .get(function)
            .cloned()
            .ok_or_else(|| FlowError::InvalidNode {
                node: node.name.clone(),
                reason: format!("unknown function '{}'", function),
            })
    }
}

/// Join the node's inputs, in declaration order, with `separator` (default `_`)
///
/// Used to build FreeSurfer subject names such as `baseline_01`.
pub fn join(call: &FunctionCall) -> FlowResult<BTreeMap<String, PortValue>> {
    let separator = call
        .node
        .options
        .get("separator")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "_".to_string());

    let parts = call
        .node
        .inputs
        .iter()
        .map(|port| call.input(&port.name).map(PortValue::to_string))
        .collect::<FlowResult<Vec<_>>>()?;

    let output = call.single_output()?;
    Ok(BTreeMap::from([(
        output.to_string(),
        PortValue::Scalar(parts.join(separator.as_str())),
    )]))
}

/// Pass inputs through unchanged
///
/// With one input and one output the names may differ; otherwise each
/// output takes the input of the same name.
pub fn identity(call: &FunctionCall) -> FlowResult<BTreeMap<String, PortValue>> {
    if let ([input], [output]) = (call.node.inputs.as_slice(), call.node.outputs.as_slice()) {
        let value = call.input(&input.name)?.clone();
        return Ok(BTreeMap::from([(output.name.clone(), value)]));
    }

    call.node
        .outputs
        .iter()
        .map(|port| -> FlowResult<(String, PortValue)> {
            Ok((port.name.clone(), call.input(&port.name)?.clone()))
        })
        .collect()
}

#[async_trait]
impl Executor for FunctionExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        work_dir: &Path,
    ) -> FlowResult<ExecutionResult> {
        let function = self.lookup(node)?;
        let call = FunctionCall {
            node: node.clone(),
            inputs: inputs.clone(),
            work_dir: work_dir.to_path_buf(),
        };

        let start = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || function(&call))
            .await
            .map_err(|e| FlowError::ToolExecutionFailed {
                tool: node.name.clone(),
                error: format!("function panicked: {}", e),
                help: None,
            })?;
        let duration = start.elapsed();

        match outcome {
            Ok(outputs) => {
                for (port, value) in &outputs {
                    let declared = node.output_port(port).map(|p| p.kind);
                    if declared != Some(value.kind()) {
                        return Err(FlowError::InvalidNode {
                            node: node.name.clone(),
                            reason: format!(
                                "function returned {} for output '{}' declared as {}",
                                value.kind(),
                                port,
                                declared.map_or("nothing".to_string(), |k: PortKind| k.to_string())
                            ),
                        });
                    }
                }
                Ok(ExecutionResult::success(outputs, duration))
            }
            Err(e) => Ok(ExecutionResult::failure(e.to_string(), 1, duration)),
        }
    }

    async fn check_available(&self, node: &Node) -> FlowResult<bool> {
        Ok(self.lookup(node).is_ok())
    }

    fn validate_node(&self, node: &Node) -> FlowResult<()> {
        self.lookup(node).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn map_subjects() -> Node {
        Node::function("map_subjects", "join")
            .input("session_id", PortKind::Scalar)
            .input("subject_id", PortKind::Scalar)
            .output("value", PortKind::Scalar, "")
    }

    fn scalars(pairs: &[(&str, &str)]) -> NodeInputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PortValue::Scalar(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_join_uses_declaration_order() {
        let executor = FunctionExecutor::with_builtins();
        let result = executor
            .execute(
                &map_subjects(),
                &scalars(&[("subject_id", "01"), ("session_id", "baseline")]),
                Path::new("/tmp"),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outputs["value"], PortValue::Scalar("baseline_01".into()));
    }

    #[tokio::test]
    async fn test_join_separator_option() {
        let executor = FunctionExecutor::with_builtins();
        let node = map_subjects().option("separator", "-");
        let result = executor
            .execute(
                &node,
                &scalars(&[("subject_id", "01"), ("session_id", "A")]),
                Path::new("/tmp"),
            )
            .await
            .unwrap();

        assert_eq!(result.outputs["value"], PortValue::Scalar("A-01".into()));
    }

    #[tokio::test]
    async fn test_custom_function_and_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut executor = FunctionExecutor::new();
        executor.register("explode", move |call: &FunctionCall| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FlowError::InvalidNode {
                node: call.node.name.clone(),
                reason: "boom".into(),
            })
        });

        let node = Node::function("x", "explode");
        let result = executor
            .execute(&node, &NodeInputs::new(), Path::new("/tmp"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.stderr.contains("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_function() {
        let executor = FunctionExecutor::with_builtins();
        assert!(executor.validate_node(&Node::function("x", "nope")).is_err());
        assert!(executor.validate_node(&map_subjects()).is_ok());
    }

    #[tokio::test]
    async fn test_wrong_output_kind_is_rejected() {
        let mut executor = FunctionExecutor::new();
        executor.register("bad", |_: &FunctionCall| {
            Ok(BTreeMap::from([("value".to_string(), PortValue::Scalar("x".into()))]))
        });

        let node = Node::function("x", "bad").output("value", PortKind::FilePath, "");
        let result = executor.execute(&node, &NodeInputs::new(), Path::new("/tmp")).await;
        assert!(matches!(result, Err(FlowError::InvalidNode { .. })));
    }
}
