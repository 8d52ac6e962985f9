// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Action executors
//!
//! This module provides the executor trait and its implementations for
//! external commands and in-process functions.

mod command;
mod function;

pub use command::CommandExecutor;
pub use function::{FunctionCall, FunctionExecutor, NodeFunction};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::FlowResult;
use crate::pipeline::{Node, PortValue};

/// Resolved input values of a node, keyed by port name
pub type NodeInputs = BTreeMap<String, PortValue>;

/// Result of running one node's action
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the action succeeded
    pub success: bool,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Exit code
    pub exit_code: i32,

    /// Output values that were actually produced, keyed by port
    pub outputs: BTreeMap<String, PortValue>,

    /// Execution duration
    pub duration: Duration,

    /// Rendered command line, for command actions
    pub command: Option<String>,
}

impl ExecutionResult {
    /// Create a successful result
    pub fn success(outputs: BTreeMap<String, PortValue>, duration: Duration) -> Self {
        Self {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            outputs,
            duration,
            command: None,
        }
    }

    /// Create a failed result
    pub fn failure(stderr: String, exit_code: i32, duration: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr,
            exit_code,
            outputs: BTreeMap::new(),
            duration,
            command: None,
        }
    }
}

/// Trait for action executors
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a node's action
    ///
    /// # Arguments
    /// * `node` - The node to run
    /// * `inputs` - Resolved values of every input port
    /// * `work_dir` - The node's private working directory
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        work_dir: &Path,
    ) -> FlowResult<ExecutionResult>;

    /// Check whether whatever the node needs is available
    async fn check_available(&self, node: &Node) -> FlowResult<bool>;

    /// Validate node configuration for this executor
    fn validate_node(&self, node: &Node) -> FlowResult<()>;
}

/// Create the standard executor set keyed by action kind
pub fn create_default_executors() -> HashMap<String, Arc<dyn Executor>> {
    let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();

    executors.insert("command".to_string(), Arc::new(CommandExecutor::new()));
    executors.insert("function".to_string(), Arc::new(FunctionExecutor::with_builtins()));

    executors
}
