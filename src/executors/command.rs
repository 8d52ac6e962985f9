// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Command executor
//!
//! Renders a node's command template and runs it through a shell inside
//! the node's working directory.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

use super::{ExecutionResult, Executor, NodeInputs};
use crate::errors::{FlowError, FlowResult};
use crate::pipeline::{Action, Node, PortKind, PortValue};
use crate::resolver::{placeholders, render_shell, render_template};

/// Placeholder naming the node's working directory
const WORK_DIR_KEY: &str = "work_dir";

/// Where a declared output will be found once the command has run
#[derive(Debug, Clone)]
enum PlannedOutput {
    Value(PortValue),
    Glob(String),
}

/// Shell command executor
#[derive(Debug, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Work out every declared output from its path template
    fn plan_outputs(
        node: &Node,
        templates: &BTreeMap<String, String>,
        inputs: &NodeInputs,
        work_dir: &Path,
    ) -> FlowResult<BTreeMap<String, PlannedOutput>> {
        let lookup = |name: &str| -> Option<String> {
            if name == WORK_DIR_KEY {
                return Some(work_dir.to_string_lossy().to_string());
            }
            inputs
                .get(name)
                .map(PortValue::to_string)
                .or_else(|| node.options.get(name).map(|v| v.to_string()))
        };

        let mut planned = BTreeMap::new();
        for port in &node.outputs {
            let Some(template) = templates.get(&port.name) else {
                continue;
            };

            let rendered = render_template(template, &lookup).map_err(|placeholder| {
                FlowError::UnresolvedPlaceholder {
                    template: template.clone(),
                    placeholder,
                }
            })?;

            let resolve = |rendered: &str| -> PathBuf {
                let path = Path::new(rendered);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    work_dir.join(path)
                }
            };

            let output = match port.kind {
                PortKind::Scalar => PlannedOutput::Value(PortValue::Scalar(rendered)),
                PortKind::FilePath => PlannedOutput::Value(PortValue::FilePath(resolve(rendered.as_str()))),
                PortKind::ListOfFilePath => {
                    PlannedOutput::Glob(resolve(rendered.as_str()).to_string_lossy().to_string())
                }
            };
            planned.insert(port.name.clone(), output);
        }

        Ok(planned)
    }

    /// Render the command line with quoted inputs, outputs and options
    fn render_command(
        node: &Node,
        command: &str,
        inputs: &NodeInputs,
        planned: &BTreeMap<String, PlannedOutput>,
        work_dir: &Path,
    ) -> FlowResult<String> {
        let words = |value: &PortValue| -> Vec<String> {
            match value {
                PortValue::ListOfFilePath(paths) => {
                    paths.iter().map(|p| p.to_string_lossy().to_string()).collect()
                }
                other => vec![other.to_string()],
            }
        };

        render_shell(command, |name| {
            if name == WORK_DIR_KEY {
                return Some(vec![work_dir.to_string_lossy().to_string()]);
            }
            if let Some(value) = inputs.get(name) {
                return Some(words(value));
            }
            if let Some(planned) = planned.get(name) {
                return Some(match planned {
                    PlannedOutput::Value(value) => words(value),
                    PlannedOutput::Glob(pattern) => vec![pattern.clone()],
                });
            }
            node.options.get(name).map(|v| vec![v.to_string()])
        })
        .map_err(|placeholder| FlowError::UnresolvedPlaceholder {
            template: command.to_string(),
            placeholder,
        })
    }

    /// Collect the outputs that exist after a successful run
    fn collect_outputs(planned: BTreeMap<String, PlannedOutput>) -> BTreeMap<String, PortValue> {
        let mut outputs = BTreeMap::new();

        for (port, output) in planned {
            let value = match output {
                PlannedOutput::Value(PortValue::FilePath(path)) => {
                    if !path.exists() {
                        continue;
                    }
                    PortValue::FilePath(path)
                }
                PlannedOutput::Value(value) => value,
                PlannedOutput::Glob(pattern) => {
                    let mut matches: Vec<PathBuf> = match glob::glob(&pattern) {
                        Ok(paths) => paths.filter_map(Result::ok).collect(),
                        Err(_) => continue,
                    };
                    if matches.is_empty() {
                        continue;
                    }
                    matches.sort();
                    PortValue::ListOfFilePath(matches)
                }
            };
            outputs.insert(port, value);
        }

        outputs
    }

    /// First word of a command template, when it is a literal program name
    fn program(command: &str) -> Option<&str> {
        let first = command.split_whitespace().next()?;
        placeholders(first).is_empty().then_some(first)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        node: &Node,
        inputs: &NodeInputs,
        work_dir: &Path,
    ) -> FlowResult<ExecutionResult> {
        let Action::Command {
            command,
            shell,
            outputs,
            env,
        } = &node.action
        else {
            return Err(FlowError::InvalidNode {
                node: node.name.clone(),
                reason: "Expected command action".to_string(),
            });
        };

        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| FlowError::FileWriteError {
                path: work_dir.to_path_buf(),
                error: e.to_string(),
            })?;

        let planned = Self::plan_outputs(node, outputs, inputs, work_dir)?;
        let rendered = Self::render_command(node, command, inputs, &planned, work_dir)?;

        tracing::debug!(node = %node.name, command = %rendered, "Running command");

        let start = Instant::now();

        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(&rendered);
        cmd.current_dir(work_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        // Dropping the future on timeout or cancellation kills the child
        cmd.kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| FlowError::ToolExecutionFailed {
            tool: shell.clone(),
            error: e.to_string(),
            help: Some(format!("Shell '{}' may not be available", shell)),
        })?;

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(ExecutionResult {
                success: true,
                stdout,
                stderr,
                exit_code: 0,
                outputs: Self::collect_outputs(planned),
                duration,
                command: Some(rendered),
            })
        } else {
            // Killed by a signal has no exit code
            let exit_code = output.status.code().unwrap_or(-1);

            Ok(ExecutionResult {
                success: false,
                stdout,
                stderr,
                exit_code,
                outputs: BTreeMap::new(),
                duration,
                command: Some(rendered),
            })
        }
    }

    async fn check_available(&self, node: &Node) -> FlowResult<bool> {
        let Action::Command { command, shell, .. } = &node.action else {
            return Ok(false);
        };

        if which::which(shell).is_err() {
            return Ok(false);
        }

        Ok(match Self::program(command) {
            Some(program) => which::which(program).is_ok(),
            None => true,
        })
    }

    fn validate_node(&self, node: &Node) -> FlowResult<()> {
        let Action::Command { command, .. } = &node.action else {
            return Err(FlowError::InvalidNode {
                node: node.name.clone(),
                reason: "Not a command node".to_string(),
            });
        };

        if command.trim().is_empty() {
            return Err(FlowError::InvalidNode {
                node: node.name.clone(),
                reason: "Command is empty".to_string(),
            });
        }

        Ok(())
    }
}
