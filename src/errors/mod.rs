// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Error types
//!
//! A single error enum covers discovery, graph construction, path
//! resolution, action execution and collection. Graph errors are fatal
//! before any execution starts; everything else is scoped to one
//! RunInstance and recorded in its ExecutionRecords.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type for petflow operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Main error type for petflow
#[derive(Error, Debug, Diagnostic)]
pub enum FlowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Discovery Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Dataset root not found: {path}")]
    #[diagnostic(
        code(petflow::dataset_not_found),
        help("Check 'environment.experiment_dir' and 'environment.data_dir' in your config")
    )]
    DatasetNotFound { path: PathBuf },

    #[error("No values discovered for iteration key '{key}' under {root}")]
    #[diagnostic(
        code(petflow::no_iteration_values),
        help("The dataset must contain at least one 'sub-*' directory with at least one 'ses-*' directory")
    )]
    NoIterationValues { key: String, root: PathBuf },

    #[error("Parameter space is empty: {reason}")]
    #[diagnostic(code(petflow::empty_parameter_space))]
    EmptyParameterSpace { reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Graph has no nodes")]
    #[diagnostic(code(petflow::empty_graph))]
    EmptyGraph,

    #[error("Duplicate node name: '{node}'")]
    #[diagnostic(code(petflow::duplicate_node), help("Node names must be unique within a graph"))]
    DuplicateNode { node: String },

    #[error("Node '{node}' declares {direction} port '{port}' more than once")]
    #[diagnostic(code(petflow::duplicate_port))]
    DuplicatePort {
        node: String,
        port: String,
        direction: String,
    },

    #[error("Unknown node '{node}'")]
    #[diagnostic(code(petflow::unknown_node))]
    UnknownNode { node: String },

    #[error("Node '{node}' has no {direction} port '{port}'")]
    #[diagnostic(code(petflow::unknown_port))]
    UnknownPort {
        node: String,
        port: String,
        direction: String,
    },

    #[error(
        "Port kind mismatch: {source_node}.{source_port} ({source_kind}) -> {target_node}.{target_port} ({target_kind})"
    )]
    #[diagnostic(
        code(petflow::port_kind_mismatch),
        help("An edge may only connect ports of the same kind")
    )]
    PortKindMismatch {
        source_node: String,
        source_port: String,
        source_kind: String,
        target_node: String,
        target_port: String,
        target_kind: String,
    },

    #[error("Input port {node}.{port} is not bound")]
    #[diagnostic(
        code(petflow::unbound_input),
        help("Connect an upstream output to it or bind it to a dataset template")
    )]
    UnboundInput { node: String, port: String },

    #[error("Input port {node}.{port} is bound {count} times")]
    #[diagnostic(
        code(petflow::duplicate_binding),
        help("Each input port takes exactly one edge or one template binding")
    )]
    DuplicateBinding {
        node: String,
        port: String,
        count: usize,
    },

    #[error("Circular dependency detected: {}", .nodes.join(" -> "))]
    #[diagnostic(
        code(petflow::circular_dependency),
        help("Review your edges to remove the cycle")
    )]
    CircularDependency { nodes: Vec<String> },

    #[error("Node '{node}' is invalid: {reason}")]
    #[diagnostic(code(petflow::invalid_node))]
    InvalidNode { node: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Resolution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Placeholder '{{{placeholder}}}' in '{template}' has no value")]
    #[diagnostic(code(petflow::unresolved_placeholder))]
    UnresolvedPlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("Pattern '{pattern}' matched {} files", .matches.len())]
    #[diagnostic(
        code(petflow::ambiguous_match),
        help("Tighten the template so exactly one file matches")
    )]
    AmbiguousMatch {
        pattern: String,
        matches: Vec<PathBuf>,
    },

    #[error("No file matched pattern: {pattern}")]
    #[diagnostic(code(petflow::no_match))]
    NoMatch { pattern: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Node '{node}' exited with code {exit_code}")]
    #[diagnostic(code(petflow::process_failed))]
    ProcessFailed {
        node: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Tool '{tool}' execution failed: {error}")]
    #[diagnostic(code(petflow::tool_execution_failed))]
    ToolExecutionFailed {
        tool: String,
        error: String,
        #[help]
        help: Option<String>,
    },

    #[error("No executor registered for action kind '{kind}'")]
    #[diagnostic(
        code(petflow::executor_not_found),
        help("Available executors: command, function")
    )]
    ExecutorNotFound { kind: String },

    #[error("Node '{node}' did not produce output '{port}'")]
    #[diagnostic(code(petflow::missing_output))]
    MissingOutput { node: String, port: String },

    #[error("Node '{node}' was cancelled")]
    #[diagnostic(code(petflow::cancelled))]
    Cancelled { node: String },

    #[error("Node '{node}' timed out after {seconds}s")]
    #[diagnostic(code(petflow::timeout))]
    Timeout { node: String, seconds: u64 },

    #[error("Node '{node}' skipped because upstream node '{upstream}' failed")]
    #[diagnostic(code(petflow::upstream_failed))]
    UpstreamFailed { node: String, upstream: String },

    // ─────────────────────────────────────────────────────────────────────────
    // File Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(petflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(petflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Cache Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Record store error: {message}")]
    #[diagnostic(code(petflow::cache_error))]
    CacheError { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Invalid configuration: {reason}")]
    #[diagnostic(code(petflow::invalid_config))]
    InvalidConfig {
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(petflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(petflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(petflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(petflow::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(petflow::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for FlowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for FlowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for FlowError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

/// Coarse classification of a failure, persisted in execution records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Discovery,
    Graph,
    Resolution,
    Process,
    MissingOutput,
    Cancelled,
    Timeout,
    UpstreamFailed,
    Io,
    Config,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discovery => "discovery",
            Self::Graph => "graph",
            Self::Resolution => "resolution",
            Self::Process => "process",
            Self::MissingOutput => "missing output",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::UpstreamFailed => "upstream failed",
            Self::Io => "io",
            Self::Config => "config",
        };
        write!(f, "{}", name)
    }
}

impl FlowError {
    /// Classify this error for persistence and reporting
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DatasetNotFound { .. }
            | Self::NoIterationValues { .. }
            | Self::EmptyParameterSpace { .. } => FailureKind::Discovery,

            Self::EmptyGraph
            | Self::DuplicateNode { .. }
            | Self::DuplicatePort { .. }
            | Self::UnknownNode { .. }
            | Self::UnknownPort { .. }
            | Self::PortKindMismatch { .. }
            | Self::UnboundInput { .. }
            | Self::DuplicateBinding { .. }
            | Self::CircularDependency { .. }
            | Self::InvalidNode { .. } => FailureKind::Graph,

            Self::UnresolvedPlaceholder { .. }
            | Self::AmbiguousMatch { .. }
            | Self::NoMatch { .. }
            | Self::GlobPattern { .. } => FailureKind::Resolution,

            Self::ProcessFailed { .. }
            | Self::ToolExecutionFailed { .. }
            | Self::ExecutorNotFound { .. } => FailureKind::Process,

            Self::MissingOutput { .. } => FailureKind::MissingOutput,
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::UpstreamFailed { .. } => FailureKind::UpstreamFailed,

            Self::FileReadError { .. }
            | Self::FileWriteError { .. }
            | Self::CacheError { .. }
            | Self::Io { .. } => FailureKind::Io,

            Self::InvalidConfig { .. }
            | Self::Yaml { .. }
            | Self::Json { .. }
            | Self::Toml { .. } => FailureKind::Config,
        }
    }

    /// Whether this error belongs to graph construction (fatal at startup)
    pub fn is_graph_error(&self) -> bool {
        self.kind() == FailureKind::Graph
    }

    /// Create a process failure carrying the tail of stderr
    pub fn process_failed(node: &str, exit_code: i32, stderr: &str) -> Self {
        const TAIL_LINES: usize = 20;
        let lines: Vec<&str> = stderr.lines().collect();
        let start = lines.len().saturating_sub(TAIL_LINES);

        Self::ProcessFailed {
            node: node.to_string(),
            exit_code,
            stderr: lines[start..].join("\n"),
        }
    }

    /// Create an invalid configuration error without help text
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
            help: None,
        }
    }
}
