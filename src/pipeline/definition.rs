// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Workflow graph definition structures
//!
//! Defines nodes, ports, edges and bindings, and the schema for workflow
//! YAML files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::{FlowError, FlowResult};
use crate::pipeline::ValidatedGraph;

/// Kind of value carried by a port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    FilePath,
    Scalar,
    ListOfFilePath,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FilePath => write!(f, "file_path"),
            Self::Scalar => write!(f, "scalar"),
            Self::ListOfFilePath => write!(f, "list_of_file_path"),
        }
    }
}

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl std::fmt::Display for PortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// A concrete value flowing through a port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PortValue {
    FilePath(PathBuf),
    Scalar(String),
    ListOfFilePath(Vec<PathBuf>),
}

impl PortValue {
    pub fn kind(&self) -> PortKind {
        match self {
            Self::FilePath(_) => PortKind::FilePath,
            Self::Scalar(_) => PortKind::Scalar,
            Self::ListOfFilePath(_) => PortKind::ListOfFilePath,
        }
    }

    /// Filesystem paths referenced by this value
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::FilePath(p) => vec![p.as_path()],
            Self::Scalar(_) => vec![],
            Self::ListOfFilePath(ps) => ps.iter().map(PathBuf::as_path).collect(),
        }
    }
}

impl std::fmt::Display for PortValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FilePath(p) => write!(f, "{}", p.display()),
            Self::Scalar(s) => write!(f, "{}", s),
            Self::ListOfFilePath(ps) => {
                let joined: Vec<String> = ps.iter().map(|p| p.display().to_string()).collect();
                write!(f, "{}", joined.join(" "))
            }
        }
    }
}

/// Scalar parameter value passed to actions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// A named, typed slot on a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Port {
    pub name: String,
    pub kind: PortKind,

    /// Output ports only: the action may legitimately not produce it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl Port {
    pub fn new(name: impl Into<String>, kind: PortKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }
}

/// What a node does when it runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    /// External command run through a shell
    Command {
        /// Command template; placeholders name inputs, outputs and options
        command: String,

        /// Shell to use (bash, sh, etc.)
        #[serde(default = "default_shell")]
        shell: String,

        /// Output path templates, relative to the node's working directory
        #[serde(default)]
        outputs: BTreeMap<String, String>,

        /// Extra environment variables
        #[serde(default)]
        env: BTreeMap<String, String>,
    },

    /// In-process function looked up by name
    Function { function: String },
}

fn default_shell() -> String {
    "bash".to_string()
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Node name (must be unique within a graph)
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub inputs: Vec<Port>,

    #[serde(default)]
    pub outputs: Vec<Port>,

    pub action: Action,

    /// Action parameters, part of the cache key
    #[serde(default)]
    pub options: BTreeMap<String, ParamValue>,

    /// Per-node timeout overriding the execution default
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Node {
    /// Create a node running an external command
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_action(
            name,
            Action::Command {
                command: command.into(),
                shell: default_shell(),
                outputs: BTreeMap::new(),
                env: BTreeMap::new(),
            },
        )
    }

    /// Create a node calling a registered in-process function
    pub fn function(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self::with_action(
            name,
            Action::Function {
                function: function.into(),
            },
        )
    }

    fn with_action(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            action,
            options: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    /// Add an input port
    pub fn input(mut self, name: impl Into<String>, kind: PortKind) -> Self {
        self.inputs.push(Port::new(name, kind));
        self
    }

    /// Add an output port; for command nodes `template` names the produced path
    pub fn output(mut self, name: impl Into<String>, kind: PortKind, template: &str) -> Self {
        let name = name.into();
        if let Action::Command { outputs, .. } = &mut self.action {
            outputs.insert(name.clone(), template.to_string());
        }
        self.outputs.push(Port::new(name, kind));
        self
    }

    /// Mark the most recently added output port optional
    pub fn optional(mut self) -> Self {
        if let Some(port) = self.outputs.last_mut() {
            port.optional = true;
        }
        self
    }

    /// Set an option value
    pub fn option(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set an environment variable for a command node
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Action::Command { env, .. } = &mut self.action {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Set a per-node timeout
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Executor kind handling this node's action
    pub fn action_kind(&self) -> &'static str {
        match &self.action {
            Action::Command { .. } => "command",
            Action::Function { .. } => "function",
        }
    }

    pub fn input_port(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Look up a port by direction
    pub fn port(&self, name: &str, direction: PortDirection) -> Option<&Port> {
        match direction {
            PortDirection::Input => self.input_port(name),
            PortDirection::Output => self.output_port(name),
        }
    }
}

/// Reference to `node.port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl FromStr for PortRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => Ok(Self::new(node, port)),
            _ => Err(format!("expected 'node.port', got '{}'", s)),
        }
    }
}

impl TryFrom<String> for PortRef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortRef> for String {
    fn from(r: PortRef) -> Self {
        r.to_string()
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Data dependency from one node's output to another node's input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub from: PortRef,
    pub to: PortRef,
}

/// Input port fed from the dataset through the resolver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateBinding {
    pub to: PortRef,
    pub template: String,
}

/// Node output copied into the output tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputBinding {
    pub from: PortRef,

    /// Destination path below the container, may contain placeholders
    pub name: String,

    /// Per-instance directory below the output root
    #[serde(default = "default_container")]
    pub container: String,
}

/// Default per-instance output container
pub fn default_container() -> String {
    "sub-{subject_id}/ses-{session_id}".to_string()
}

/// Workflow graph: nodes, edges, dataset bindings and output bindings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Graph {
    /// Definition version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Nodes in declaration order
    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    #[serde(default)]
    pub bindings: Vec<TemplateBinding>,

    #[serde(default)]
    pub outputs: Vec<OutputBinding>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Graph {
    /// Create an empty graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            bindings: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Load a graph from a YAML file
    pub fn from_file(path: &Path) -> FlowResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FlowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_yaml(&content)
    }

    /// Parse a graph from a YAML string
    pub fn from_yaml(yaml: &str) -> FlowResult<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Add a node; names must be unique
    pub fn add_node(&mut self, node: Node) -> FlowResult<()> {
        if self.get_node(&node.name).is_some() {
            return Err(FlowError::DuplicateNode { node: node.name });
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Connect `source.source_port` to `target.target_port`
    pub fn connect(
        &mut self,
        source: &str,
        source_port: &str,
        target: &str,
        target_port: &str,
    ) -> FlowResult<()> {
        self.require_port(source, source_port, PortDirection::Output)?;
        self.require_port(target, target_port, PortDirection::Input)?;

        self.edges.push(Edge {
            from: PortRef::new(source, source_port),
            to: PortRef::new(target, target_port),
        });
        Ok(())
    }

    /// Bind an input port to a dataset template
    pub fn bind(&mut self, node: &str, port: &str, template: impl Into<String>) -> FlowResult<()> {
        self.require_port(node, port, PortDirection::Input)?;

        self.bindings.push(TemplateBinding {
            to: PortRef::new(node, port),
            template: template.into(),
        });
        Ok(())
    }

    /// Collect an output port into the output tree under `name`
    pub fn collect(&mut self, node: &str, port: &str, name: impl Into<String>) -> FlowResult<()> {
        self.require_port(node, port, PortDirection::Output)?;

        self.outputs.push(OutputBinding {
            from: PortRef::new(node, port),
            name: name.into(),
            container: default_container(),
        });
        Ok(())
    }

    /// Merge per-node option overrides into the graph
    pub fn apply_options(
        &mut self,
        overrides: &BTreeMap<String, BTreeMap<String, ParamValue>>,
    ) -> FlowResult<()> {
        for (node_name, options) in overrides {
            let node = self
                .nodes
                .iter_mut()
                .find(|n| &n.name == node_name)
                .ok_or_else(|| FlowError::config(format!(
                    "node_options refers to unknown node '{}'",
                    node_name
                )))?;

            for (key, value) in options {
                // Only declared options can be overridden; anything else is a typo
                let Some(slot) = node.options.get_mut(key) else {
                    let known: Vec<&str> = node.options.keys().map(String::as_str).collect();
                    return Err(FlowError::InvalidConfig {
                        reason: format!(
                            "node_options sets unknown option '{}' on node '{}'",
                            key, node_name
                        ),
                        help: Some(if known.is_empty() {
                            format!("Node '{}' declares no options", node_name)
                        } else {
                            format!("Declared options: {}", known.join(", "))
                        }),
                    });
                };
                *slot = value.clone();
            }
        }
        Ok(())
    }

    /// Validate the graph; only a validated graph can be executed
    pub fn validate(self) -> FlowResult<ValidatedGraph> {
        ValidatedGraph::new(self)
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Resolve a port reference, reporting which part is unknown
    pub fn require_port(&self, node: &str, port: &str, direction: PortDirection) -> FlowResult<&Port> {
        let found = self.get_node(node).ok_or_else(|| FlowError::UnknownNode {
            node: node.to_string(),
        })?;

        found
            .port(port, direction)
            .ok_or_else(|| FlowError::UnknownPort {
                node: node.to_string(),
                port: port.to_string(),
                direction: direction.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
name: "preprocessing"
nodes:
  - name: motion_correction
    inputs:
      - { name: in_file, kind: file_path }
    outputs:
      - { name: out_file, kind: file_path }
    action:
      type: command
      command: "mcflirt -in {in_file} -out {out_file}"
      outputs:
        out_file: "{in_file.stem}_mcf.nii.gz"
    options:
      cost: normcorr
      dof: 6
  - name: map_subjects
    inputs:
      - { name: session_id, kind: scalar }
      - { name: subject_id, kind: scalar }
    outputs:
      - { name: value, kind: scalar }
    action:
      type: function
      function: join
edges: []
bindings:
  - to: motion_correction.in_file
    template: "sub-{subject_id}/ses-{session_id}/pet/*_pet.nii.gz"
  - to: map_subjects.session_id
    template: "{session_id}"
  - to: map_subjects.subject_id
    template: "{subject_id}"
outputs:
  - from: motion_correction.out_file
    name: preproc/motion_corrected.nii.gz
"#;

    #[test]
    fn test_parse_workflow() {
        let graph = Graph::from_yaml(WORKFLOW).unwrap();

        assert_eq!(graph.name, "preprocessing");
        assert_eq!(graph.node_names(), vec!["motion_correction", "map_subjects"]);
        assert_eq!(graph.bindings.len(), 3);
        assert_eq!(graph.outputs[0].container, default_container());

        let mc = graph.get_node("motion_correction").unwrap();
        assert_eq!(mc.action_kind(), "command");
        assert_eq!(mc.options.get("dof"), Some(&ParamValue::Int(6)));
        assert_eq!(mc.options.get("cost"), Some(&ParamValue::Text("normcorr".into())));
        match &mc.action {
            Action::Command { shell, outputs, .. } => {
                assert_eq!(shell, "bash");
                assert_eq!(outputs["out_file"], "{in_file.stem}_mcf.nii.gz");
            }
            _ => panic!("Expected command action"),
        }
    }

    #[test]
    fn test_port_ref_parsing() {
        let r: PortRef = "reconall.subject_id".parse().unwrap();
        assert_eq!(r, PortRef::new("reconall", "subject_id"));
        assert!("reconall".parse::<PortRef>().is_err());
        assert!(".x".parse::<PortRef>().is_err());
    }

    #[test]
    fn test_bad_port_ref_in_yaml() {
        let yaml = r#"
name: broken
edges:
  - from: nodot
    to: a.b
"#;
        assert!(matches!(Graph::from_yaml(yaml), Err(FlowError::Yaml { .. })));
    }

    #[test]
    fn test_builder_rejects_unknown_ports() {
        let mut graph = Graph::new("g");
        graph
            .add_node(Node::function("a", "identity").output("x", PortKind::Scalar, ""))
            .unwrap();
        graph
            .add_node(Node::function("b", "identity").input("x", PortKind::Scalar))
            .unwrap();

        assert!(graph.connect("a", "x", "b", "x").is_ok());
        assert!(matches!(
            graph.connect("a", "y", "b", "x"),
            Err(FlowError::UnknownPort { .. })
        ));
        assert!(matches!(
            graph.connect("b", "x", "a", "x"),
            Err(FlowError::UnknownPort { .. })
        ));
        assert!(matches!(
            graph.add_node(Node::function("a", "identity")),
            Err(FlowError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn test_apply_options() {
        let mut graph = Graph::from_yaml(WORKFLOW).unwrap();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "motion_correction".to_string(),
            BTreeMap::from([("dof".to_string(), ParamValue::Int(12))]),
        );
        graph.apply_options(&overrides).unwrap();
        assert_eq!(
            graph.get_node("motion_correction").unwrap().options["dof"],
            ParamValue::Int(12)
        );

        overrides.insert("nope".to_string(), BTreeMap::new());
        assert!(graph.apply_options(&overrides).is_err());
    }

    #[test]
    fn test_apply_options_rejects_undeclared_option() {
        let mut graph = Graph::from_yaml(WORKFLOW).unwrap();
        let overrides = BTreeMap::from([(
            "motion_correction".to_string(),
            BTreeMap::from([("dfo".to_string(), ParamValue::Int(12))]),
        )]);

        match graph.apply_options(&overrides) {
            Err(FlowError::InvalidConfig { reason, help }) => {
                assert!(reason.contains("'dfo'"));
                assert_eq!(help.as_deref(), Some("Declared options: cost, dof"));
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert_eq!(
            graph.get_node("motion_correction").unwrap().options["dof"],
            ParamValue::Int(6)
        );
        assert!(!graph.get_node("motion_correction").unwrap().options.contains_key("dfo"));
    }

    #[test]
    fn test_port_value_serde_shape() {
        let value = PortValue::FilePath(PathBuf::from("/w/out.nii.gz"));
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"kind":"file_path","value":"/w/out.nii.gz"}"#);
    }
}
