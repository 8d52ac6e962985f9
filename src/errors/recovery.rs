// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Error recovery suggestions
//!
//! Provides actionable suggestions for recovering from errors.

use super::FlowError;

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Pick a suggestion for an error, if one applies
    pub fn for_error(error: &FlowError) -> Option<Self> {
        match error {
            FlowError::CircularDependency { nodes } => Some(Self::fix_circular_dependency(nodes)),
            FlowError::UnboundInput { node, port } => Some(Self::bind_input(node, port)),
            FlowError::DatasetNotFound { path } => Some(Self::fix_dataset_root(&path.display().to_string())),
            FlowError::ToolExecutionFailed { tool, .. } => Some(Self::install_tool(tool)),
            FlowError::NoMatch { pattern } => Some(Self::fix_missing_inputs(pattern)),
            _ => None,
        }
    }

    /// Suggest installing a missing tool
    pub fn install_tool(tool: &str) -> Self {
        let (steps, commands) = match tool {
            "mcflirt" | "flirt" => (
                vec!["FSL provides motion correction (mcflirt)".to_string()],
                vec![
                    "# Check your FSL setup:".to_string(),
                    "echo $FSLDIR && which mcflirt".to_string(),
                ],
            ),
            "recon-all" | "gtmseg" | "mri_coreg" | "mri_gtmpvc" | "mri_glmfit" => (
                vec![
                    "FreeSurfer/PETSurfer provides reconstruction, segmentation and PVC".to_string(),
                    "Source FreeSurferEnv.sh before running the pipeline".to_string(),
                ],
                vec![
                    "# Check your FreeSurfer setup:".to_string(),
                    "echo $FREESURFER_HOME && which recon-all".to_string(),
                ],
            ),
            _ => (vec![format!("Install {} and ensure it's in your PATH", tool)], vec![]),
        };

        Self {
            action: format!("Install {}", tool),
            steps,
            commands,
        }
    }

    /// Suggest fixing a circular dependency
    pub fn fix_circular_dependency(nodes: &[String]) -> Self {
        Self {
            action: "Remove circular dependency".into(),
            steps: vec![
                format!("Detected cycle: {}", nodes.join(" → ")),
                "Review the edges between these nodes".into(),
                "Ensure nodes form a directed acyclic graph (DAG)".into(),
            ],
            commands: vec![
                "# Visualize your workflow:".into(),
                "petflow graph --format mermaid".into(),
            ],
        }
    }

    /// Suggest binding an unbound input port
    pub fn bind_input(node: &str, port: &str) -> Self {
        Self {
            action: format!("Bind input port {}.{}", node, port),
            steps: vec![
                "Every input port needs exactly one source".into(),
                format!("Add an edge ending at '{}.{}'", node, port),
                "or a template binding resolved against the dataset".into(),
            ],
            commands: vec![],
        }
    }

    /// Suggest fixing the dataset location
    pub fn fix_dataset_root(path: &str) -> Self {
        Self {
            action: "Point petflow at a BIDS dataset".into(),
            steps: vec![
                format!("No dataset found at {}", path),
                "Expected layout: sub-<id>/ses-<id>/{anat,pet}/...".into(),
            ],
            commands: vec![
                "# Override the dataset root:".into(),
                "petflow run --data-dir /path/to/bids".into(),
            ],
        }
    }

    /// Suggest fixing missing input files
    pub fn fix_missing_inputs(pattern: &str) -> Self {
        Self {
            action: format!("Add files matching pattern '{}'", pattern),
            steps: vec![
                "Either add the file to the dataset or update the template".into(),
                "Set 'iteration.skip_missing_sessions' to skip absent sessions".into(),
            ],
            commands: vec![
                "# List files that would match:".into(),
                format!("ls -la {}", pattern),
            ],
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}
