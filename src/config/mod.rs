// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Run configuration
//!
//! A run is described by `petflow.yaml` (or a `.toml` file with the same
//! shape):
//!
//! ```yaml
//! environment:
//!   experiment_dir: /data/study
//!   data_dir: data
//!   working_dir: working_dir
//!   output_dir: output_dir
//! execution:
//!   workers: 4
//!   cache:
//!     invalidation: mtime
//! iteration:
//!   subjects: ["01", "02"]
//! workflow: workflow.yaml      # or a `pet:` section
//! node_options:
//!   smooth:
//!     fwhm: 6
//! ```
//!
//! Everything is checked by [`RunConfig::validate`] when loading, before
//! any node runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::InvalidationMode;
use crate::collector::LinkMode;
use crate::errors::{FlowError, FlowResult};
use crate::pipeline::{ExecutionOptions, Graph, ParamValue};
use crate::presets::PetConfig;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "petflow.yaml";

/// Complete run configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub iteration: IterationConfig,

    /// Workflow definition file
    #[serde(default)]
    pub workflow: Option<PathBuf>,

    /// Built-in PET preset
    #[serde(default)]
    pub pet: Option<PetConfig>,

    /// Per-node option overrides, `node -> option -> value`
    #[serde(default)]
    pub node_options: BTreeMap<String, BTreeMap<String, ParamValue>>,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    base_dir: PathBuf,
}

/// Directory layout of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default = "default_experiment_dir")]
    pub experiment_dir: PathBuf,

    /// BIDS dataset, relative to `experiment_dir`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Per-instance working directories and execution records
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Collected outputs
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            experiment_dir: default_experiment_dir(),
            data_dir: default_data_dir(),
            working_dir: default_working_dir(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_experiment_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("working_dir")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output_dir")
}

/// Scheduling and caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Run instances processed in parallel
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Independent nodes of one instance running at once
    #[serde(default = "default_workers")]
    pub node_concurrency: usize,

    /// Timeout for nodes without their own
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub link_mode: LinkMode,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            node_concurrency: default_workers(),
            timeout_secs: None,
            cache: CacheConfig::default(),
            link_mode: LinkMode::default(),
        }
    }
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub invalidation: InvalidationMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            invalidation: InvalidationMode::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Which run instances to execute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IterationConfig {
    /// Only these subjects; all discovered subjects when unset
    #[serde(default)]
    pub subjects: Option<Vec<String>>,

    /// Only these sessions; all discovered sessions when unset
    #[serde(default)]
    pub sessions: Option<Vec<String>>,

    /// Drop instances whose `sub-X/ses-Y` directory does not exist
    #[serde(default)]
    pub skip_missing_sessions: bool,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub workers: Option<usize>,
}

/// Absolute directories of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub experiment_dir: PathBuf,
    pub data_dir: PathBuf,
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl RunConfig {
    /// Load and validate a configuration file
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn load(path: &Path) -> FlowResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FlowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            _ => Self::from_yaml(&content)?,
        };

        let base = path.parent().unwrap_or(Path::new("."));
        config.base_dir = absolute(base)?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse YAML; relative paths resolve against the current directory
    pub fn from_yaml(yaml: &str) -> FlowResult<Self> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.base_dir = std::env::current_dir()?;
        Ok(config)
    }

    /// Parse TOML; relative paths resolve against the current directory
    pub fn from_toml(content: &str) -> FlowResult<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.base_dir = std::env::current_dir()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching the dataset
    pub fn validate(&self) -> FlowResult<()> {
        let exec = &self.execution;

        if exec.workers == 0 {
            return Err(FlowError::config("execution.workers must be at least 1"));
        }
        if exec.node_concurrency == 0 {
            return Err(FlowError::config("execution.node_concurrency must be at least 1"));
        }
        if exec.timeout_secs == Some(0) {
            return Err(FlowError::config("execution.timeout_secs must be positive"));
        }

        match (&self.workflow, &self.pet) {
            (Some(_), Some(_)) => {
                return Err(FlowError::InvalidConfig {
                    reason: "both `workflow` and `pet` are set".into(),
                    help: Some("Choose a workflow file or the built-in PET preset, not both".into()),
                })
            }
            (None, None) => {
                return Err(FlowError::InvalidConfig {
                    reason: "no workflow configured".into(),
                    help: Some("Set `workflow: <file>` or add a `pet:` section".into()),
                })
            }
            (None, Some(pet)) => {
                pet.validate()?;
                if !self.node_options.is_empty() {
                    return Err(FlowError::InvalidConfig {
                        reason: "node_options cannot be used with the PET preset".into(),
                        help: Some("Set options in the typed `pet:` sections instead".into()),
                    });
                }
            }
            (Some(_), None) => {}
        }

        for (key, values) in [
            ("subjects", &self.iteration.subjects),
            ("sessions", &self.iteration.sessions),
        ] {
            if values.as_ref().is_some_and(Vec::is_empty) {
                return Err(FlowError::config(format!(
                    "iteration.{} is empty; remove it to use every discovered value",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Apply command-line overrides, resolved against the current directory
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> FlowResult<()> {
        if let Some(dir) = overrides.data_dir {
            self.environment.data_dir = absolute(&dir)?;
        }
        if let Some(dir) = overrides.work_dir {
            self.environment.working_dir = absolute(&dir)?;
        }
        if let Some(dir) = overrides.output_dir {
            self.environment.output_dir = absolute(&dir)?;
        }
        if let Some(workers) = overrides.workers {
            self.execution.workers = workers;
        }
        self.validate()
    }

    /// Absolute directories of this run
    pub fn paths(&self) -> RunPaths {
        let env = &self.environment;
        let experiment_dir = self.base_dir.join(&env.experiment_dir);

        RunPaths {
            data_dir: experiment_dir.join(&env.data_dir),
            working_dir: experiment_dir.join(&env.working_dir),
            output_dir: experiment_dir.join(&env.output_dir),
            experiment_dir,
        }
    }

    /// Build the workflow graph with option overrides applied
    pub fn build_graph(&self) -> FlowResult<Graph> {
        if let Some(pet) = &self.pet {
            let paths = self.paths();
            return pet.build_graph(&self.subjects_dir_for(pet), &paths.experiment_dir);
        }

        let Some(workflow) = &self.workflow else {
            return Err(FlowError::config("no workflow configured"));
        };

        let mut graph = Graph::from_file(&self.base_dir.join(workflow))?;
        graph.apply_options(&self.node_options)?;
        Ok(graph)
    }

    /// Directories that must exist before the workflow starts
    pub fn bootstrap_dirs(&self) -> Vec<PathBuf> {
        let paths = self.paths();
        let mut dirs = vec![paths.working_dir, paths.output_dir];
        if let Some(pet) = &self.pet {
            dirs.push(self.subjects_dir_for(pet));
        }
        dirs
    }

    fn subjects_dir_for(&self, pet: &PetConfig) -> PathBuf {
        pet.subjects_dir(&self.paths().experiment_dir)
    }

    /// Executor options derived from the `execution` section
    pub fn execution_options(&self) -> ExecutionOptions {
        let exec = &self.execution;
        ExecutionOptions {
            workers: exec.workers,
            node_concurrency: exec.node_concurrency,
            default_timeout: exec.timeout_secs.map(Duration::from_secs),
            use_cache: exec.cache.enabled,
            invalidation: exec.cache.invalidation,
            ..ExecutionOptions::default()
        }
    }
}

fn absolute(path: &Path) -> FlowResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RunConfig::from_yaml("workflow: flow.yaml").unwrap();
        config.validate().unwrap();

        assert_eq!(config.execution.workers, 1);
        assert!(config.execution.cache.enabled);
        assert_eq!(config.execution.link_mode, LinkMode::Copy);
        assert_eq!(config.environment.data_dir, PathBuf::from("data"));

        let options = config.execution_options();
        assert!(options.use_cache);
        assert_eq!(options.default_timeout, None);
    }

    #[test]
    fn test_load_resolves_relative_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("petflow.yaml");
        std::fs::write(
            &path,
            r#"
environment:
  experiment_dir: study
  output_dir: /abs/out
execution:
  workers: 3
  timeout_secs: 60
  cache:
    invalidation: mtime
  link_mode: hardlink
workflow: flow.yaml
"#,
        )
        .unwrap();

        let config = RunConfig::load(&path).unwrap();
        let paths = config.paths();
        assert_eq!(paths.experiment_dir, dir.path().join("study"));
        assert_eq!(paths.data_dir, dir.path().join("study/data"));
        assert_eq!(paths.working_dir, dir.path().join("study/working_dir"));
        assert_eq!(paths.output_dir, PathBuf::from("/abs/out"));

        let options = config.execution_options();
        assert_eq!(options.workers, 3);
        assert_eq!(options.default_timeout, Some(Duration::from_secs(60)));
        assert_eq!(options.invalidation, InvalidationMode::Mtime);
        assert_eq!(config.execution.link_mode, LinkMode::Hardlink);
    }

    #[test]
    fn test_toml_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("petflow.toml");
        std::fs::write(
            &path,
            r#"
workflow = "flow.yaml"

[execution]
workers = 2

[iteration]
subjects = ["01"]
skip_missing_sessions = true
"#,
        )
        .unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.execution.workers, 2);
        assert_eq!(config.iteration.subjects, Some(vec!["01".to_string()]));
        assert!(config.iteration.skip_missing_sessions);
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let unknown = RunConfig::from_yaml("workflow: a.yaml\nexecution:\n  wokers: 2\n");
        assert!(unknown.is_err());

        let zero = RunConfig::from_yaml("workflow: a.yaml\nexecution:\n  workers: 0\n").unwrap();
        assert!(zero.validate().is_err());

        let neither = RunConfig::from_yaml("execution:\n  workers: 2\n").unwrap();
        assert!(neither.validate().is_err());

        let empty = RunConfig::from_yaml("workflow: a.yaml\niteration:\n  sessions: []\n").unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_pet_preset_config() {
        let yaml = r#"
environment:
  experiment_dir: /exp
pet:
  time_weighted_average:
    command: "pet-twa {in_file} {json_file} {out_file}"
  gtmseg:
    output_port: gtm_file
  partial_volume_correction:
    psf: 4
"#;
        let config = RunConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert!(config.bootstrap_dirs().contains(&PathBuf::from("/exp/freesurfer")));
        let graph = config.build_graph().unwrap();
        assert_eq!(graph.name, "pet_preprocessing");
        graph.validate().unwrap();

        let with_options = format!("{}node_options:\n  gtmseg:\n    xcerseg: true\n", yaml);
        let config = RunConfig::from_yaml(&with_options).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_and_node_options() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("flow.yaml"),
            r#"
name: smooth
nodes:
  - name: smooth
    inputs:
      - { name: in_file, kind: file_path }
    outputs:
      - { name: out_file, kind: file_path }
    action:
      type: command
      command: "smooth {in_file} {fwhm} {out_file}"
      outputs:
        out_file: "smoothed.nii.gz"
    options:
      fwhm: 4
bindings:
  - { to: smooth.in_file, template: "sub-{subject_id}/anat/*_T1w.nii" }
"#,
        )
        .unwrap();

        let path = dir.path().join("petflow.yaml");
        std::fs::write(&path, "workflow: flow.yaml\nnode_options:\n  smooth:\n    fwhm: 8\n").unwrap();

        let mut config = RunConfig::load(&path).unwrap();
        let graph = config.build_graph().unwrap();
        assert_eq!(graph.get_node("smooth").unwrap().options["fwhm"], ParamValue::Int(8));

        config
            .apply_overrides(ConfigOverrides {
                output_dir: Some(dir.path().join("elsewhere")),
                workers: Some(4),
                ..ConfigOverrides::default()
            })
            .unwrap();
        assert_eq!(config.paths().output_dir, dir.path().join("elsewhere"));
        assert_eq!(config.execution.workers, 4);

        let zero = config.apply_overrides(ConfigOverrides {
            workers: Some(0),
            ..ConfigOverrides::default()
        });
        assert!(zero.is_err());
    }

    #[test]
    fn test_misspelled_node_option_fails_graph_build() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("flow.yaml"),
            r#"
name: smooth
nodes:
  - name: smooth
    inputs:
      - { name: in_file, kind: file_path }
    action:
      type: command
      command: "smooth {in_file} {fwhm}"
    options:
      fwhm: 4
bindings:
  - { to: smooth.in_file, template: "sub-{subject_id}/anat/*_T1w.nii" }
"#,
        )
        .unwrap();

        let path = dir.path().join("petflow.yaml");
        std::fs::write(&path, "workflow: flow.yaml\nnode_options:\n  smooth:\n    fhwm: 8\n").unwrap();

        let config = RunConfig::load(&path).unwrap();
        match config.build_graph() {
            Err(FlowError::InvalidConfig { reason, .. }) => assert!(reason.contains("'fhwm'")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }
}
