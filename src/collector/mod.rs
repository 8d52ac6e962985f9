// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Output collection
//!
//! Copies (or hard-links) node outputs from the per-instance working tree
//! into the human-addressable output tree, by default
//! `{output_root}/sub-{subject_id}/ses-{session_id}/{name}`.
//!
//! Each binding is collected on its own: a missing artifact is reported
//! in the [`CollectionReport`] and the remaining bindings still run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::ExecutionRecord;
use crate::errors::{FlowError, FlowResult};
use crate::params::RunInstance;
use crate::pipeline::{InstanceResult, OutputBinding, PortValue};
use crate::resolver::render_template;

/// How collected files reach the output tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Copy file contents
    #[default]
    Copy,
    /// Hard-link files, falling back to a copy across filesystems
    Hardlink,
}

/// One output placed into the output tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    pub binding: String,
    pub destination: PathBuf,
}

/// Outcome of collecting one run instance
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub collected: Vec<CollectedOutput>,
    /// Bindings whose node did not succeed, already reported as node failures
    pub skipped: Vec<String>,
    /// Bindings that should have been collected but could not be
    pub errors: Vec<(String, FlowError)>,
}

impl CollectionReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Places node outputs into the output tree
#[derive(Debug, Clone)]
pub struct OutputCollector {
    output_root: PathBuf,
    mode: LinkMode,
}

impl OutputCollector {
    pub fn new(output_root: impl Into<PathBuf>, mode: LinkMode) -> Self {
        Self {
            output_root: output_root.into(),
            mode,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Collect the outputs of a finished run instance
    pub fn collect_result(&self, result: &InstanceResult, bindings: &[OutputBinding]) -> CollectionReport {
        self.collect(&result.instance, &result.records, bindings)
    }

    /// Collect every binding whose node succeeded or was reused
    pub fn collect(
        &self,
        instance: &RunInstance,
        records: &[ExecutionRecord],
        bindings: &[OutputBinding],
    ) -> CollectionReport {
        let mut report = CollectionReport::default();

        for binding in bindings {
            let label = format!("{} ({})", binding.name, binding.from);

            let record = records.iter().find(|r| r.node == binding.from.node);
            match record {
                Some(record) if record.status.is_success() => {}
                _ => {
                    tracing::debug!(binding = %label, instance = %instance, "Skipping output of unfinished node");
                    report.skipped.push(label);
                    continue;
                }
            }

            match self.collect_one(instance, records, binding) {
                Ok(destination) => {
                    tracing::debug!(binding = %label, destination = %destination.display(), "Collected output");
                    report.collected.push(CollectedOutput {
                        binding: binding.name.clone(),
                        destination,
                    });
                }
                Err(e) => {
                    tracing::warn!(binding = %label, instance = %instance, error = %e, "Failed to collect output");
                    report.errors.push((label, e));
                }
            }
        }

        report
    }

    /// Destination of a binding for an instance
    pub fn destination(&self, instance: &RunInstance, binding: &OutputBinding) -> FlowResult<PathBuf> {
        let render = |template: &str| {
            render_template(template, |name| instance.get(name).map(str::to_string)).map_err(
                |placeholder| FlowError::UnresolvedPlaceholder {
                    template: template.to_string(),
                    placeholder,
                },
            )
        };

        let container = render(&binding.container)?;
        let name = render(&binding.name)?;

        let relative = Path::new(&container).join(&name);
        if relative.is_absolute() || relative.components().any(|c| c.as_os_str() == "..") {
            return Err(FlowError::config(format!(
                "output '{}' escapes the output directory",
                relative.display()
            )));
        }

        Ok(self.output_root.join(relative))
    }

    fn collect_one(
        &self,
        instance: &RunInstance,
        records: &[ExecutionRecord],
        binding: &OutputBinding,
    ) -> FlowResult<PathBuf> {
        let missing = || FlowError::MissingOutput {
            node: binding.from.node.clone(),
            port: binding.from.port.clone(),
        };

        let value = records
            .iter()
            .find(|r| r.node == binding.from.node)
            .and_then(|r| r.outputs.get(&binding.from.port))
            .ok_or_else(missing)?;

        let destination = self.destination(instance, binding)?;
        if let Some(parent) = destination.parent() {
            create_dir(parent)?;
        }

        match value {
            PortValue::FilePath(path) => {
                if !path.exists() {
                    return Err(missing());
                }
                self.place(path, &destination)?;
            }
            PortValue::ListOfFilePath(paths) => {
                if paths.is_empty() || paths.iter().any(|p| !p.exists()) {
                    return Err(missing());
                }
                // Entries are flattened into one directory by file name
                let mut names = BTreeSet::new();
                for path in paths {
                    let name = path.file_name().ok_or_else(missing)?;
                    if !names.insert(name) {
                        return Err(FlowError::FileWriteError {
                            path: destination,
                            error: format!(
                                "more than one file is named '{}'",
                                name.to_string_lossy()
                            ),
                        });
                    }
                }
                let staging = temp_sibling(&destination);
                create_dir(&staging)?;
                for path in paths {
                    let name = path.file_name().ok_or_else(missing)?;
                    self.place(path, &staging.join(name))?;
                }
                replace(&staging, &destination)?;
            }
            PortValue::Scalar(text) => {
                let staging = temp_sibling(&destination);
                fs::write(&staging, text).map_err(|e| write_error(&staging, e))?;
                replace(&staging, &destination)?;
            }
        }

        Ok(destination)
    }

    /// Copy or link a file or directory to `destination`, replacing it
    fn place(&self, source: &Path, destination: &Path) -> FlowResult<()> {
        let staging = temp_sibling(destination);

        if source.is_dir() {
            self.place_dir(source, &staging)?;
        } else {
            self.place_file(source, &staging)?;
        }

        replace(&staging, destination)
    }

    fn place_dir(&self, source: &Path, destination: &Path) -> FlowResult<()> {
        create_dir(destination)?;

        let entries = fs::read_dir(source).map_err(|e| FlowError::FileReadError {
            path: source.to_path_buf(),
            error: e.to_string(),
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let target = destination.join(entry.file_name());
            if path.is_dir() {
                self.place_dir(&path, &target)?;
            } else {
                self.place_file(&path, &target)?;
            }
        }

        Ok(())
    }

    fn place_file(&self, source: &Path, destination: &Path) -> FlowResult<()> {
        if self.mode == LinkMode::Hardlink {
            match fs::hard_link(source, destination) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(source = %source.display(), error = %e, "Hard link failed, copying");
                }
            }
        }

        fs::copy(source, destination)
            .map(|_| ())
            .map_err(|e| write_error(destination, e))
    }
}

fn create_dir(path: &Path) -> FlowResult<()> {
    fs::create_dir_all(path).map_err(|e| write_error(path, e))
}

fn write_error(path: &Path, e: std::io::Error) -> FlowError {
    FlowError::FileWriteError {
        path: path.to_path_buf(),
        error: e.to_string(),
    }
}

/// Staging path next to `path`, on the same filesystem
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

/// Move `staging` over `destination`, removing whatever was there
fn replace(staging: &Path, destination: &Path) -> FlowResult<()> {
    if destination.is_dir() {
        fs::remove_dir_all(destination).map_err(|e| write_error(destination, e))?;
    }
    fs::rename(staging, destination).map_err(|e| write_error(destination, e))
}
