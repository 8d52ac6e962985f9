// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Dataset discovery
//!
//! Enumerates subject and session identifiers from a BIDS-style directory
//! tree (`sub-<id>/ses-<id>/<modality>/...`).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{Axis, RunInstance, SESSION_KEY, SUBJECT_KEY};
use crate::errors::{FlowError, FlowResult};

/// Read-only view of a dataset used to populate the parameter space
pub trait DatasetLayout: Send + Sync {
    /// Dataset root directory
    fn root(&self) -> &Path;

    /// Discover iteration keys and their ordered distinct values
    fn discover_keys(&self) -> FlowResult<Vec<Axis>>;

    /// Whether `sub-{s}/ses-{t}/{modality}/*_{suffix}` exists for an instance
    fn has_file(&self, instance: &RunInstance, modality: &str, suffix: &str) -> bool;

    /// Whether the instance's session directory exists at all
    fn has_session(&self, instance: &RunInstance) -> bool;
}

/// BIDS directory layout
#[derive(Debug, Clone)]
pub struct BidsLayout {
    root: PathBuf,
}

impl BidsLayout {
    /// Create a layout rooted at `root`; the directory must exist
    pub fn new(root: impl Into<PathBuf>) -> FlowResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(FlowError::DatasetNotFound { path: root });
        }
        Ok(Self { root })
    }

    /// Subject identifiers (`sub-` prefix stripped), sorted
    pub fn subjects(&self) -> FlowResult<Vec<String>> {
        Ok(Self::prefixed_dirs(&self.root, "sub-")?.into_iter().collect())
    }

    /// Session identifiers across all subjects, sorted and distinct
    pub fn sessions(&self) -> FlowResult<Vec<String>> {
        let mut sessions = BTreeSet::new();
        for subject in self.subjects()? {
            let subject_dir = self.root.join(format!("sub-{}", subject));
            sessions.extend(Self::prefixed_dirs(&subject_dir, "ses-")?);
        }
        Ok(sessions.into_iter().collect())
    }

    fn session_dir(&self, instance: &RunInstance) -> Option<PathBuf> {
        let subject = instance.get(SUBJECT_KEY)?;
        let session = instance.get(SESSION_KEY)?;
        Some(
            self.root
                .join(format!("sub-{}", subject))
                .join(format!("ses-{}", session)),
        )
    }

    fn prefixed_dirs(dir: &Path, prefix: &str) -> FlowResult<BTreeSet<String>> {
        let entries = std::fs::read_dir(dir).map_err(|e| FlowError::FileReadError {
            path: dir.to_path_buf(),
            error: e.to_string(),
        })?;

        let mut found = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_prefix(prefix)) {
                if !id.is_empty() {
                    found.insert(id.to_string());
                }
            }
        }

        Ok(found)
    }
}

impl DatasetLayout for BidsLayout {
    fn root(&self) -> &Path {
        &self.root
    }

    fn discover_keys(&self) -> FlowResult<Vec<Axis>> {
        let subjects = self.subjects()?;
        if subjects.is_empty() {
            return Err(FlowError::NoIterationValues {
                key: SUBJECT_KEY.into(),
                root: self.root.clone(),
            });
        }

        let sessions = self.sessions()?;
        if sessions.is_empty() {
            return Err(FlowError::NoIterationValues {
                key: SESSION_KEY.into(),
                root: self.root.clone(),
            });
        }

        tracing::debug!(
            subjects = subjects.len(),
            sessions = sessions.len(),
            "Discovered dataset keys"
        );

        Ok(vec![
            Axis::new(SUBJECT_KEY, subjects),
            Axis::new(SESSION_KEY, sessions),
        ])
    }

    fn has_file(&self, instance: &RunInstance, modality: &str, suffix: &str) -> bool {
        let Some(dir) = self.session_dir(instance) else {
            return false;
        };
        let pattern = dir
            .join(modality)
            .join(format!("*_{}", suffix))
            .to_string_lossy()
            .to_string();

        glob::glob(&pattern)
            .map(|mut paths| paths.any(|p| p.is_ok()))
            .unwrap_or(false)
    }

    fn has_session(&self, instance: &RunInstance) -> bool {
        self.session_dir(instance).is_some_and(|d| d.is_dir())
    }
}
