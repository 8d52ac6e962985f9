// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Iteration parameter space
//!
//! A [`ParameterSpace`] holds one ordered axis of values per iteration key
//! (for example `subject_id` and `session_id`) and expands them into the
//! cross product of concrete [`RunInstance`]s.

mod layout;

pub use layout::{BidsLayout, DatasetLayout};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::{FlowError, FlowResult};

/// Iteration key for subject identifiers
pub const SUBJECT_KEY: &str = "subject_id";

/// Iteration key for session identifiers
pub const SESSION_KEY: &str = "session_id";

/// One named axis of variation and its distinct values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

impl Axis {
    /// Create an axis, dropping duplicate values while keeping first-seen order
    pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        let mut seen = HashSet::new();
        let values = values
            .into_iter()
            .filter(|v| seen.insert(v.clone()))
            .collect();

        Self {
            name: name.into(),
            values,
        }
    }
}

/// Cross product of iteration axes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpace {
    axes: Vec<Axis>,
}

impl ParameterSpace {
    /// Build a parameter space; every axis must be non-empty and uniquely named
    pub fn new(axes: Vec<Axis>) -> FlowResult<Self> {
        if axes.is_empty() {
            return Err(FlowError::EmptyParameterSpace {
                reason: "no iteration keys defined".into(),
            });
        }

        let mut names = HashSet::new();
        for axis in &axes {
            if !names.insert(axis.name.as_str()) {
                return Err(FlowError::config(format!(
                    "iteration key '{}' is defined twice",
                    axis.name
                )));
            }
            if axis.values.is_empty() {
                return Err(FlowError::EmptyParameterSpace {
                    reason: format!("iteration key '{}' has no values", axis.name),
                });
            }
        }

        Ok(Self { axes })
    }

    /// Discover subject and session values from a dataset layout
    pub fn discover(layout: &dyn DatasetLayout) -> FlowResult<Self> {
        let keys = layout.discover_keys()?;
        Self::new(keys)
    }

    /// All axes
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Values discovered for one key
    pub fn values(&self, key: &str) -> Option<&[String]> {
        self.axes
            .iter()
            .find(|a| a.name == key)
            .map(|a| a.values.as_slice())
    }

    /// Keep only the listed values for a key
    ///
    /// Values not present in the axis are ignored. Restricting an axis to
    /// nothing is an error because the cross product would be empty.
    pub fn restrict(&mut self, key: &str, keep: &[String]) -> FlowResult<()> {
        let axis = self
            .axes
            .iter_mut()
            .find(|a| a.name == key)
            .ok_or_else(|| FlowError::config(format!("unknown iteration key '{}'", key)))?;

        axis.values.retain(|v| keep.contains(v));

        if axis.values.is_empty() {
            return Err(FlowError::EmptyParameterSpace {
                reason: format!(
                    "none of the requested values for '{}' exist: {}",
                    key,
                    keep.join(", ")
                ),
            });
        }

        Ok(())
    }

    /// Number of run instances in the cross product
    pub fn len(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily expand the cross product; each call restarts from the first instance
    ///
    /// The first axis varies slowest, so `{subject: [01, 02], session: [A]}`
    /// yields `{01, A}` then `{02, A}`.
    pub fn expand(&self) -> RunInstances<'_> {
        RunInstances {
            space: self,
            cursor: Some(vec![0; self.axes.len()]),
        }
    }
}

/// Iterator over the cross product of a [`ParameterSpace`]
pub struct RunInstances<'a> {
    space: &'a ParameterSpace,
    cursor: Option<Vec<usize>>,
}

impl Iterator for RunInstances<'_> {
    type Item = RunInstance;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.as_mut()?;

        let bindings = self
            .space
            .axes
            .iter()
            .zip(cursor.iter())
            .map(|(axis, &i)| (axis.name.clone(), axis.values[i].clone()))
            .collect();

        // Odometer increment, last axis fastest
        let mut exhausted = true;
        for pos in (0..cursor.len()).rev() {
            cursor[pos] += 1;
            if cursor[pos] < self.space.axes[pos].values.len() {
                exhausted = false;
                break;
            }
            cursor[pos] = 0;
        }
        if exhausted {
            self.cursor = None;
        }

        Some(RunInstance { bindings })
    }
}

/// Hex digits of the binding digest in directory names
const DIR_DIGEST_LEN: usize = 16;

/// One concrete binding of every iteration key to a value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunInstance {
    bindings: Vec<(String, String)>,
}

impl RunInstance {
    /// Build a run instance directly from key/value pairs
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            bindings: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value bound to a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Key/value pairs in key order
    pub fn bindings(&self) -> &[(String, String)] {
        &self.bindings
    }

    /// Directory name for this instance's working subdirectory
    ///
    /// A readable prefix (`[A-Za-z0-9._-]` kept, anything else turned into
    /// `-`) followed by a digest of the exact bindings. Instances that only
    /// differ in replaced characters or in where `_` falls still get
    /// distinct directories.
    pub fn dir_name(&self) -> String {
        let readable: String = self
            .bindings
            .iter()
            .map(|(k, v)| format!("_{}_{}", k, v))
            .collect::<String>()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        // Length-prefixed so no two binding lists encode the same way
        let mut hasher = blake3::Hasher::new();
        for (key, value) in &self.bindings {
            for part in [key, value] {
                hasher.update(&(part.len() as u64).to_le_bytes());
                hasher.update(part.as_bytes());
            }
        }
        let digest = hasher.finalize().to_hex();

        format!("{}-{}", readable, &digest.as_str()[..DIR_DIGEST_LEN])
    }
}

impl std::fmt::Display for RunInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .bindings
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
