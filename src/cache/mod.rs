// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Execution records and idempotent re-runs
//!
//! Every attempted node execution leaves an [`ExecutionRecord`] keyed by
//! run instance and node. A later run skips the node when its stored
//! cache key matches and its outputs still exist.

mod filesystem;
mod hash;

pub use filesystem::FilesystemRecordStore;
pub use hash::{cache_key, file_fingerprint, hash_string, ContentHasher, InputDigest};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::errors::{FailureKind, FlowError, FlowResult};
use crate::params::RunInstance;
use crate::pipeline::PortValue;

/// How external input files contribute to cache keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Hash file contents
    #[default]
    ContentHash,
    /// Use size and modification time
    Mtime,
    /// Use the path only
    Path,
}

/// Lifecycle state of one node within one run instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    /// Skipped because a matching successful record existed
    Cached,
    Succeeded,
    Failed,
}

impl NodeStatus {
    /// Whether downstream nodes may consume this node's outputs
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Cached => write!(f, "cached"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Failure captured in a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&FlowError> for RecordedError {
    fn from(e: &FlowError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Persisted outcome of executing one node for one run instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub node: String,
    pub instance: RunInstance,
    pub cache_key: String,
    pub status: NodeStatus,

    /// Resolved input values, keyed by port
    #[serde(default)]
    pub inputs: BTreeMap<String, PortValue>,

    /// Produced output values, keyed by port
    #[serde(default)]
    pub outputs: BTreeMap<String, PortValue>,

    #[serde(default)]
    pub error: Option<RecordedError>,

    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,

    /// Rendered command line, for command actions
    #[serde(default)]
    pub command: Option<String>,
}

impl ExecutionRecord {
    /// A fresh record for a node that has not run yet
    pub fn pending(node: impl Into<String>, instance: RunInstance) -> Self {
        Self {
            node: node.into(),
            instance,
            cache_key: String::new(),
            status: NodeStatus::Pending,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            error: None,
            started_at: None,
            finished_at: None,
            command: None,
        }
    }

    /// Mark the record failed with `error`
    pub fn fail(&mut self, error: &FlowError) {
        self.status = NodeStatus::Failed;
        self.error = Some(RecordedError::from(error));
        self.finished_at = Some(SystemTime::now());
    }

    /// Whether this record lets a node with `key` be skipped
    ///
    /// Requires a successful status, the same cache key, and every
    /// produced file output still present on disk.
    pub fn is_reusable(&self, key: &str) -> bool {
        self.status.is_success()
            && self.cache_key == key
            && self
                .outputs
                .values()
                .flat_map(PortValue::paths)
                .all(|p| p.exists())
    }

    /// Wall time between start and finish
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        end.duration_since(start).ok()
    }
}

/// Storage for execution records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load the record for a node of an instance, if one exists
    async fn load(&self, instance: &RunInstance, node: &str) -> FlowResult<Option<ExecutionRecord>>;

    /// Persist a record, replacing any previous one atomically
    async fn store(&self, record: &ExecutionRecord) -> FlowResult<()>;

    /// Remove the record for a node of an instance
    async fn invalidate(&self, instance: &RunInstance, node: &str) -> FlowResult<()>;

    /// Remove every record
    async fn clear(&self) -> FlowResult<()>;

    /// Summary of stored records
    async fn stats(&self) -> FlowResult<CacheStats>;
}

/// Record store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of stored records
    pub entries: usize,
    /// Records whose node succeeded or was reused
    pub succeeded: usize,
    /// Records whose node failed
    pub failed: usize,
    /// Total size of the working tree in bytes
    pub size_bytes: u64,
    pub oldest_entry: Option<SystemTime>,
    pub newest_entry: Option<SystemTime>,
}

impl CacheStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.2} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn instance() -> RunInstance {
        RunInstance::from_pairs([("subject_id", "01"), ("session_id", "A")])
    }

    #[test]
    fn test_reusable_requires_matching_key_and_outputs() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.nii.gz");
        std::fs::write(&out, b"x").unwrap();

        let mut record = ExecutionRecord::pending("mc", instance());
        record.cache_key = "abc".into();
        record.status = NodeStatus::Succeeded;
        record
            .outputs
            .insert("out_file".into(), PortValue::FilePath(out.clone()));

        assert!(record.is_reusable("abc"));
        assert!(!record.is_reusable("abd"));

        std::fs::remove_file(&out).unwrap();
        assert!(!record.is_reusable("abc"));
    }

    #[test]
    fn test_failed_record_is_not_reusable() {
        let mut record = ExecutionRecord::pending("mc", instance());
        record.cache_key = "abc".into();
        record.fail(&FlowError::Timeout {
            node: "mc".into(),
            seconds: 1,
        });

        assert!(!record.is_reusable("abc"));
        assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn test_scalar_outputs_do_not_block_reuse() {
        let mut record = ExecutionRecord::pending("join", instance());
        record.cache_key = "k".into();
        record.status = NodeStatus::Cached;
        record.outputs.insert("value".into(), PortValue::Scalar("A_01".into()));
        record.inputs.insert(
            "in".into(),
            PortValue::FilePath(PathBuf::from("/does/not/matter")),
        );

        assert!(record.is_reusable("k"));
    }

    #[test]
    fn test_formatted_size() {
        let stats = CacheStats {
            size_bytes: 1536,
            ..Default::default()
        };
        assert_eq!(stats.formatted_size(), "1.50 KB");
    }
}
