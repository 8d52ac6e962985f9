// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Filesystem-backed record store
//!
//! Records live next to the node working directories:
//! `{work_root}/{instance}/{node}.json` beside `{work_root}/{instance}/{node}/`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{CacheStats, ExecutionRecord, RecordStore};
use crate::errors::{FlowError, FlowResult};
use crate::params::RunInstance;

/// Record store writing one JSON file per (instance, node)
#[derive(Debug, Clone)]
pub struct FilesystemRecordStore {
    work_root: PathBuf,
}

impl FilesystemRecordStore {
    /// Create a store under `work_root`, creating the directory if needed
    pub fn new(work_root: impl Into<PathBuf>) -> FlowResult<Self> {
        let work_root = work_root.into();
        std::fs::create_dir_all(&work_root).map_err(|e| FlowError::CacheError {
            message: format!("Failed to create working directory {}: {}", work_root.display(), e),
        })?;

        Ok(Self { work_root })
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Working directory of one run instance
    pub fn instance_dir(&self, instance: &RunInstance) -> PathBuf {
        self.work_root.join(instance.dir_name())
    }

    /// Path of the record for a node of an instance
    pub fn record_path(&self, instance: &RunInstance, node: &str) -> PathBuf {
        self.instance_dir(instance).join(format!("{}.json", node))
    }

    /// Every record file under the working root
    fn record_files(&self) -> FlowResult<Vec<PathBuf>> {
        let mut files = Vec::new();

        if !self.work_root.exists() {
            return Ok(files);
        }

        for instance_dir in std::fs::read_dir(&self.work_root).map_err(|e| FlowError::CacheError {
            message: format!("Failed to read working directory: {}", e),
        })? {
            let instance_dir = instance_dir
                .map_err(|e| FlowError::CacheError {
                    message: format!("Failed to read working directory entry: {}", e),
                })?
                .path();

            if !instance_dir.is_dir() {
                continue;
            }

            for entry in std::fs::read_dir(&instance_dir).map_err(|e| FlowError::CacheError {
                message: format!("Failed to read instance directory: {}", e),
            })? {
                let path = entry
                    .map_err(|e| FlowError::CacheError {
                        message: format!("Failed to read record entry: {}", e),
                    })?
                    .path();

                if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Load every readable record
    pub async fn list_records(&self) -> FlowResult<Vec<ExecutionRecord>> {
        let mut records = Vec::new();

        for path in self.record_files()? {
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<ExecutionRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        Ok(records)
    }

    /// Calculate directory size recursively
    fn dir_size(path: &Path) -> FlowResult<u64> {
        let mut size = 0;

        if path.is_file() {
            return Ok(path.metadata().map(|m| m.len()).unwrap_or(0));
        }

        for entry in std::fs::read_dir(path).map_err(|e| FlowError::CacheError {
            message: format!("Failed to read directory: {}", e),
        })? {
            let entry = entry.map_err(|e| FlowError::CacheError {
                message: format!("Failed to read entry: {}", e),
            })?;

            let path = entry.path();
            if path.is_dir() {
                size += Self::dir_size(&path)?;
            } else {
                size += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }

        Ok(size)
    }
}

#[async_trait]
impl RecordStore for FilesystemRecordStore {
    async fn load(&self, instance: &RunInstance, node: &str) -> FlowResult<Option<ExecutionRecord>> {
        let path = self.record_path(instance, node);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FlowError::CacheError {
                    message: format!("Failed to read record {}: {}", path.display(), e),
                })
            }
        };

        // A corrupt record only costs a re-run
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt record");
                Ok(None)
            }
        }
    }

    async fn store(&self, record: &ExecutionRecord) -> FlowResult<()> {
        let path = self.record_path(&record.instance, &record.node);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| FlowError::CacheError {
                message: format!("Failed to create record directory: {}", e),
            })?;
        }

        let json = serde_json::to_string_pretty(record).map_err(|e| FlowError::CacheError {
            message: format!("Failed to serialize record: {}", e),
        })?;

        // Write then rename so readers never observe a partial record
        let tmp = path.with_extension(format!("json.tmp-{}", std::process::id()));
        tokio::fs::write(&tmp, json).await.map_err(|e| FlowError::FileWriteError {
            path: tmp.clone(),
            error: e.to_string(),
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| FlowError::FileWriteError {
            path: path.clone(),
            error: e.to_string(),
        })?;

        Ok(())
    }

    async fn invalidate(&self, instance: &RunInstance, node: &str) -> FlowResult<()> {
        let path = self.record_path(instance, node);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FlowError::CacheError {
                message: format!("Failed to remove record: {}", e),
            }),
        }
    }

    async fn clear(&self) -> FlowResult<()> {
        for path in self.record_files()? {
            tokio::fs::remove_file(&path).await.map_err(|e| FlowError::CacheError {
                message: format!("Failed to remove record {}: {}", path.display(), e),
            })?;
        }

        Ok(())
    }

    async fn stats(&self) -> FlowResult<CacheStats> {
        let records = self.list_records().await?;

        let mut stats = CacheStats {
            entries: records.len(),
            ..Default::default()
        };

        for record in &records {
            if record.status.is_success() {
                stats.succeeded += 1;
            } else if record.status == super::NodeStatus::Failed {
                stats.failed += 1;
            }

            if let Some(ts) = record.finished_at.or(record.started_at) {
                stats.oldest_entry = Some(stats.oldest_entry.map_or(ts, |o| o.min(ts)));
                stats.newest_entry = Some(stats.newest_entry.map_or(ts, |n| n.max(ts)));
            }
        }

        if self.work_root.exists() {
            stats.size_bytes = Self::dir_size(&self.work_root)?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeStatus;
    use crate::pipeline::PortValue;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn record(node: &str, status: NodeStatus) -> ExecutionRecord {
        let instance = RunInstance::from_pairs([("subject_id", "01"), ("session_id", "A")]);
        let mut record = ExecutionRecord::pending(node, instance);
        record.cache_key = "key".into();
        record.status = status;
        record.started_at = Some(SystemTime::now());
        record.finished_at = Some(SystemTime::now());
        record
            .outputs
            .insert("value".into(), PortValue::Scalar("A_01".into()));
        record
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemRecordStore::new(temp_dir.path()).unwrap();

        let rec = record("map_subjects", NodeStatus::Succeeded);
        store.store(&rec).await.unwrap();

        let path = store.record_path(&rec.instance, "map_subjects");
        assert!(path.ends_with(format!("{}/map_subjects.json", rec.instance.dir_name())));
        assert!(path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("_subject_id_01_session_id_A-")));

        let loaded = store.load(&rec.instance, "map_subjects").await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(store.load(&rec.instance, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemRecordStore::new(temp_dir.path()).unwrap();

        let rec = record("a", NodeStatus::Running);
        store.store(&rec).await.unwrap();
        store.store(&record("a", NodeStatus::Succeeded)).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.instance_dir(&rec.instance))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json"]);

        let loaded = store.load(&rec.instance, "a").await.unwrap().unwrap();
        assert_eq!(loaded.status, NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemRecordStore::new(temp_dir.path()).unwrap();
        let rec = record("a", NodeStatus::Succeeded);

        let path = store.record_path(&rec.instance, "a");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(store.load(&rec.instance, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemRecordStore::new(temp_dir.path()).unwrap();

        store.store(&record("a", NodeStatus::Succeeded)).await.unwrap();
        store.store(&record("b", NodeStatus::Failed)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);

        let rec = record("a", NodeStatus::Succeeded);
        store.invalidate(&rec.instance, "a").await.unwrap();
        store.invalidate(&rec.instance, "a").await.unwrap();
        assert_eq!(store.stats().await.unwrap().entries, 1);

        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap().entries, 0);
    }
}
