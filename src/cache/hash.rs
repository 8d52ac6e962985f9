// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Cache key computation
//!
//! Uses BLAKE3. A node's key covers its name, action, options and every
//! input. Inputs fed by an edge contribute the upstream node's key, so a
//! change anywhere upstream changes every key below it.

use blake3::Hasher;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use super::InvalidationMode;
use crate::errors::{FlowError, FlowResult};
use crate::pipeline::{Node, PortValue};

/// What an input contributes to a cache key
#[derive(Debug, Clone, Copy)]
pub enum InputDigest<'a> {
    /// Output of an upstream node, identified by that node's cache key
    Upstream { cache_key: &'a str, port: &'a str },
    /// Value resolved from the dataset
    External(&'a PortValue),
}

/// Incremental hasher with field separation
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Hash a length-prefixed field so adjacent fields cannot run together
    pub fn field(&mut self, data: &[u8]) {
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    /// Hash a node's name, action and options
    pub fn hash_node(&mut self, node: &Node) -> FlowResult<()> {
        self.field(node.name.as_bytes());

        let action = serde_json::to_string(&node.action).map_err(|e| FlowError::CacheError {
            message: format!("Failed to serialize action of '{}': {}", node.name, e),
        })?;
        self.field(action.as_bytes());

        let options = serde_json::to_string(&node.options).map_err(|e| FlowError::CacheError {
            message: format!("Failed to serialize options of '{}': {}", node.name, e),
        })?;
        self.field(options.as_bytes());

        Ok(())
    }

    /// Hash one named input
    pub fn hash_input(
        &mut self,
        name: &str,
        input: &InputDigest<'_>,
        mode: InvalidationMode,
    ) -> FlowResult<()> {
        self.field(name.as_bytes());

        match input {
            InputDigest::Upstream { cache_key, port } => {
                self.field(b"upstream");
                self.field(cache_key.as_bytes());
                self.field(port.as_bytes());
            }
            InputDigest::External(value) => {
                self.field(value.kind().to_string().as_bytes());
                match value {
                    PortValue::Scalar(s) => self.field(s.as_bytes()),
                    PortValue::FilePath(_) | PortValue::ListOfFilePath(_) => {
                        for path in value.paths() {
                            self.field(path.to_string_lossy().as_bytes());
                            self.field(file_fingerprint(path, mode)?.as_bytes());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Hash arbitrary bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and get the hex digest
    pub fn finalize(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the cache key of a node given its inputs
pub fn cache_key(
    node: &Node,
    inputs: &BTreeMap<String, InputDigest<'_>>,
    mode: InvalidationMode,
) -> FlowResult<String> {
    let mut hasher = ContentHasher::new();
    hasher.hash_node(node)?;
    for (name, input) in inputs {
        hasher.hash_input(name, input, mode)?;
    }
    Ok(hasher.finalize())
}

/// Fingerprint of a file or directory under the given invalidation mode
///
/// Directories are fingerprinted by their sorted listing with sizes and
/// modification times, whatever the mode.
pub fn file_fingerprint(path: &Path, mode: InvalidationMode) -> FlowResult<String> {
    if mode == InvalidationMode::Path {
        return Ok(String::new());
    }

    let metadata = std::fs::metadata(path).map_err(|e| FlowError::FileReadError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    if metadata.is_dir() {
        let mut hasher = ContentHasher::new();
        hash_directory(path, path, &mut hasher)?;
        return Ok(hasher.finalize());
    }

    match mode {
        InvalidationMode::ContentHash => hash_file(path),
        _ => Ok(stat_fingerprint(&metadata)),
    }
}

fn stat_fingerprint(metadata: &std::fs::Metadata) -> String {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}:{}", metadata.len(), mtime)
}

fn hash_directory(root: &Path, dir: &Path, hasher: &mut ContentHasher) -> FlowResult<()> {
    let read_error = |e: std::io::Error| FlowError::FileReadError {
        path: dir.to_path_buf(),
        error: e.to_string(),
    };

    let mut entries = std::fs::read_dir(dir)
        .map_err(read_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        hasher.field(relative.to_string_lossy().as_bytes());

        let metadata = entry.metadata().map_err(read_error)?;
        if metadata.is_dir() {
            hash_directory(root, &path, hasher)?;
        } else {
            hasher.field(stat_fingerprint(&metadata).as_bytes());
        }
    }

    Ok(())
}

/// Compute a quick hash of a string
pub fn hash_string(s: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(s.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Compute hash of a file's contents
pub fn hash_file(path: &Path) -> FlowResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| FlowError::FileReadError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    let mut hasher = Hasher::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| FlowError::FileReadError {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;
    Ok(hasher.finalize().to_hex().to_string())
}
