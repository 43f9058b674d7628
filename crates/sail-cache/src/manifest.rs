use sail_paths::AnchoredSystemPathBuf;
use serde::{Deserialize, Serialize};

/// Per-entry manifest. The JSON shape is stable and part of the on-disk
/// interface; renames here are schema changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheManifest {
    pub cache_key: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    pub outputs: Vec<OutputFile>,
    pub stdout: String,
    pub stderr: String,
    /// Always 0: failed tasks are never stored.
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputFile {
    pub path: AnchoredSystemPathBuf,
    pub hash: String,
    pub size: u64,
    pub mode: u32,
}

impl CacheManifest {
    /// Parses manifest JSON, treating any schema violation as unreadable.
    /// Callers turn the error into a cache miss.
    pub fn from_json(raw: &str) -> Result<Self, crate::CacheError> {
        serde_json::from_str(raw).map_err(crate::CacheError::InvalidMetadata)
    }

    pub fn to_json(&self) -> Result<String, crate::CacheError> {
        serde_json::to_string_pretty(self).map_err(crate::CacheError::MetadataWriteFailure)
    }
}
