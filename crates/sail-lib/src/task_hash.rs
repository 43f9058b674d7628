//! Cache key computation.
//!
//! The key is the SHA-256 of a canonically serialized record of everything
//! that can affect a task's output. Canonical means: struct fields serialize
//! in a fixed order, every map is a `BTreeMap` (sorted by key), and file
//! hash entries are keyed by path. Two runs assembling the same inputs in a
//! different order produce the same key.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Bumped when the meaning of any key input changes, so stale caches read
/// cold instead of wrong.
pub const CACHE_KEY_SCHEMA_VERSION: &str = "1";

/// Environment variables with this prefix are folded into every cache key.
pub const CACHE_BUST_PREFIX: &str = "SAIL_CACHE_BUST";

/// Overrides the runtime version string reported in cache keys.
pub const RUNTIME_VERSION_VAR: &str = "SAIL_RUNTIME_VERSION";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeyInputs {
    pub package: String,
    pub task: String,
    pub executable: String,
    pub command: String,
    /// Declared input files and their content hashes.
    pub input_hashes: BTreeMap<String, String>,
    pub schema_version: String,
    pub runtime_version: String,
    pub arch: String,
    pub platform: String,
    pub lockfile_hash: String,
    /// Captured environment: `NODE_ENV` plus every `SAIL_CACHE_BUST*`
    /// variable.
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config_hashes: BTreeMap<String, String>,
}

impl CacheKeyInputs {
    pub fn new(package: &str, task: &str) -> Self {
        Self {
            package: package.to_string(),
            task: task.to_string(),
            schema_version: CACHE_KEY_SCHEMA_VERSION.to_string(),
            runtime_version: runtime_version(),
            arch: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            env: capture_environment(),
            ..Self::default()
        }
    }

    /// The 64-hex cache key for these inputs.
    pub fn key(&self) -> String {
        let canonical =
            serde_json::to_vec(self).expect("cache key inputs always serialize");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

/// The only environment inputs that affect hit/miss decisions: `NODE_ENV`
/// when set, and every variable whose name starts with the cache-bust
/// prefix, sorted by name.
pub fn capture_environment() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Ok(value) = std::env::var("NODE_ENV") {
        env.insert("NODE_ENV".to_string(), value);
    }
    for (name, value) in std::env::vars() {
        if name.starts_with(CACHE_BUST_PREFIX) {
            env.insert(name, value);
        }
    }
    env
}

fn runtime_version() -> String {
    std::env::var(RUNTIME_VERSION_VAR).unwrap_or_else(|_| "unknown".to_string())
}
