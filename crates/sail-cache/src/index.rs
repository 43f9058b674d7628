use std::collections::BTreeMap;

use sail_paths::AbsoluteSystemPath;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CacheError;

/// Maps cache key -> entry location. Used for hit bookkeeping and LRU prune.
/// A key is only present here once its entry is fully written; readers that
/// find a key in the index may assume the entry is complete.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheIndex {
    entries: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexEntry {
    /// Path of the entry directory relative to the versioned cache root.
    pub entry_dir: String,
    /// Unix epoch milliseconds of the last lookup or store.
    pub last_access: u64,
    pub size: u64,
}

impl CacheIndex {
    /// Loads the index, falling back to an empty one when the file is absent
    /// or unreadable. A corrupt index only costs cold lookups; the entries
    /// themselves are intact.
    pub fn load(path: &AbsoluteSystemPath) -> Self {
        match path.read_existing_to_string() {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                debug!("cache index at {path} is unreadable, starting cold: {e}");
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                debug!("failed to read cache index at {path}: {e}");
                Self::default()
            }
        }
    }

    /// Atomically persists the index. This is the commit point for stores.
    pub fn save(&self, path: &AbsoluteSystemPath) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(self).map_err(CacheError::MetadataWriteFailure)?;
        let temp = path
            .parent()
            .expect("index file has a parent directory")
            .join_component(&format!(".index.json.{}.tmp", std::process::id()));
        temp.create_with_contents(&json)?;
        temp.rename(path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub fn touch(&mut self, key: &str, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access = now_ms;
        }
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }

    /// Keys ordered least recently used first.
    pub fn lru_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.iter().collect();
        keys.sort_by_key(|(_, entry)| entry.last_access);
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use sail_paths::AbsoluteSystemPath;

    use super::*;

    #[test]
    fn test_save_load_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let index_path = root.join_component("index.json");

        let mut index = CacheIndex::default();
        index.insert(
            "abc".into(),
            IndexEntry {
                entry_dir: "entries/abc".into(),
                last_access: 123,
                size: 10,
            },
        );
        index.save(&index_path)?;

        let loaded = CacheIndex::load(&index_path);
        assert_eq!(loaded, index);
        Ok(())
    }

    #[test]
    fn test_corrupt_index_reads_cold() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let index_path = root.join_component("index.json");
        index_path.create_with_contents("not json {")?;

        assert!(CacheIndex::load(&index_path).is_empty());
        Ok(())
    }

    #[test]
    fn test_lru_ordering() {
        let mut index = CacheIndex::default();
        for (key, last_access) in [("newer", 300), ("oldest", 100), ("middle", 200)] {
            index.insert(
                key.into(),
                IndexEntry {
                    entry_dir: format!("entries/{key}"),
                    last_access,
                    size: 1,
                },
            );
        }
        assert_eq!(index.lru_keys(), ["oldest", "middle", "newer"]);
    }
}
