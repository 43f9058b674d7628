use sail_paths::AbsoluteSystemPath;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CacheError;

/// Running counters persisted next to the index. Purely informational; a
/// lost or corrupt statistics file never affects correctness.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheStatistics {
    pub total_entries: u64,
    pub total_size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Mean restore wall time across all hits, in milliseconds.
    pub avg_restore_time: u64,
    /// Sum of the original execution times of every restored entry.
    pub time_saved_ms: u64,
}

impl CacheStatistics {
    pub fn load(path: &AbsoluteSystemPath) -> Self {
        match path.read_existing_to_string() {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                debug!("cache statistics at {path} are unreadable, resetting: {e}");
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                debug!("failed to read cache statistics at {path}: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &AbsoluteSystemPath) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(self).map_err(CacheError::MetadataWriteFailure)?;
        let temp = path
            .parent()
            .expect("statistics file has a parent directory")
            .join_component(&format!(".statistics.json.{}.tmp", std::process::id()));
        temp.create_with_contents(&json)?;
        temp.rename(path)?;
        Ok(())
    }

    pub fn record_miss(&mut self) {
        self.miss_count += 1;
    }

    /// Folds one successful restore into the counters.
    pub fn record_hit(&mut self, restore_time_ms: u64, time_saved_ms: u64) {
        let prior_hits = self.hit_count;
        self.hit_count += 1;
        self.avg_restore_time =
            (self.avg_restore_time * prior_hits + restore_time_ms) / self.hit_count;
        self.time_saved_ms += time_saved_ms;
    }

    pub fn record_store(&mut self, entry_size: u64) {
        self.total_entries += 1;
        self.total_size += entry_size;
    }

    pub fn record_eviction(&mut self, entry_size: u64) {
        self.total_entries = self.total_entries.saturating_sub(1);
        self.total_size = self.total_size.saturating_sub(entry_size);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hit_average() {
        let mut stats = CacheStatistics::default();
        stats.record_hit(100, 1000);
        stats.record_hit(300, 2000);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.avg_restore_time, 200);
        assert_eq!(stats.time_saved_ms, 3000);
    }

    #[test]
    fn test_save_load_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let path = root.join_component("statistics.json");

        let mut stats = CacheStatistics::default();
        stats.record_store(64);
        stats.record_miss();
        stats.save(&path)?;

        assert_eq!(CacheStatistics::load(&path), stats);
        Ok(())
    }
}
