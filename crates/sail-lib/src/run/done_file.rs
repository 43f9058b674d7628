//! Per-task done-files: the local incremental-build record.
//!
//! A done-file holds content hashes of a leaf task's declared inputs and
//! outputs (plus the dependency fingerprint and command line when relevant).
//! If the recomputed record equals what's on disk, the task is up to date.
//! Content hashes only, never mtimes: restoring a dependency's outputs from
//! cache rewrites timestamps, and a timestamp-derived fingerprint would
//! cascade cache misses through every dependent.

use sail_hash::hash_bytes;
use sail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DONE_FILE_DIR: &str = ".sail";

#[derive(Debug, thiserror::Error)]
pub enum DoneFileError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("failed to serialize done-file")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashEntry {
    pub name: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneFile {
    /// Declared inputs, sorted by name. Missing files carry the
    /// `"<missing>"` sentinel hash.
    pub src_hashes: Vec<FileHashEntry>,
    /// Declared outputs, sorted by name, same sentinel rule.
    pub dst_hashes: Vec<FileHashEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dep_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
}

impl DoneFile {
    pub fn new(
        mut src_hashes: Vec<FileHashEntry>,
        mut dst_hashes: Vec<FileHashEntry>,
    ) -> Self {
        src_hashes.sort_by(|a, b| a.name.cmp(&b.name));
        dst_hashes.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            src_hashes,
            dst_hashes,
            dep_hash: None,
            tool_version: None,
            command_line: None,
        }
    }

    /// Reads the done-file if present. Unparseable content reads as absent:
    /// the task just runs again.
    pub fn read(path: &AbsoluteSystemPath) -> Result<Option<Self>, DoneFileError> {
        let Some(raw) = path.read_existing_to_string()? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(done_file) => Ok(Some(done_file)),
            Err(e) => {
                debug!("ignoring unreadable done-file at {path}: {e}");
                Ok(None)
            }
        }
    }

    /// Atomically writes the done-file (sibling temp path, then rename).
    pub fn write(&self, path: &AbsoluteSystemPath) -> Result<(), DoneFileError> {
        let json = serde_json::to_string_pretty(self).map_err(DoneFileError::Serialize)?;
        path.ensure_dir()?;
        let temp = path
            .parent()
            .expect("done-file path has a parent directory")
            .join_component(&format!(".done.{}.tmp", std::process::id()));
        temp.create_with_contents(&json)?;
        temp.rename(path)?;
        Ok(())
    }

    /// The fingerprint dependents fold into their own `dep_hash`.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).expect("done-file always serializes");
        hash_bytes(&canonical)
    }
}

/// Where a leaf task's done-file lives. `:` is not directory-safe in task
/// names like `build:esm`, so it is escaped the same way in both directions.
pub fn done_file_path(package_dir: &AbsoluteSystemPath, task: &str) -> AbsoluteSystemPathBuf {
    let escaped = task.replace(':', "$colon$");
    package_dir.join_components(&[DONE_FILE_DIR, &format!("{escaped}.done.json")])
}

#[cfg(test)]
mod test {
    use sail_hash::MISSING_FILE_HASH;

    use super::*;

    fn entry(name: &str, hash: &str) -> FileHashEntry {
        FileHashEntry {
            name: name.to_string(),
            hash: hash.to_string(),
        }
    }

    #[test]
    fn test_entries_sorted_on_construction() {
        let done = DoneFile::new(
            vec![entry("z.ts", "1"), entry("a.ts", "2")],
            vec![entry("out.txt", MISSING_FILE_HASH)],
        );
        assert_eq!(done.src_hashes[0].name, "a.ts");
        assert_eq!(done.src_hashes[1].name, "z.ts");
    }

    #[test]
    fn test_fingerprint_ignores_input_order() {
        let forward = DoneFile::new(
            vec![entry("a.ts", "1"), entry("b.ts", "2")],
            vec![],
        );
        let reversed = DoneFile::new(
            vec![entry("b.ts", "2"), entry("a.ts", "1")],
            vec![],
        );
        assert_eq!(forward.fingerprint(), reversed.fingerprint());
    }

    #[test]
    fn test_write_read_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let package_dir = AbsoluteSystemPath::from_std_path(dir.path())?;
        let path = done_file_path(package_dir, "build:esm");
        assert!(path.as_str().contains("build$colon$esm.done.json"));

        let mut done = DoneFile::new(
            vec![entry("src/index.ts", "aa")],
            vec![entry("dist/index.js", "bb")],
        );
        done.dep_hash = Some("cc".into());
        done.command_line = Some("tsc -p .".into());
        done.write(&path)?;

        assert_eq!(DoneFile::read(&path)?, Some(done));
        Ok(())
    }

    #[test]
    fn test_unreadable_done_file_is_absent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let package_dir = AbsoluteSystemPath::from_std_path(dir.path())?;
        let path = done_file_path(package_dir, "build");
        path.ensure_dir()?;
        path.create_with_contents("{ nope")?;

        assert_eq!(DoneFile::read(&path)?, None);
        Ok(())
    }
}
