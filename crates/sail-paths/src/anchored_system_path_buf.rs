use std::{borrow::Borrow, fmt, ops::Deref};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::{AbsoluteSystemPath, AnchoredSystemPath, PathError};

/// A path relative to some anchor directory. Serializes as its raw string,
/// which is how anchored paths appear in manifests and done-files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AnchoredSystemPathBuf(pub(crate) Utf8PathBuf);

impl AnchoredSystemPathBuf {
    pub fn new(
        root: &AbsoluteSystemPath,
        path: &AbsoluteSystemPath,
    ) -> Result<Self, PathError> {
        let stripped = path
            .as_std_path()
            .strip_prefix(root.as_std_path())
            .map_err(|_| PathError::NotParent(root.to_string(), path.to_string()))?;
        let stripped = stripped
            .to_str()
            .ok_or_else(|| PathError::InvalidUnicode(stripped.to_string_lossy().into_owned()))?;
        Ok(Self(Utf8PathBuf::from(stripped)))
    }

    /// Constructs directly from a known-relative string.
    pub fn from_raw(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from(raw.as_ref());
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        Ok(Self(path))
    }

    pub fn as_path(&self) -> &AnchoredSystemPath {
        self
    }
}

impl TryFrom<String> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_raw(value)
    }
}

impl From<AnchoredSystemPathBuf> for String {
    fn from(value: AnchoredSystemPathBuf) -> Self {
        value.0.into_string()
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        unsafe { AnchoredSystemPath::new_unchecked(self.0.as_path()) }
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self.deref()
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self.deref()
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_raw_rejects_absolute() {
        #[cfg(unix)]
        assert!(AnchoredSystemPathBuf::from_raw("/abs/path").is_err());
        assert!(AnchoredSystemPathBuf::from_raw("rel/path").is_ok());
    }

    #[test]
    fn test_serde_roundtrip() -> anyhow::Result<()> {
        let path = AnchoredSystemPathBuf::from_raw("dist/main.js")?;
        let json = serde_json::to_string(&path)?;
        assert_eq!(json, "\"dist/main.js\"");
        let back: AnchoredSystemPathBuf = serde_json::from_str(&json)?;
        assert_eq!(back, path);
        Ok(())
    }
}
