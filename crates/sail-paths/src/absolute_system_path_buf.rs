use std::{
    borrow::Borrow,
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
};

use camino::{Utf8Path, Utf8PathBuf};
use path_clean::PathClean;

use crate::{AbsoluteSystemPath, PathError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsoluteSystemPathBuf(pub(crate) Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    /// Creates a new `AbsoluteSystemPathBuf` from a UTF-8 string, erroring if
    /// the path is relative. The path is cleaned (`.` and `..` segments
    /// resolved lexically) so two spellings of the same location compare
    /// equal.
    pub fn new(raw: impl Into<String>) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from(raw.into());
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.as_std_path().to_owned()));
        }
        let cleaned = path.as_std_path().clean();
        let cleaned = Utf8PathBuf::from_path_buf(cleaned)
            .map_err(|bad: PathBuf| PathError::InvalidUnicode(bad.to_string_lossy().into_owned()))?;
        Ok(Self(cleaned))
    }

    pub fn from_std_path(path: &Path) -> Result<Self, PathError> {
        let path = path
            .to_str()
            .ok_or_else(|| PathError::InvalidUnicode(path.to_string_lossy().into_owned()))?;
        Self::new(path)
    }

    pub fn as_path(&self) -> &AbsoluteSystemPath {
        self
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        unsafe { AbsoluteSystemPath::new_unchecked(self.0.as_path()) }
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self.deref()
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self.deref()
    }
}

impl AsRef<Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<AbsoluteSystemPathBuf> for Utf8PathBuf {
    fn from(value: AbsoluteSystemPathBuf) -> Self {
        value.0
    }
}

impl AsRef<Utf8Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Utf8Path {
        self.0.as_path()
    }
}
