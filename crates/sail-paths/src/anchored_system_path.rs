use std::fmt;

use camino::{Utf8Component, Utf8Path};

use crate::{AnchoredSystemPathBuf, PathError};

#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AnchoredSystemPath(pub(crate) Utf8Path);

impl ToOwned for AnchoredSystemPath {
    type Owned = AnchoredSystemPathBuf;

    fn to_owned(&self) -> Self::Owned {
        AnchoredSystemPathBuf(self.0.to_owned())
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPath {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AnchoredSystemPath {
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(unsafe { Self::new_unchecked(path) })
    }

    pub(crate) unsafe fn new_unchecked(path: &Utf8Path) -> &Self {
        &*(path as *const Utf8Path as *const Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn components(&self) -> impl Iterator<Item = Utf8Component> {
        self.0.components()
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0
            .parent()
            .map(|parent| unsafe { Self::new_unchecked(parent) })
    }
}
