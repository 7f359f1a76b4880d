//! Source identifiers.

use smol_str::SmolStr;
use std::fmt;

/// Identifier of a compilation unit, e.g. `/platform/pure/corefunctions.pure`.
///
/// The first path segment names the repository the source belongs to.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceId(SmolStr);

impl SourceId {
    /// Create a source id from a string.
    #[inline]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id))
    }

    /// The raw id.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The repository this source belongs to, if any.
    ///
    /// `/platform/a.pure` belongs to `platform`; `/a.pure` and `a.pure`
    /// belong to no repository.
    pub fn repository(&self) -> Option<&str> {
        let rest = self.0.strip_prefix('/')?;
        let end = rest.find('/')?;
        let repo = &rest[..end];
        (!repo.is_empty()).then_some(repo)
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(SmolStr::from(id))
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
