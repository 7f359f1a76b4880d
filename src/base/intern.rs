//! String interning for serialized string tables.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use std::fmt;

/// Handle of an interned string. Its index is the position at which the
/// string was first interned, which is also its slot in a string table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Name(u32);

impl Name {
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self.0)
    }
}

/// Deduplicates strings, assigning dense indices in first-seen order.
#[derive(Default)]
pub struct Interner {
    inner: RwLock<InternerInner>,
}

#[derive(Default)]
struct InternerInner {
    map: FxHashMap<SmolStr, u32>,
    strings: Vec<SmolStr>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, s: &str) -> Name {
        if let Some(name) = self.find(s) {
            return name;
        }
        let mut inner = self.inner.write();
        if let Some(&index) = inner.map.get(s) {
            return Name(index);
        }
        let smol = SmolStr::new(s);
        let index = inner.strings.len() as u32;
        inner.strings.push(smol.clone());
        inner.map.insert(smol, index);
        Name(index)
    }

    /// The `Name` of an already interned string.
    pub fn find(&self, s: &str) -> Option<Name> {
        self.inner.read().map.get(s).copied().map(Name)
    }

    /// All interned strings in index order.
    pub fn strings(&self) -> Vec<SmolStr> {
        self.inner.read().strings.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Interner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interner").field("count", &self.len()).finish()
    }
}
