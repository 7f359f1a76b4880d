//! String interning tables.
//!
//! Every artifact carries its distinct strings once, up front, as
//! `i32 count` followed by `count` UTF-8 strings in first-seen order.
//! Payload strings are then written as `i32` indices into that table.

use std::ops::{Deref, DerefMut};

use smol_str::SmolStr;

use super::{Reader, Writer};
use crate::base::Interner;
use crate::error::{CoreError, Result};

/// Writer that encodes strings as indices into a table written up front.
#[derive(Debug)]
pub struct IndexedWriter {
    out: Writer,
    strings: Interner,
}

impl IndexedWriter {
    /// Write the table of `strings` to `out` and return the indexed writer.
    pub fn new<S: AsRef<str>>(mut out: Writer, strings: impl IntoIterator<Item = S>) -> Result<Self> {
        let table = Interner::new();
        for s in strings {
            table.intern(s.as_ref());
        }
        let strings = table.strings();
        out.write_len(strings.len())?;
        for s in &strings {
            out.write_utf8(s)?;
        }
        Ok(Self { out, strings: table })
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let name = self
            .strings
            .find(value)
            .ok_or_else(|| CoreError::invalid_argument(format!("String not in table: '{value}'")))?;
        self.out.write_len(name.index() as usize)
    }

    /// An optional string; `None` is written as index -1.
    pub fn write_optional_string(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.write_string(value),
            None => {
                self.out.write_i32(-1);
                Ok(())
            }
        }
    }

    pub fn into_inner(self) -> Writer {
        self.out
    }
}

impl Deref for IndexedWriter {
    type Target = Writer;

    fn deref(&self) -> &Writer {
        &self.out
    }
}

impl DerefMut for IndexedWriter {
    fn deref_mut(&mut self) -> &mut Writer {
        &mut self.out
    }
}

/// Reader counterpart of [`IndexedWriter`].
#[derive(Debug)]
pub struct IndexedReader<'a> {
    input: Reader<'a>,
    strings: Vec<SmolStr>,
}

impl<'a> IndexedReader<'a> {
    /// Read the string table from `input`.
    pub fn new(mut input: Reader<'a>) -> Result<Self> {
        let count = input.read_len()?;
        let mut strings = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            strings.push(SmolStr::from(input.read_utf8()?));
        }
        Ok(Self { input, strings })
    }

    pub fn read_string(&mut self) -> Result<SmolStr> {
        let index = self.input.read_i32()?;
        self.lookup(index)
    }

    pub fn read_optional_string(&mut self) -> Result<Option<SmolStr>> {
        match self.input.read_i32()? {
            -1 => Ok(None),
            index => self.lookup(index).map(Some),
        }
    }

    fn lookup(&self, index: i32) -> Result<SmolStr> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.strings.get(i))
            .cloned()
            .ok_or_else(|| {
                CoreError::invalid_format(format!(
                    "string index {index} out of range (table size {})",
                    self.strings.len()
                ))
            })
    }

    pub fn into_inner(self) -> Reader<'a> {
        self.input
    }
}

impl<'a> Deref for IndexedReader<'a> {
    type Target = Reader<'a>;

    fn deref(&self) -> &Reader<'a> {
        &self.input
    }
}

impl DerefMut for IndexedReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.input
    }
}
