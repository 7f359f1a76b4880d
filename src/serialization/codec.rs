//! Big-endian primitive encoding.
//!
//! The layout matches `java.io.DataOutput`: every integer is written most
//! significant byte first and booleans take one byte.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CoreError, Result};

/// Growable output buffer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    // Writes into a Vec<u8> cannot fail, so the io results are dropped.

    pub fn write_i8(&mut self, value: i8) {
        let _ = self.buf.write_i8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        let _ = self.buf.write_i16::<BigEndian>(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        let _ = self.buf.write_i32::<BigEndian>(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        let _ = self.buf.write_i64::<BigEndian>(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_i8(i8::from(value));
    }

    /// A length-prefixed count. Fails when it does not fit an `i32`.
    pub fn write_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| CoreError::invalid_argument(format!("Length too large: {len}")))?;
        self.write_i32(len);
        Ok(())
    }

    /// `i32` byte length followed by the UTF-8 bytes.
    pub fn write_utf8(&mut self, value: &str) -> Result<()> {
        self.write_len(value.len())?;
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }
}

/// Cursor over an input buffer. Reading past the end is a format error.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn is_at_end(&self) -> bool {
        self.cursor.position() as usize >= self.cursor.get_ref().len()
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.cursor.read_i8().map_err(eof)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.cursor.read_i16::<BigEndian>().map_err(eof)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.cursor.read_i32::<BigEndian>().map_err(eof)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.cursor.read_i64::<BigEndian>().map_err(eof)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_i8()? != 0)
    }

    /// A count written by [`Writer::write_len`]. Negative counts are rejected.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| CoreError::invalid_format(format!("negative length {len}")))
    }

    pub fn read_utf8(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let remaining = self.cursor.get_ref().len() - self.cursor.position() as usize;
        if len > remaining {
            return Err(CoreError::invalid_format(format!(
                "string of {len} bytes exceeds the {remaining} remaining"
            )));
        }
        let mut bytes = vec![0; len];
        self.cursor.read_exact(&mut bytes).map_err(eof)?;
        String::from_utf8(bytes).map_err(|e| CoreError::invalid_format(format!("invalid UTF-8: {e}")))
    }
}

fn eof(err: std::io::Error) -> CoreError {
    CoreError::invalid_format(format!("unexpected end of input ({err})"))
}
