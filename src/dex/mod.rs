#[macro_use]
pub mod error;

pub mod container;
pub mod decoder;
pub mod descriptors;
pub mod instructions;
pub(crate) mod leb;
pub mod opcodes;

use crate::dex::error::DexError;
use crate::dex::leb::{decode_sleb128, decode_uleb128, decode_uleb128p1};

/// Bounds-checked little-endian reader over a borrowed byte buffer.
///
/// Every failed read reports the offset it was attempted at.
#[derive(Debug, Clone)]
pub struct Cursor<'a>
{
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a>
{
    pub fn new(bytes: &'a [u8], pos: usize) -> Result<Self, DexError>
    {
        if pos > bytes.len()
        {
            fail!(at = pos, "Offset outside container of {} bytes", bytes.len());
        }
        Ok(Cursor { bytes, pos })
    }

    pub fn position(&self) -> usize
    {
        self.pos
    }

    pub fn remaining(&self) -> usize
    {
        self.bytes.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), DexError>
    {
        if pos > self.bytes.len()
        {
            fail!(at = pos, "Seek outside container of {} bytes", self.bytes.len());
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], DexError>
    {
        if self.remaining() < n
        {
            fail!(at = self.pos, "Unexpected end of stream reading {}", what);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    // Basic type reading
    pub fn read_u1(&mut self) -> Result<u8, DexError>
    {
        Ok(self.take(1, "u1")?[0])
    }

    pub fn read_u2(&mut self) -> Result<u16, DexError>
    {
        let b = self.take(2, "u2")?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u4(&mut self) -> Result<u32, DexError>
    {
        let b = self.take(4, "u4")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_uleb128(&mut self) -> Result<u32, DexError>
    {
        let start = self.pos;
        let (val, size) = decode_uleb128(&self.bytes[start..]).map_err(|e| relocate(e, start))?;
        self.pos += size;
        Ok(val)
    }

    pub fn read_uleb128p1(&mut self) -> Result<i32, DexError>
    {
        let start = self.pos;
        let (val, size) = decode_uleb128p1(&self.bytes[start..]).map_err(|e| relocate(e, start))?;
        self.pos += size;
        Ok(val)
    }

    pub fn read_sleb128(&mut self) -> Result<i32, DexError>
    {
        let start = self.pos;
        let (val, size) = decode_sleb128(&self.bytes[start..]).map_err(|e| relocate(e, start))?;
        self.pos += size;
        Ok(val)
    }

    pub fn read_x(&mut self, length: usize) -> Result<&'a [u8], DexError>
    {
        self.take(length, "byte array")
    }

    /// Reads up to (and consumes) a NUL terminator, returning the bytes before it.
    pub fn read_until_nul(&mut self) -> Result<&'a [u8], DexError>
    {
        let start = self.pos;
        match self.bytes[start..].iter().position(|&b| b == 0)
        {
            Some(len) => {
                self.pos += len + 1;
                Ok(&self.bytes[start..start + len])
            }
            None => fail!(at = start, "Unterminated string data"),
        }
    }
}

// leb128 decoders report offsets relative to the slice they were given
fn relocate(e: DexError, base: usize) -> DexError
{
    let relative = e.offset().unwrap_or(0);
    DexError::new(e.message()).at(base + relative)
}

#[cfg(test)]
pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    2
}

#[cfg(test)]
pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    4
}

#[cfg(test)]
pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize
{
    let encoded = crate::dex::leb::encode_uleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}

#[cfg(test)]
pub(crate) fn write_sleb128(buffer: &mut Vec<u8>, val: i32) -> usize
{
    let encoded = crate::dex::leb::encode_sleb128(val);
    let c = encoded.len();
    buffer.extend(encoded);
    c
}
