//! # Var-int Decoder
//!
//! Byte-stream cursor over AOT-produced GC info, EH tables and method-info
//! blobs.
//!
//! Unsigned values are little-endian base-128: seven payload bits per byte,
//! high bit set on every byte except the last. A 32-bit value takes 1 to 5
//! bytes. Fixed-width fields are little-endian.

use crate::error::{Result, WalkError};

/// Longest encoding of a 32-bit value
pub const MAX_VARINT_LEN: usize = 5;

/// Forward-only cursor over an encoded byte stream
///
/// The cursor never reads past the end of its slice: a short buffer yields
/// `WalkError::DecodeTruncated` carrying the position the read started at.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::varint::VarIntReader;
///
/// let mut reader = VarIntReader::new(&[0x40, 0xe5, 0x8e, 0x26, 0xff]);
/// assert_eq!(reader.read_unsigned()?, 64);
/// assert_eq!(reader.read_unsigned()?, 624_485);
/// assert_eq!(reader.read_u8()?, 0xff);
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct VarIntReader<'a>
{
    data: &'a [u8],
    pos: usize,
}

impl<'a> VarIntReader<'a>
{
    pub const fn new(data: &'a [u8]) -> Self
    {
        Self { data, pos: 0 }
    }

    /// Start reading at `pos` within `data`.
    pub const fn at(data: &'a [u8], pos: usize) -> Self
    {
        Self { data, pos }
    }

    /// Current offset from the start of the underlying slice
    pub const fn position(&self) -> usize
    {
        self.pos
    }

    /// Move the cursor to an absolute position.
    pub fn seek(&mut self, pos: usize)
    {
        self.pos = pos;
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8]
    {
        self.data.get(self.pos..).unwrap_or(&[])
    }

    pub const fn data(&self) -> &'a [u8]
    {
        self.data
    }

    /// Decode one unsigned var-int and advance past it.
    ///
    /// ## Errors
    ///
    /// `DecodeTruncated` if the buffer ends before the final byte, or if more
    /// than five bytes carry the continuation bit.
    pub fn read_unsigned(&mut self) -> Result<u32>
    {
        let start = self.pos;
        let mut value: u32 = 0;
        for index in 0..MAX_VARINT_LEN {
            let byte = *self.data.get(self.pos).ok_or(WalkError::DecodeTruncated { offset: start })?;
            self.pos += 1;
            value |= u32::from(byte & 0x7f) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WalkError::DecodeTruncated { offset: start })
    }

    /// Advance past one unsigned var-int without materialising it.
    pub fn skip_unsigned(&mut self) -> Result<()>
    {
        let start = self.pos;
        for _ in 0..MAX_VARINT_LEN {
            let byte = *self.data.get(self.pos).ok_or(WalkError::DecodeTruncated { offset: start })?;
            self.pos += 1;
            if byte & 0x80 == 0 {
                return Ok(());
            }
        }
        Err(WalkError::DecodeTruncated { offset: start })
    }

    pub fn peek_u8(&self) -> Result<u8>
    {
        self.data.get(self.pos).copied().ok_or(WalkError::DecodeTruncated { offset: self.pos })
    }

    pub fn read_u8(&mut self) -> Result<u8>
    {
        let byte = self.peek_u8()?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16>
    {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32>
    {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32>
    {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Advance `count` bytes.
    pub fn skip(&mut self, count: usize) -> Result<()>
    {
        let end = self.pos.checked_add(count).ok_or(WalkError::DecodeTruncated { offset: self.pos })?;
        if end > self.data.len() {
            return Err(WalkError::DecodeTruncated { offset: self.pos });
        }
        self.pos = end;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]>
    {
        let start = self.pos;
        let bytes = self
            .data
            .get(start..start + N)
            .ok_or(WalkError::DecodeTruncated { offset: start })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos += N;
        Ok(out)
    }
}

/// Append the var-int encoding of `value` to `out`.
///
/// Used by fixture builders and the CLI when re-encoding tables.
pub fn encode_unsigned(value: u32, out: &mut Vec<u8>)
{
    let mut rest = value;
    loop {
        let byte = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `encode_unsigned` produces for `value`
pub const fn encoded_len(value: u32) -> usize
{
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_single_byte_values()
    {
        let mut reader = VarIntReader::new(&[0x00, 0x7f]);
        assert_eq!(reader.read_unsigned().unwrap(), 0);
        assert_eq!(reader.read_unsigned().unwrap(), 0x7f);
        assert_eq!(reader.position(), 2);
    }

    #[test]
    fn test_max_value_uses_five_bytes()
    {
        let mut out = Vec::new();
        encode_unsigned(u32::MAX, &mut out);
        assert_eq!(out, vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(encoded_len(u32::MAX), 5);
        assert_eq!(VarIntReader::new(&out).read_unsigned().unwrap(), u32::MAX);
    }

    #[test]
    fn test_truncated_reports_start()
    {
        let mut reader = VarIntReader::at(&[0x01, 0x80, 0x80], 1);
        let err = reader.read_unsigned().unwrap_err();
        assert!(matches!(err, WalkError::DecodeTruncated { offset: 1 }));
    }

    #[test]
    fn test_skip_matches_read()
    {
        let bytes = [0xe5, 0x8e, 0x26, 0x05];
        let mut reader = VarIntReader::new(&bytes);
        reader.skip_unsigned().unwrap();
        assert_eq!(reader.position(), 3);
        assert_eq!(reader.read_unsigned().unwrap(), 5);
    }

    #[test]
    fn test_fixed_width_little_endian()
    {
        let mut reader = VarIntReader::new(&[0x45, 0x23, 0x01, 0x00, 0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(reader.read_u32().unwrap(), 0x12345);
        assert_eq!(reader.read_i32().unwrap(), -2);
        assert!(reader.read_u8().is_err());
    }
}
