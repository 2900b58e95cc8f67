//! Callsite map: code offset to callsite-string offset.
//!
//! ```text
//! 0ddddccc             small entry: offset += shortcuts[dddd], string = ccc
//! 1ddddddd {string}    big entry: offset += ddddddd, string offset var-int follows
//! 10000000 {delta}     forwarder: offset += delta, no callsite here
//! 11111111             end of map
//! ```
//!
//! A forwarder only spans a long gap. The offset it produces is an
//! intermediate value and must never be compared against the target, so the
//! scan reads the following entry before testing again.

use tracing::trace;

use crate::error::{Result, WalkError};
use crate::varint::{encode_unsigned, VarIntReader};

const END_OF_MAP: u8 = 0xff;
const FORWARDER: u8 = 0x80;
const SHORTCUT_COUNT: usize = 16;

/// Module-global table of common code-offset deltas used by small entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaShortcuts(pub [u8; SHORTCUT_COUNT]);

impl DeltaShortcuts
{
    /// Read the 16-byte table from the start of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self>
    {
        let bytes = data
            .get(..SHORTCUT_COUNT)
            .ok_or(WalkError::DecodeTruncated { offset: data.len() })?;
        let mut table = [0u8; SHORTCUT_COUNT];
        table.copy_from_slice(bytes);
        Ok(Self(table))
    }

    pub fn get(&self, index: u8) -> u32
    {
        u32::from(self.0[usize::from(index) & (SHORTCUT_COUNT - 1)])
    }

    /// Index of `delta` in the table, if present
    pub fn index_of(&self, delta: u32) -> Option<u8>
    {
        self.0.iter().position(|entry| u32::from(*entry) == delta).map(|index| index as u8)
    }
}

/// One safe point of the map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallsiteEntry
{
    pub code_offset: u32,
    pub string_offset: u32,
}

/// Find the callsite string for `code_offset`.
///
/// Returns `None` when the map has no entry at exactly that offset. Offset
/// zero is never a callsite: a safe point is always the address after a call.
pub fn find_callsite(map: &[u8], shortcuts: &DeltaShortcuts, code_offset: u32) -> Result<Option<u32>>
{
    let mut reader = VarIntReader::new(map);
    if code_offset == 0 || reader.peek_u8()? == END_OF_MAP {
        return Ok(None);
    }

    let mut current = 0u32;
    let mut string_offset = 0u32;
    while current < code_offset {
        let mut byte = reader.read_u8()?;
        while byte == FORWARDER {
            current = current.wrapping_add(reader.read_unsigned()?);
            byte = reader.read_u8()?;
        }

        if byte & 0x80 == 0 {
            current = current.wrapping_add(shortcuts.get(byte >> 3));
            string_offset = u32::from(byte & 0x07);
        } else if byte == END_OF_MAP {
            break;
        } else {
            current = current.wrapping_add(u32::from(byte & 0x7f));
            string_offset = reader.read_unsigned()?;
        }
    }

    if current != code_offset {
        trace!(code_offset, reached = current, "no callsite at offset");
        return Ok(None);
    }
    trace!(code_offset, string_offset, "callsite found");
    Ok(Some(string_offset))
}

/// Find the callsite string in effect at an interrupted instruction.
///
/// The instruction at `code_offset` has not retired, so the live set is the
/// one published by the last entry at or before it. Returns `None` when no
/// entry precedes the offset.
pub fn find_callsite_at_or_before(map: &[u8], shortcuts: &DeltaShortcuts, code_offset: u32) -> Result<Option<u32>>
{
    let found = entries(map, shortcuts)?
        .into_iter()
        .take_while(|entry| entry.code_offset <= code_offset)
        .last();
    trace!(code_offset, ?found, "callsite in effect at interrupted offset");
    Ok(found.map(|entry| entry.string_offset))
}

/// Decode every entry of the map, for dumping.
pub fn entries(map: &[u8], shortcuts: &DeltaShortcuts) -> Result<Vec<CallsiteEntry>>
{
    let mut reader = VarIntReader::new(map);
    let mut current = 0u32;
    let mut out = Vec::new();
    loop {
        let byte = reader.read_u8()?;
        if byte == END_OF_MAP {
            return Ok(out);
        }
        if byte == FORWARDER {
            current = current.wrapping_add(reader.read_unsigned()?);
            continue;
        }
        let string_offset = if byte & 0x80 == 0 {
            current = current.wrapping_add(shortcuts.get(byte >> 3));
            u32::from(byte & 0x07)
        } else {
            current = current.wrapping_add(u32::from(byte & 0x7f));
            reader.read_unsigned()?
        };
        out.push(CallsiteEntry {
            code_offset: current,
            string_offset,
        });
    }
}

/// Length in bytes of the map at the start of `map`, terminator included.
pub fn map_len(map: &[u8]) -> Result<usize>
{
    let mut reader = VarIntReader::new(map);
    loop {
        let byte = reader.read_u8()?;
        if byte == END_OF_MAP {
            return Ok(reader.position());
        }
        if byte & 0x80 != 0 {
            reader.skip_unsigned()?;
        }
    }
}

/// Encode `entries` (strictly ascending code offsets) using `shortcuts` where possible.
///
/// Used by fixture builders. Gaps too large for a big entry get a forwarder.
pub fn encode(entries: &[CallsiteEntry], shortcuts: &DeltaShortcuts, out: &mut Vec<u8>)
{
    let mut current = 0u32;
    for entry in entries {
        let mut delta = entry.code_offset.wrapping_sub(current);
        let small = shortcuts.index_of(delta).filter(|_| entry.string_offset < 8);
        if let Some(index) = small {
            out.push((index << 3) | entry.string_offset as u8);
        } else {
            if delta >= 0x7f {
                let forward = delta - 1;
                out.push(FORWARDER);
                encode_unsigned(forward, out);
                delta -= forward;
            }
            out.push(0x80 | delta as u8);
            encode_unsigned(entry.string_offset, out);
        }
        current = entry.code_offset;
    }
    out.push(END_OF_MAP);
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn shortcuts() -> DeltaShortcuts
    {
        DeltaShortcuts([0, 8, 5, 6, 7, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19])
    }

    #[test]
    fn test_forwarder_offset_is_not_a_match()
    {
        let map = [0x80, 0x40, 0x08, 0xff];
        assert_eq!(find_callsite(&map, &shortcuts(), 64).unwrap(), None);
        assert_eq!(find_callsite(&map, &shortcuts(), 72).unwrap(), Some(0));
    }

    #[test]
    fn test_big_entry_string_offset()
    {
        let map = [0x85, 0x92, 0x01, 0x09, 0xff];
        assert_eq!(find_callsite(&map, &shortcuts(), 5).unwrap(), Some(0x92));
        assert_eq!(find_callsite(&map, &shortcuts(), 13).unwrap(), Some(1));
        assert_eq!(find_callsite(&map, &shortcuts(), 6).unwrap(), None);
        assert_eq!(find_callsite(&map, &shortcuts(), 100).unwrap(), None);
        assert_eq!(map_len(&map).unwrap(), 5);
    }

    #[test]
    fn test_encode_matches_entries()
    {
        let wanted = vec![
            CallsiteEntry { code_offset: 8, string_offset: 3 },
            CallsiteEntry { code_offset: 0x30, string_offset: 0x40 },
            CallsiteEntry { code_offset: 0x300, string_offset: 2 },
        ];
        let mut map = Vec::new();
        encode(&wanted, &shortcuts(), &mut map);
        assert_eq!(entries(&map, &shortcuts()).unwrap(), wanted);
        for entry in &wanted {
            assert_eq!(find_callsite(&map, &shortcuts(), entry.code_offset).unwrap(), Some(entry.string_offset));
        }
    }
}
