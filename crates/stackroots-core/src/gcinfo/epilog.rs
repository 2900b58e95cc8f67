//! Epilog table that follows the GC-info header.
//!
//! A method whose single epilog ends the code body (`epilog_at_end`) has no
//! table. Otherwise each epilog is a var-int start delta from the previous
//! epilog start, followed by a var-int size when the header says epilog sizes
//! vary.

use smallvec::SmallVec;

use super::GcInfoHeader;
use crate::error::{Result, WalkError};
use crate::varint::{encode_unsigned, VarIntReader};

/// Location of one epilog within its method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpilogInfo
{
    /// Code offset of the first epilog instruction
    pub start: u32,
    pub size: u32,
}

impl EpilogInfo
{
    /// Offset of `code_offset` from the epilog start, when strictly inside it
    ///
    /// Offset zero is the first epilog instruction, which has not run yet; the
    /// frame is still in its body state there.
    pub fn offset_of(&self, code_offset: u32) -> Option<u32>
    {
        let end = self.start.saturating_add(self.size);
        (self.start < code_offset && code_offset < end).then(|| code_offset - self.start)
    }
}

/// Every epilog of one method
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpilogTable
{
    epilogs: SmallVec<[EpilogInfo; 4]>,
}

impl EpilogTable
{
    /// Read the table for `header`, leaving `reader` at the callsite map.
    ///
    /// `code_size` is needed to place an epilog-at-end.
    pub fn decode(header: &GcInfoHeader, code_size: u32, reader: &mut VarIntReader<'_>) -> Result<Self>
    {
        let mut epilogs = SmallVec::new();

        if header.epilog_at_end {
            if header.epilog_count != 1 {
                return Err(WalkError::MalformedGcInfo(format!(
                    "epilog at end with {} epilogs",
                    header.epilog_count
                )));
            }
            let size = header.fixed_epilog_size;
            let start = code_size
                .checked_sub(size)
                .ok_or_else(|| WalkError::MalformedGcInfo(format!("epilog size {size} exceeds code size {code_size}")))?;
            epilogs.push(EpilogInfo { start, size });
            return Ok(Self { epilogs });
        }

        if header.epilog_count as usize > reader.remaining().len() {
            return Err(WalkError::DecodeTruncated { offset: reader.position() });
        }

        let mut start = 0u32;
        for _ in 0..header.epilog_count {
            start = start.wrapping_add(reader.read_unsigned()?);
            let size = if header.has_varying_epilog_sizes() {
                reader.read_unsigned()?
            } else {
                header.fixed_epilog_size
            };
            epilogs.push(EpilogInfo { start, size });
        }
        Ok(Self { epilogs })
    }

    /// Append the encoding of `epilogs` for `header`; nothing for an epilog-at-end.
    pub fn encode(header: &GcInfoHeader, epilogs: &[EpilogInfo], out: &mut Vec<u8>)
    {
        if header.epilog_at_end {
            return;
        }
        let mut previous = 0u32;
        for epilog in epilogs {
            encode_unsigned(epilog.start.wrapping_sub(previous), out);
            if header.has_varying_epilog_sizes() {
                encode_unsigned(epilog.size, out);
            }
            previous = epilog.start;
        }
    }

    pub fn len(&self) -> usize
    {
        self.epilogs.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.epilogs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EpilogInfo>
    {
        self.epilogs.iter()
    }

    /// The epilog `code_offset` lies in, with the offset inside it
    pub fn find_epilog(&self, code_offset: u32) -> Option<(EpilogInfo, u32)>
    {
        self.epilogs
            .iter()
            .find_map(|epilog| epilog.offset_of(code_offset).map(|offset| (*epilog, offset)))
    }

    /// First epilog starting after `start_offset`; pass `-1` to get the first one.
    pub fn find_next_epilog(&self, start_offset: i64) -> Option<EpilogInfo>
    {
        self.epilogs
            .iter()
            .find(|epilog| i64::from(epilog.start) > start_offset)
            .copied()
    }
}
