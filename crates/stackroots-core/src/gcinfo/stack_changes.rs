//! x86 stack-change string.
//!
//! Frameless x86 methods that push outgoing arguments record every push and
//! pop so the stack depth at any code offset can be reconstructed. Each byte
//! is one of:
//!
//! ```text
//! 00111111 {var-int}   forwarder, advances the code offset
//! 00dddddd             push one slot, dddddd = code offset delta
//! nnnldddd             pop nnn-1 slots, l = last entry, dddd = delta
//! ```
//!
//! `nnn` values 0 and 1 are reserved so the pop form never collides with the
//! push form.

use smallvec::SmallVec;

use crate::error::{Result, WalkError};
use crate::varint::{encode_unsigned, VarIntReader};

const FORWARDER: u8 = 0x3f;
const POP_LAST: u8 = 0x10;

/// One entry of the stack-change string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackChange
{
    /// Advance the code offset without changing the stack
    Forward
    {
        delta: u32
    },
    /// One slot pushed at `delta` bytes past the previous change
    Push
    {
        delta: u8
    },
    /// `count` slots popped; `last` terminates the string
    Pop
    {
        count: u8,
        delta: u8,
        last: bool,
    },
}

impl StackChange
{
    /// Code-offset advance contributed by this entry
    pub fn delta(&self) -> u32
    {
        match *self {
            StackChange::Forward { delta } => delta,
            StackChange::Push { delta } | StackChange::Pop { delta, .. } => u32::from(delta),
        }
    }

    /// Net change in pushed slots
    pub fn depth_change(&self) -> i32
    {
        match *self {
            StackChange::Forward { .. } => 0,
            StackChange::Push { .. } => 1,
            StackChange::Pop { count, .. } => -i32::from(count),
        }
    }
}

/// Read entries until one with the `last` bit.
pub fn decode(reader: &mut VarIntReader<'_>) -> Result<SmallVec<[StackChange; 4]>>
{
    let mut changes = SmallVec::new();
    loop {
        let byte = reader.read_u8()?;
        if byte == FORWARDER {
            changes.push(StackChange::Forward { delta: reader.read_unsigned()? });
        } else if byte & 0xc0 == 0 {
            changes.push(StackChange::Push { delta: byte & 0x3f });
        } else {
            let last = byte & POP_LAST != 0;
            changes.push(StackChange::Pop { count: (byte >> 5) - 1, delta: byte & 0x0f, last });
            if last {
                return Ok(changes);
            }
        }
    }
}

/// Append the string for `changes`; the final entry must be a `last` pop.
pub fn encode(changes: &[StackChange], out: &mut Vec<u8>)
{
    for change in changes {
        match *change {
            StackChange::Forward { delta } => {
                out.push(FORWARDER);
                encode_unsigned(delta, out);
            }
            StackChange::Push { delta } => out.push(delta & 0x3f),
            StackChange::Pop { count, delta, last } => {
                let mut byte = ((count + 1) << 5) | (delta & 0x0f);
                if last {
                    byte |= POP_LAST;
                }
                out.push(byte);
            }
        }
    }
}

/// Pushed slot count at `code_offset`, replaying `changes` from offset zero.
pub fn depth_at(changes: &[StackChange], code_offset: u32) -> Result<u32>
{
    let mut offset = 0u32;
    let mut depth = 0i32;
    for change in changes {
        offset = offset.saturating_add(change.delta());
        if offset > code_offset {
            break;
        }
        depth += change.depth_change();
        if depth < 0 {
            return Err(WalkError::MalformedGcInfo(format!("stack depth underflow at offset 0x{offset:x}")));
        }
    }
    Ok(depth as u32)
}
