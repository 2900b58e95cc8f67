//! Callsite strings: the roots live at one safe point.
//!
//! A string is a run of descriptors; the one with the `L` bit (0x20) is last.
//!
//! ```text
//! 00LRRRRR                          register set, five preferred callee-saved registers
//! 01LIPrrr                          one callee-saved register
//! 10L1SSSS                          local slots 0..3
//! 10L0ssss                          local slot 4..19
//! 11LIPFSM {offset} [mask]          stack slot(s), FP or SP relative
//! 11LIP010 0RRRRRRR [0III] [0PPP]   live scratch registers
//! ```

use crate::error::{Result, WalkError};
use crate::varint::{encode_unsigned, VarIntReader};

use super::GcSlotFlags;

const LAST: u8 = 0x20;
const INTERIOR: u8 = 0x10;
const PINNED: u8 = 0x08;
const FRAME_RELATIVE: u8 = 0x04;
const NEGATIVE: u8 = 0x02;
const HAS_MASK: u8 = 0x01;

/// One decoded root descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootDescriptor
{
    /// Bit N selects the Nth preferred callee-saved register
    RegisterSet(u8),
    /// Callee-saved register index 0..7
    Register
    {
        index: u8,
        flags: GcSlotFlags,
    },
    /// Bit N selects local slot N (0..3)
    LocalSlotSet(u8),
    /// Local slot 4..19
    LocalSlot(u8),
    /// First slot at `offset` from FP or SP; mask bit N adds the slot N+1 pointers further
    StackSlots
    {
        frame_relative: bool,
        offset: i32,
        mask: u32,
        flags: GcSlotFlags,
    },
    /// Scratch register masks in scratch-register order
    ScratchRegisters
    {
        regs: u8,
        interior: u8,
        pinned: u8,
    },
}

impl RootDescriptor
{
    /// Descriptors that address the frame's locals rather than registers
    pub fn is_frame_relative(&self) -> bool
    {
        matches!(
            self,
            RootDescriptor::LocalSlotSet(_)
                | RootDescriptor::LocalSlot(_)
                | RootDescriptor::StackSlots { frame_relative: true, .. }
        )
    }

    /// Append the encoding of this descriptor; `last` sets the terminator bit.
    pub fn encode(&self, last: bool, out: &mut Vec<u8>)
    {
        let last_bit = if last { LAST } else { 0 };
        match *self {
            RootDescriptor::RegisterSet(mask) => out.push(last_bit | (mask & 0x1f)),
            RootDescriptor::Register { index, flags } => {
                out.push(0x40 | last_bit | attribute_bits(flags) | (index & 0x07));
            }
            RootDescriptor::LocalSlotSet(mask) => out.push(0x90 | last_bit | (mask & 0x0f)),
            RootDescriptor::LocalSlot(slot) => out.push(0x80 | last_bit | (slot.saturating_sub(4) & 0x0f)),
            RootDescriptor::StackSlots {
                frame_relative,
                offset,
                mask,
                flags,
            } => {
                let mut byte = 0xc0 | last_bit | attribute_bits(flags);
                if frame_relative {
                    byte |= FRAME_RELATIVE;
                }
                if offset < 0 {
                    byte |= NEGATIVE;
                }
                if mask != 0 {
                    byte |= HAS_MASK;
                }
                out.push(byte);
                encode_unsigned(offset.unsigned_abs(), out);
                if mask != 0 {
                    encode_unsigned(mask, out);
                }
            }
            RootDescriptor::ScratchRegisters { regs, interior, pinned } => {
                let mut byte = 0xc2 | last_bit;
                if interior != 0 {
                    byte |= INTERIOR;
                }
                if pinned != 0 {
                    byte |= PINNED;
                }
                out.push(byte);
                out.push(regs & 0x7f);
                if interior != 0 {
                    out.push(interior & 0x7f);
                }
                if pinned != 0 {
                    out.push(pinned & 0x7f);
                }
            }
        }
    }
}

fn attribute_bits(flags: GcSlotFlags) -> u8
{
    let mut bits = 0;
    if flags.contains(GcSlotFlags::INTERIOR) {
        bits |= INTERIOR;
    }
    if flags.contains(GcSlotFlags::PINNED) {
        bits |= PINNED;
    }
    bits
}

fn attribute_flags(byte: u8) -> GcSlotFlags
{
    let mut flags = GcSlotFlags::empty();
    if byte & INTERIOR != 0 {
        flags |= GcSlotFlags::INTERIOR;
    }
    if byte & PINNED != 0 {
        flags |= GcSlotFlags::PINNED;
    }
    flags
}

/// Decode the callsite string starting at `offset` in the string blob.
///
/// ## Errors
///
/// `DecodeTruncated` if the blob ends before a descriptor with the last bit.
pub fn decode_string(strings: &[u8], offset: u32) -> Result<Vec<RootDescriptor>>
{
    let mut reader = VarIntReader::at(strings, offset as usize);
    let mut descriptors = Vec::new();
    loop {
        let byte = reader.read_u8()?;
        let descriptor = match byte & 0xc0 {
            0x00 => RootDescriptor::RegisterSet(byte & 0x1f),
            0x40 => RootDescriptor::Register {
                index: byte & 0x07,
                flags: attribute_flags(byte),
            },
            0x80 => {
                if byte & 0x10 != 0 {
                    RootDescriptor::LocalSlotSet(byte & 0x0f)
                } else {
                    RootDescriptor::LocalSlot((byte & 0x0f) + 4)
                }
            }
            _ if byte & 0xc7 == 0xc2 => {
                let regs = reader.read_u8()?;
                let interior = if byte & INTERIOR != 0 { reader.read_u8()? } else { 0 };
                let pinned = if byte & PINNED != 0 { reader.read_u8()? } else { 0 };
                RootDescriptor::ScratchRegisters { regs, interior, pinned }
            }
            _ => {
                let magnitude = reader.read_unsigned()?;
                let magnitude = i32::try_from(magnitude)
                    .map_err(|_| WalkError::MalformedGcInfo(format!("stack slot offset 0x{magnitude:x} out of range")))?;
                let mask = if byte & HAS_MASK != 0 { reader.read_unsigned()? } else { 0 };
                RootDescriptor::StackSlots {
                    frame_relative: byte & FRAME_RELATIVE != 0,
                    offset: if byte & NEGATIVE != 0 { -magnitude } else { magnitude },
                    mask,
                    flags: attribute_flags(byte),
                }
            }
        };
        descriptors.push(descriptor);
        if byte & LAST != 0 {
            return Ok(descriptors);
        }
    }
}

/// Encode `descriptors` as one callsite string.
pub fn encode_string(descriptors: &[RootDescriptor], out: &mut Vec<u8>)
{
    let count = descriptors.len();
    for (index, descriptor) in descriptors.iter().enumerate() {
        descriptor.encode(index + 1 == count, out);
    }
}
