//! ARM64 custom unwind blobs.
//!
//! Managed ARM64 methods in ELF and Mach-O modules may replace their CFI with
//! one of two smaller encodings referenced from the method-info blob.
//!
//! The compact form is one 16-bit word, `FSSR RRRO OOOO OOOO`:
//!
//! ```text
//! F      CFA base: 1 = FP, 0 = SP
//! SS     saved D-register pairs, starting at D8
//! RRRR   saved X19.. registers
//! O      CFA offset from the base in 16-byte units
//! ```
//!
//! The frame it describes keeps FP and LR at the top, the X registers below
//! them and the D registers below those:
//!
//! ```text
//! CFA - 8          LR
//! CFA - 16         FP
//! CFA - 16 - 8n    X19 .. X19+n-1 (area rounded up to 16)
//! below            D8 ..
//! ```
//!
//! The step form spells every save out: the CFA register (DWARF 29 or 31), a
//! var-int CFA offset, then `{register, var-int offset below the CFA}` pairs
//! ending with `0xFF`. Registers are DWARF numbers: 19..30 for X19..LR and
//! 72..79 for D8..D15.

use tracing::{debug, trace};

use crate::codeman::CustomUnwindMode;
use crate::error::{Result, WalkError};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::arm64;
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};
use crate::varint::{self, VarIntReader};

const STEP_END: u8 = 0xff;
const DWARF_D8: u8 = 72;
const DWARF_SP: u8 = 31;

/// Decoded compact unwind word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactUnwind
{
    pub fp_based: bool,
    /// Saved D-register pairs, 0..=3
    pub d_pairs: u8,
    /// Saved registers from X19, 0..=10
    pub gpr_count: u8,
    /// CFA offset from the base register in bytes
    pub cfa_offset: u32,
}

impl CompactUnwind
{
    pub const fn from_bits(bits: u16) -> Self
    {
        Self {
            fp_based: bits & 0x8000 != 0,
            d_pairs: ((bits >> 13) & 0x3) as u8,
            gpr_count: ((bits >> 9) & 0xf) as u8,
            cfa_offset: (bits & 0x1ff) as u32 * 16,
        }
    }

    pub const fn bits(&self) -> u16
    {
        ((self.fp_based as u16) << 15)
            | ((self.d_pairs as u16 & 0x3) << 13)
            | ((self.gpr_count as u16 & 0xf) << 9)
            | ((self.cfa_offset / 16) as u16 & 0x1ff)
    }

    fn restore(&self, display: &mut RegDisplay, memory: &dyn MemoryAccess) -> Result<Address>
    {
        let base = if self.fp_based {
            display.frame_pointer(memory)?
        } else {
            display.sp
        };
        let cfa = base.saturating_add(u64::from(self.cfa_offset));

        display.set_slot(arm64::FP, Some(cfa.offset(-16)));
        display.set_slot(arm64::LR, Some(cfa.offset(-8)));

        let count = i64::from(self.gpr_count);
        for index in 0..count {
            let slot = cfa.offset(-16 - 8 * (count - index));
            display.set_slot(arm64::X19 + index as u8, Some(slot));
        }

        let gpr_area = (8 * count + 15) & !15;
        let d_count = i64::from(self.d_pairs) * 2;
        for index in 0..d_count {
            let cell = cfa.offset(-16 - gpr_area - 8 * (d_count - index));
            display.d[index as usize] = memory.read_u64(cell)?;
        }
        Ok(cfa)
    }
}

/// Decoded step blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUnwind
{
    /// DWARF number of the CFA base, 29 (FP) or 31 (SP)
    pub cfa_register: u8,
    pub cfa_offset: u32,
    /// `(DWARF register, offset below the CFA)`
    pub saves: Vec<(u8, u32)>,
}

impl StepUnwind
{
    /// Decode a step blob.
    ///
    /// ## Errors
    ///
    /// `DecodeTruncated` without the `0xFF` terminator, `MalformedGcInfo` for
    /// a register outside X19..LR and D8..D15.
    pub fn parse(bytes: &[u8]) -> Result<Self>
    {
        let mut reader = VarIntReader::new(bytes);
        let cfa_register = reader.read_u8()?;
        if cfa_register != arm64::FP && cfa_register != DWARF_SP {
            return Err(WalkError::MalformedGcInfo(format!("CFA register {cfa_register} in step blob")));
        }
        let cfa_offset = reader.read_unsigned()?;

        let mut saves = Vec::new();
        loop {
            let reg = reader.read_u8()?;
            if reg == STEP_END {
                break;
            }
            if !(arm64::X19..=arm64::LR).contains(&reg) && !(DWARF_D8..DWARF_D8 + 8).contains(&reg) {
                return Err(WalkError::MalformedGcInfo(format!("register {reg} in step blob")));
            }
            saves.push((reg, reader.read_unsigned()?));
        }

        Ok(Self {
            cfa_register,
            cfa_offset,
            saves,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>)
    {
        out.push(self.cfa_register);
        varint::encode_unsigned(self.cfa_offset, out);
        for (reg, offset) in &self.saves {
            out.push(*reg);
            varint::encode_unsigned(*offset, out);
        }
        out.push(STEP_END);
    }

    fn restore(&self, display: &mut RegDisplay, memory: &dyn MemoryAccess) -> Result<Address>
    {
        let base = if self.cfa_register == arm64::FP {
            display.frame_pointer(memory)?
        } else {
            display.sp
        };
        let cfa = base.saturating_add(u64::from(self.cfa_offset));

        for (reg, offset) in &self.saves {
            let cell = cfa.offset(-i64::from(*offset));
            if *reg >= DWARF_D8 {
                display.d[usize::from(*reg - DWARF_D8)] = memory.read_u64(cell)?;
            } else {
                display.set_slot(*reg, Some(cell));
            }
        }
        Ok(cfa)
    }
}

/// Unwind one ARM64 frame with the custom blob at `data`.
///
/// ## Errors
///
/// `InvalidArgument` for a non-ARM64 display, decode errors from the blob and
/// `MemoryRead` for saves outside the snapshot.
pub fn unwind_stack_frame(
    image: &ModuleImage,
    mode: CustomUnwindMode,
    data: Address,
    display: &mut RegDisplay,
    memory: &dyn MemoryAccess,
) -> Result<()>
{
    if display.arch() != Architecture::Arm64 {
        return Err(WalkError::InvalidArgument(format!("ARM64 unwind blob used for {}", display.arch())));
    }

    let mut next = display.clone();
    let cfa = match mode {
        CustomUnwindMode::Compact => {
            let compact = CompactUnwind::from_bits(image.read_u16(data)?);
            trace!(?compact, "compact unwind");
            compact.restore(&mut next, memory)?
        }
        CustomUnwindMode::Step => {
            let bytes = image.bytes_from(data).ok_or(WalkError::MemoryRead { address: data })?;
            let step = StepUnwind::parse(bytes)?;
            trace!(saves = step.saves.len(), "step unwind");
            step.restore(&mut next, memory)?
        }
    };

    let lr = next
        .slot(arm64::LR)
        .ok_or_else(|| WalkError::UnwindStepFailed("return address in LR without a slot".to_string()))?;
    next.set_ip_from_slot(memory, lr)?;
    next.sp = cfa;

    if next.ip.is_null() || next.ip == display.ip {
        next.ip = Address::ZERO;
        next.p_ip = None;
    }
    debug!(sp = %next.sp, ip = %next.ip, "unwound with custom ARM64 blob");
    *display = next;
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory::SnapshotMemory;

    #[test]
    fn test_compact_bits()
    {
        let compact = CompactUnwind {
            fp_based: true,
            d_pairs: 1,
            gpr_count: 3,
            cfa_offset: 0x40,
        };
        assert_eq!(compact.bits(), 0x8000 | 0x2000 | 0x0600 | 0x4);
        assert_eq!(CompactUnwind::from_bits(compact.bits()), compact);
    }

    #[test]
    fn test_compact_sp_frame()
    {
        let compact = CompactUnwind {
            fp_based: false,
            d_pairs: 1,
            gpr_count: 1,
            cfa_offset: 0x30,
        };
        let mut memory = SnapshotMemory::new();
        // d8, d9 below the 16-byte X19 area
        memory.write_pointer(Architecture::Arm64, Address::new(0x1000), 0xd8);
        memory.write_pointer(Architecture::Arm64, Address::new(0x1008), 0xd9);

        let mut display = RegDisplay::new(Architecture::Arm64);
        display.sp = Address::new(0x1000);
        let cfa = compact.restore(&mut display, &memory).unwrap();

        assert_eq!(cfa, Address::new(0x1030));
        assert_eq!(display.slot(arm64::LR), Some(Address::new(0x1028)));
        assert_eq!(display.slot(arm64::FP), Some(Address::new(0x1020)));
        assert_eq!(display.slot(arm64::X19), Some(Address::new(0x1018)));
        assert_eq!(display.d_reg(8), Some(0xd8));
        assert_eq!(display.d_reg(9), Some(0xd9));
    }

    #[test]
    fn test_step_blob_requires_terminator()
    {
        let step = StepUnwind {
            cfa_register: DWARF_SP,
            cfa_offset: 0x20,
            saves: vec![(arm64::FP, 0x10), (arm64::LR, 0x8), (DWARF_D8, 0x18)],
        };
        let mut bytes = Vec::new();
        step.encode(&mut bytes);
        assert_eq!(StepUnwind::parse(&bytes).unwrap(), step);

        bytes.pop();
        assert!(matches!(StepUnwind::parse(&bytes), Err(WalkError::DecodeTruncated { .. })));
        assert!(matches!(StepUnwind::parse(&[31, 0, 5, 0, 0xff]), Err(WalkError::MalformedGcInfo(_))));
    }
}
