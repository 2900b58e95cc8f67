//! # GC-root Enumeration
//!
//! Reports every live GC reference of one frame at one safe point. The
//! callsite map picks the callsite string for the code offset; each
//! descriptor of the string is resolved against the register display and
//! the GC-info header into slot addresses, which are handed to the report
//! callback with their flags.

pub mod callsite;
pub mod descriptor;

use bitflags::bitflags;
use tracing::{debug, trace};

pub use callsite::{find_callsite, find_callsite_at_or_before, CallsiteEntry, DeltaShortcuts};
pub use descriptor::{decode_string, RootDescriptor};

use crate::error::{Result, WalkError};
use crate::gcinfo::regs::order;
use crate::gcinfo::GcInfoHeader;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::{amd64, arm, arm64, x86};
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};

bitflags! {
    /// Attributes passed with each reported slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GcSlotFlags: u32 {
        /// The slot holds an interior pointer (byref)
        const INTERIOR = 0x1;
        /// The object must not move
        const PINNED = 0x2;
        const CHECK_APP_DOMAIN = 0x4;
        const STATIC = 0x8;
    }
}

bitflags! {
    /// Caller-supplied conditions of an enumeration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GcEnumFlags: u32 {
        /// The frame stopped at a hardware fault rather than a call
        const EXECUTION_ABORTED = 0x1;
        /// Filter funclet: the parent frame reports the shared locals
        const NO_REPORT_UNTRACKED = 0x2;
    }
}

/// One reported root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRoot
{
    /// Address of the cell holding the reference
    pub slot: Address,
    pub flags: GcSlotFlags,
}

/// Module-global tables the callsite map refers to
#[derive(Debug, Clone, Copy)]
pub struct CallsiteTables<'a>
{
    pub shortcuts: &'a DeltaShortcuts,
    pub strings: &'a [u8],
}

/// Everything needed to turn descriptors into slot addresses
pub struct RootContext<'a>
{
    pub header: &'a GcInfoHeader,
    pub display: &'a RegDisplay,
    pub memory: &'a dyn MemoryAccess,
}

/// Report the roots live at `code_offset`.
///
/// `map` is the callsite map of the method (the bytes after its epilog
/// table). A return address must match a callsite exactly; offsets with no
/// callsite report nothing. With `EXECUTION_ABORTED` the offset is a faulting
/// instruction and the last callsite at or before it applies.
///
/// ## Errors
///
/// Propagates decode errors, and `MalformedGcInfo` for descriptors the
/// frame cannot have (a local slot in a funclet, an x86 frameless local).
pub fn enum_gc_refs(
    ctx: &RootContext<'_>,
    map: &[u8],
    tables: CallsiteTables<'_>,
    code_offset: u32,
    flags: GcEnumFlags,
    report: &mut dyn FnMut(GcRoot),
) -> Result<()>
{
    let found = if flags.contains(GcEnumFlags::EXECUTION_ABORTED) {
        find_callsite_at_or_before(map, tables.shortcuts, code_offset)?
    } else {
        find_callsite(map, tables.shortcuts, code_offset)?
    };
    let Some(string_offset) = found else {
        return Ok(());
    };

    let descriptors = decode_string(tables.strings, string_offset)?;
    debug!(code_offset, string_offset, count = descriptors.len(), ?flags, "enumerating callsite roots");
    for descriptor in &descriptors {
        if flags.contains(GcEnumFlags::NO_REPORT_UNTRACKED) && descriptor.is_frame_relative() {
            trace!(?descriptor, "skipping frame slot for filter");
            continue;
        }
        report_descriptor(ctx, descriptor, report)?;
    }
    Ok(())
}

/// Resolve one descriptor and report its slots.
pub fn report_descriptor(ctx: &RootContext<'_>, descriptor: &RootDescriptor, report: &mut dyn FnMut(GcRoot)) -> Result<()>
{
    let arch = ctx.display.arch();
    let ptr = arch.pointer_size() as i64;

    match *descriptor {
        RootDescriptor::RegisterSet(mask) => {
            for bit in 0..5u8 {
                if mask & (1 << bit) != 0 {
                    report_register(ctx, callee_saved_register(arch, bit)?, GcSlotFlags::empty(), report);
                }
            }
        }
        RootDescriptor::Register { index, flags } => {
            report_register(ctx, callee_saved_register(arch, index)?, flags, report);
        }
        RootDescriptor::LocalSlotSet(mask) => {
            for slot in 0..4u8 {
                if mask & (1 << slot) != 0 {
                    report_local_slot(ctx, u32::from(slot), report)?;
                }
            }
        }
        RootDescriptor::LocalSlot(slot) => report_local_slot(ctx, u32::from(slot), report)?,
        RootDescriptor::StackSlots {
            frame_relative,
            offset,
            mask,
            flags,
        } => {
            let negative = offset < 0;
            let mut magnitude = i64::from(offset).abs();
            report_stack_slot(ctx, frame_relative, offset.into(), flags, report)?;
            let mut rest = mask;
            while rest != 0 {
                magnitude += ptr;
                if rest & 1 != 0 {
                    let offset = if negative { -magnitude } else { magnitude };
                    report_stack_slot(ctx, frame_relative, offset, flags, report)?;
                }
                rest >>= 1;
            }
        }
        RootDescriptor::ScratchRegisters { regs, interior, pinned } => {
            let scratch: &[u8] = match arch {
                Architecture::X86 => &[x86::EAX, x86::ECX, x86::EDX],
                Architecture::Amd64 => &order::AMD64_SCRATCH,
                Architecture::Arm => &order::ARM_SCRATCH,
                Architecture::Arm64 => &order::ARM64_SCRATCH,
            };
            for (bit, reg) in scratch.iter().enumerate() {
                let bit = 1u8 << bit;
                if regs & bit == 0 {
                    continue;
                }
                let mut flags = GcSlotFlags::empty();
                if pinned & bit != 0 {
                    flags |= GcSlotFlags::PINNED;
                }
                if interior & bit != 0 {
                    flags |= GcSlotFlags::INTERIOR;
                }
                // A scratch register the unwinder could not recover has no slot.
                if let Some(slot) = ctx.display.slot(*reg) {
                    report(GcRoot { slot, flags });
                }
            }
        }
    }
    Ok(())
}

/// Register number for callee-saved index `index` of a register descriptor
///
/// x86 and x64 count RBX, RSI, RDI, RBP, R12..R15; ARM counts r4..r11;
/// ARM64 counts x19..x26.
fn callee_saved_register(arch: Architecture, index: u8) -> Result<u8>
{
    let reg = match arch {
        Architecture::X86 => [x86::EBX, x86::ESI, x86::EDI, x86::EBP].get(usize::from(index)).copied(),
        Architecture::Amd64 => [
            amd64::RBX,
            amd64::RSI,
            amd64::RDI,
            amd64::RBP,
            amd64::R12,
            amd64::R13,
            amd64::R14,
            amd64::R15,
        ]
        .get(usize::from(index))
        .copied(),
        Architecture::Arm => (index < 8).then_some(arm::R4 + index),
        Architecture::Arm64 => (index < 8).then_some(arm64::X19 + index),
    };
    reg.ok_or_else(|| WalkError::MalformedGcInfo(format!("callee-saved register index {index} on {arch}")))
}

fn report_register(ctx: &RootContext<'_>, reg: u8, flags: GcSlotFlags, report: &mut dyn FnMut(GcRoot))
{
    match ctx.display.slot(reg) {
        Some(slot) => report(GcRoot { slot, flags }),
        None => trace!(reg, "live register has no slot"),
    }
}

/// Local slot N is the Nth pointer-sized cell of the locals area.
fn report_local_slot(ctx: &RootContext<'_>, slot: u32, report: &mut dyn FnMut(GcRoot)) -> Result<()>
{
    let header = ctx.header;
    if header.is_funclet() {
        return Err(WalkError::MalformedGcInfo("local slot descriptor in a funclet".to_string()));
    }

    let arch = header.arch;
    let ptr = arch.pointer_size() as i64;
    let slot = i64::from(slot);
    let frame_size = i64::from(header.frame_size);

    let address = if header.has_frame_pointer {
        let offset = match arch {
            Architecture::Arm | Architecture::Arm64 => frame_size - (slot + 1) * ptr,
            Architecture::Amd64 if header.frame_pointer_offset() != 0 => slot * ptr,
            _ => -i64::from(header.preserved_regs_save_size()) - slot * ptr,
        };
        ctx.display.frame_pointer(ctx.memory)?.offset(offset)
    } else {
        if arch == Architecture::X86 {
            return Err(WalkError::MalformedGcInfo("local slot in an ESP frame".to_string()));
        }
        ctx.display.sp.offset(frame_size - (slot + 1) * ptr)
    };

    report(GcRoot {
        slot: address,
        flags: GcSlotFlags::empty(),
    });
    Ok(())
}

fn report_stack_slot(
    ctx: &RootContext<'_>,
    frame_relative: bool,
    offset: i64,
    flags: GcSlotFlags,
    report: &mut dyn FnMut(GcRoot),
) -> Result<()>
{
    let base = if !frame_relative {
        ctx.display.sp
    } else if ctx.header.has_dynamic_alignment() && offset >= 0 {
        let reg = ctx.header.param_pointer_reg.unwrap_or(x86::EBX);
        Address::new(ctx.display.read_reg(ctx.memory, reg)?)
    } else {
        ctx.display.frame_pointer(ctx.memory)?
    };

    report(GcRoot {
        slot: base.offset(offset),
        flags,
    });
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory::SnapshotMemory;

    #[test]
    fn test_mask_expands_slots()
    {
        let memory = SnapshotMemory::new();
        let header = GcInfoHeader::new(Architecture::Amd64);
        let mut display = RegDisplay::new(Architecture::Amd64);
        display.sp = Address::new(0x1000);
        let ctx = RootContext {
            header: &header,
            display: &display,
            memory: &memory,
        };
        let mut roots = Vec::new();
        let descriptor = RootDescriptor::StackSlots {
            frame_relative: false,
            offset: 0x20,
            mask: 0x05,
            flags: GcSlotFlags::INTERIOR,
        };
        report_descriptor(&ctx, &descriptor, &mut |root| roots.push(root.slot.value())).unwrap();
        assert_eq!(roots, vec![0x1020, 0x1028, 0x1038]);
    }

    #[test]
    fn test_local_slot_rejected_in_funclet()
    {
        let memory = SnapshotMemory::new();
        let header = GcInfoHeader {
            funclet_offset: 0x40,
            ..GcInfoHeader::new(Architecture::Amd64)
        };
        let display = RegDisplay::new(Architecture::Amd64);
        let ctx = RootContext {
            header: &header,
            display: &display,
            memory: &memory,
        };
        let err = report_descriptor(&ctx, &RootDescriptor::LocalSlot(4), &mut |_| {}).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_x86_register_index_out_of_range()
    {
        assert!(callee_saved_register(Architecture::X86, 4).is_err());
        assert_eq!(callee_saved_register(Architecture::Arm64, 2).unwrap(), arm64::X21);
    }
}
