//! Unwinding driven by the GC-info header alone.
//!
//! In a method body the frame shape is fixed by the header: the locals sit
//! below the callee-saved registers, which sit below the return address.
//! Inside an epilog part of that shape is gone, so the epilog code is replayed
//! instead (see [`super::epilog`]).

use tracing::{debug, trace};

use super::epilog;
use crate::codeman::{MethodInfo, UnwindOutcome};
use crate::error::{Result, WalkError};
use crate::gcinfo::{Amd64SavedRegs, ArmSavedRegs, GcInfoHeader};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::{self, amd64, arm, x86};
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};

/// x64 pop order, the reverse of the prolog's pushes
const AMD64_RESTORE_ORDER: [(Amd64SavedRegs, u8); 7] = [
    (Amd64SavedRegs::R15, amd64::R15),
    (Amd64SavedRegs::R14, amd64::R14),
    (Amd64SavedRegs::R13, amd64::R13),
    (Amd64SavedRegs::R12, amd64::R12),
    (Amd64SavedRegs::RDI, amd64::RDI),
    (Amd64SavedRegs::RSI, amd64::RSI),
    (Amd64SavedRegs::RBX, amd64::RBX),
];

const X86_RESTORE_ORDER: [(Amd64SavedRegs, u8); 3] = [
    (Amd64SavedRegs::RBX, x86::EBX),
    (Amd64SavedRegs::RSI, x86::ESI),
    (Amd64SavedRegs::RDI, x86::EDI),
];

/// Saved transition frame of a method entered from native code
pub fn reverse_pinvoke_frame(header: &GcInfoHeader, display: &RegDisplay, memory: &dyn MemoryAccess) -> Result<Address>
{
    let fp = display.frame_pointer(memory)?;
    let cell = fp.offset(i64::from(header.reverse_pinvoke_frame_offset()));
    memory.read_address(display.arch(), cell)
}

/// Unwind one legacy frame.
///
/// `verify_epilogs` runs the epilog validator before an epilog is replayed.
///
/// ## Errors
///
/// `PrologSuspension` inside a prolog, `InvalidArgument` on ARM64. Epilog
/// code the matcher cannot follow is `UnknownEpilogOpcode` in debug builds and
/// `UnwindStepFailed` in release builds.
pub fn unwind_stack_frame(
    image: &ModuleImage,
    info: &MethodInfo,
    display: &mut RegDisplay,
    memory: &dyn MemoryAccess,
    verify_epilogs: bool,
) -> Result<UnwindOutcome>
{
    let header = &info.header;
    if header.arch == Architecture::Arm64 {
        return Err(WalkError::InvalidArgument("legacy ARM64 frames cannot be unwound".to_string()));
    }

    if header.returns_to_native() {
        let prev = reverse_pinvoke_frame(header, display, memory)?;
        debug!(prev = %prev, "reverse pinvoke frame, walk continues at the transition frame");
        return Ok(UnwindOutcome {
            prev_transition_frame: Some(prev),
        });
    }

    if info.in_prolog() {
        return Err(WalkError::PrologSuspension { offset: info.code_offset });
    }

    let epilogs = info.epilogs(image)?;
    if let Some((epilog, offset)) = epilogs.find_epilog(info.code_offset) {
        let bytes = epilog::epilog_bytes(image, info, &epilog)?;
        if verify_epilogs {
            epilog::verify_epilog_bytes(header, bytes).map_err(WalkError::for_build_profile)?;
        }
        let program = epilog::decode(header.arch, bytes).map_err(WalkError::for_build_profile)?;

        let mut next = display.clone();
        let exit =
            epilog::simulate(&program, offset, header, &mut next, memory).map_err(WalkError::for_build_profile)?;
        let slot = exit
            .return_slot
            .ok_or_else(|| WalkError::UnwindStepFailed("epilog return address is not on the stack".to_string()))?;
        next.set_ip_from_slot(memory, slot)?;
        debug!(epilog_start = epilog.start, offset, sp = %next.sp, ip = %next.ip, "unwound from epilog");
        *display = next;
        return Ok(UnwindOutcome::default());
    }

    unwind_body(header, display, memory)?;
    Ok(UnwindOutcome::default())
}

fn unwind_body(header: &GcInfoHeader, display: &mut RegDisplay, memory: &dyn MemoryAccess) -> Result<()>
{
    let arch = header.arch;
    let ptr = arch.pointer_size();
    let frame_size = u64::from(header.frame_size);

    let raw_sp = if header.has_frame_pointer {
        let fp = display.frame_pointer(memory)?;
        if arch == Architecture::Arm {
            fp.saturating_add(frame_size)
        } else {
            let below_fp = u64::from(header.preserved_regs_save_size()).saturating_sub(ptr);
            let frame_pointer_offset = if arch == Architecture::Amd64 {
                header.frame_pointer_offset()
            } else {
                0
            };
            fp.offset(-(below_fp as i64) - frame_pointer_offset)
        }
    } else {
        display.sp.saturating_add(frame_size)
    };
    trace!(raw_sp = %raw_sp, "register save area");

    let mut sp = raw_sp;
    match arch {
        Architecture::Amd64 => {
            restore_xmm(header, raw_sp, display, memory)?;
            for (mask, reg) in AMD64_RESTORE_ORDER {
                if header.is_reg_saved(mask.bits()) {
                    display.set_slot(reg, Some(sp));
                    sp = sp.saturating_add(ptr);
                }
            }
        }
        Architecture::X86 => {
            // EBP frames keep the registers below the locals
            let displacement = if header.has_frame_pointer { frame_size } else { 0 };
            for (mask, reg) in X86_RESTORE_ORDER {
                if header.is_reg_saved(mask.bits()) {
                    display.set_slot(reg, Some(sp.offset(-(displacement as i64))));
                    sp = sp.saturating_add(ptr);
                }
            }
        }
        Architecture::Arm => {
            for index in 0..u32::from(header.vfp_pushed_count) {
                let reg = u32::from(header.vfp_first_pushed) + index;
                if let Some(slot) = (reg as usize).checked_sub(8).filter(|slot| *slot < display.d.len()) {
                    display.d[slot] = memory.read_u64(sp)?;
                }
                sp = sp.saturating_add(8);
            }
            for bit in 0..8u8 {
                if header.is_reg_saved(1 << bit) {
                    display.set_slot(arm::R4 + bit, Some(sp));
                    sp = sp.saturating_add(ptr);
                }
            }
        }
        Architecture::Arm64 => {}
    }

    if arch != Architecture::Arm && header.has_frame_pointer {
        display.set_slot(regs::frame_register(arch), Some(sp));
        sp = sp.saturating_add(ptr);
    }

    if arch == Architecture::X86 && header.has_dynamic_alignment() {
        // EBX addresses its own save slot, just below the real return address.
        let ebx_save = Address::new(display.read_reg(memory, x86::EBX)?);
        display.set_slot(x86::EBX, Some(ebx_save));
        sp = ebx_save.saturating_add(ptr);
    }

    if arch == Architecture::Arm && !header.is_reg_saved(ArmSavedRegs::LR.bits()) {
        let lr = display
            .slot(arm::LR)
            .ok_or_else(|| WalkError::UnwindStepFailed("leaf frame without an LR slot".to_string()))?;
        display.set_ip_from_slot(memory, lr)?;
    } else {
        display.set_ip_from_slot(memory, sp)?;
        sp = sp.saturating_add(ptr);
    }

    match arch {
        Architecture::X86 => sp = sp.saturating_add(u64::from(header.return_pop_size())),
        Architecture::Arm => sp = sp.saturating_add(u64::from(header.parm_regs_pushed_count()) * ptr),
        _ => {}
    }

    display.sp = sp;
    let ip = display.ip;
    debug!(sp = %sp, ip = %ip, "unwound method body");
    Ok(())
}

/// XMM6..XMM15 are stored downwards from the 16-byte aligned save area start.
fn restore_xmm(header: &GcInfoHeader, raw_sp: Address, display: &mut RegDisplay, memory: &dyn MemoryAccess) -> Result<()>
{
    let mask = header.saved_xmm_mask >> 6;
    let mut area = raw_sp.align_down(16);
    for index in 0..display.xmm.len() {
        if mask & (1 << index) == 0 {
            continue;
        }
        area = area.offset(-16);
        let low = memory.read_u64(area)?;
        let high = memory.read_u64(area.saturating_add(8))?;
        display.xmm[index] = u128::from(low) | (u128::from(high) << 64);
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory::SnapshotMemory;

    #[test]
    fn test_frameless_x64_body()
    {
        let header = GcInfoHeader {
            frame_size: 0x18,
            saved_regs: (Amd64SavedRegs::RSI | Amd64SavedRegs::R12).bits(),
            ..GcInfoHeader::new(Architecture::Amd64)
        };
        let mut memory = SnapshotMemory::new();
        memory.write_pointer(Architecture::Amd64, Address::new(0x2028), 0x40_1234);

        let mut display = RegDisplay::new(Architecture::Amd64);
        display.sp = Address::new(0x2000);
        unwind_body(&header, &mut display, &memory).unwrap();

        assert_eq!(display.slot(amd64::R12), Some(Address::new(0x2018)));
        assert_eq!(display.slot(amd64::RSI), Some(Address::new(0x2020)));
        assert_eq!(display.p_ip, Some(Address::new(0x2028)));
        assert_eq!(display.ip, Address::new(0x40_1234));
        assert_eq!(display.sp, Address::new(0x2030));
    }

    #[test]
    fn test_xmm_restored_below_save_area()
    {
        let header = GcInfoHeader {
            saved_xmm_mask: 1 << 7,
            ..GcInfoHeader::new(Architecture::Amd64)
        };
        let mut memory = SnapshotMemory::new();
        memory.write_pointer(Architecture::Amd64, Address::new(0x1ff0), 0x1111);
        memory.write_pointer(Architecture::Amd64, Address::new(0x1ff8), 0x2222);

        let mut display = RegDisplay::new(Architecture::Amd64);
        restore_xmm(&header, Address::new(0x2008), &mut display, &memory).unwrap();
        assert_eq!(display.xmm_reg(7), Some(0x2222_u128 << 64 | 0x1111));
        assert_eq!(display.xmm_reg(6), Some(0));
    }

    #[test]
    fn test_arm_leaf_returns_through_lr()
    {
        let header = GcInfoHeader {
            frame_size: 8,
            ..GcInfoHeader::new(Architecture::Arm)
        };
        let mut memory = SnapshotMemory::new();
        let mut display = RegDisplay::new(Architecture::Arm);
        display.spill(&mut memory, Address::new(0x100), arm::LR, 0x8001);
        display.sp = Address::new(0x4000);
        unwind_body(&header, &mut display, &memory).unwrap();
        assert_eq!(display.ip, Address::new(0x8001));
        assert_eq!(display.sp, Address::new(0x4008));
    }
}
