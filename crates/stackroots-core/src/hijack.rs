//! # Return Address Hijacking
//!
//! To bring a running thread to a GC safe point, the runtime overwrites the
//! return address of the thread's innermost managed frame with a stub. When
//! the method returns, the stub runs, preserves the return value and parks
//! the thread. The stub needs two things from the code manager: the cell
//! holding the return address, and the GC class of the return value so a
//! returned object reference is reported while the thread is parked.
//!
//! A frame is never hijacked when it is a funclet, a reverse-PInvoke method
//! (it synchronizes with the GC on its way back to native code anyway) or
//! stopped inside its prolog.

use tracing::debug;

use crate::codeman::{CodeManager, MethodInfo};
use crate::error::{Result, WalkError};
use crate::gcinfo::{ArmSavedRegs, GcInfoHeader, ReturnKind};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::{arm, x86};
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};
use crate::unwind::epilog;

/// Where and what to hijack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HijackInfo
{
    /// Cell holding the frame's return address
    pub return_address_slot: Address,
    /// GC class of the value returned in the first return register
    pub return_kind: ReturnKind,
    /// ARM64: GC class of a second return register
    pub second_return_kind: Option<ReturnKind>,
}

impl HijackInfo
{
    fn new(header: &GcInfoHeader, return_address_slot: Address) -> Self
    {
        let return_kind = match header.return_kind {
            ReturnKind::ToNative => ReturnKind::Scalar,
            kind => kind,
        };
        let second_return_kind = (header.arch == Architecture::Arm64 && header.reg1_return_kind != ReturnKind::Scalar)
            .then_some(header.reg1_return_kind);
        Self {
            return_address_slot,
            return_kind,
            second_return_kind,
        }
    }
}

fn refuses_hijack(info: &MethodInfo) -> bool
{
    info.is_funclet() || info.is_reverse_pinvoke() || info.in_prolog()
}

/// Hijack info for a frame of a module with platform unwind data.
///
/// The frame is unwound once on a copy of the display; the return address
/// sits one pointer below the caller's SP.
pub(crate) fn unwound_hijack_info(
    manager: &dyn CodeManager,
    info: &MethodInfo,
    display: &RegDisplay,
    memory: &dyn MemoryAccess,
) -> Result<Option<HijackInfo>>
{
    if refuses_hijack(info) {
        return Ok(None);
    }

    let mut caller = display.clone();
    manager.unwind_stack_frame(info, &mut caller, memory)?;
    let Some(slot) = caller.sp.checked_sub(manager.architecture().pointer_size()) else {
        return Ok(None);
    };
    debug!(slot = %slot, kind = info.header.return_kind.name(), "hijack slot from unwound caller");
    Ok(Some(HijackInfo::new(&info.header, slot)))
}

/// Hijack info for a frame of a legacy module.
///
/// Method bodies find the return address from the frame layout; epilogs are
/// replayed to see where it is now. ARM frames are only hijacked from the
/// body, and only when LR was saved by the prolog.
pub(crate) fn legacy_hijack_info(
    image: &ModuleImage,
    info: &MethodInfo,
    display: &RegDisplay,
    memory: &dyn MemoryAccess,
) -> Result<Option<HijackInfo>>
{
    let header = &info.header;
    if refuses_hijack(info) || header.arch == Architecture::Arm64 {
        return Ok(None);
    }
    if header.arch == Architecture::Arm && !header.is_reg_saved(ArmSavedRegs::LR.bits()) {
        return Ok(None);
    }

    let epilogs = info.epilogs(image)?;
    if let Some((found, offset)) = epilogs.find_epilog(info.code_offset) {
        if header.arch == Architecture::Arm {
            return Ok(None);
        }
        let bytes = epilog::epilog_bytes(image, info, &found)?;
        let program = epilog::decode(header.arch, bytes).map_err(WalkError::for_build_profile)?;
        if program.is_tail_call() {
            return Ok(None);
        }
        let mut scratch = display.clone();
        let exit = epilog::simulate(&program, offset, header, &mut scratch, memory)?;
        return Ok(exit.return_slot.map(|slot| HijackInfo::new(header, slot)));
    }

    let ptr = header.arch.pointer_size();
    let slot = match header.arch {
        // R11 chains frames with the return address just above it
        Architecture::Arm => Address::new(display.read_reg(memory, arm::R11)?).saturating_add(ptr),
        Architecture::X86 if header.has_frame_pointer && header.has_dynamic_alignment() => {
            Address::new(display.read_reg(memory, x86::EBX)?).saturating_add(ptr)
        }
        _ if header.has_frame_pointer => {
            let fp_offset = if header.arch == Architecture::Amd64 {
                header.frame_pointer_offset()
            } else {
                0
            };
            display.frame_pointer(memory)?.offset(ptr as i64 - fp_offset)
        }
        _ => display
            .sp
            .saturating_add(u64::from(header.frame_size))
            .saturating_add(u64::from(header.preserved_regs_save_size())),
    };
    debug!(slot = %slot, kind = header.return_kind.name(), "hijack slot from frame layout");
    Ok(Some(HijackInfo::new(header, slot)))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_native_return_is_scalar()
    {
        let header = GcInfoHeader {
            return_kind: ReturnKind::ToNative,
            ..GcInfoHeader::new(Architecture::Amd64)
        };
        let info = HijackInfo::new(&header, Address::new(0x100));
        assert_eq!(info.return_kind, ReturnKind::Scalar);
        assert_eq!(info.second_return_kind, None);
    }

    #[test]
    fn test_arm64_second_return_kind()
    {
        let header = GcInfoHeader {
            return_kind: ReturnKind::Object,
            reg1_return_kind: ReturnKind::Byref,
            ..GcInfoHeader::new(Architecture::Arm64)
        };
        let info = HijackInfo::new(&header, Address::new(0x100));
        assert_eq!(info.return_kind, ReturnKind::Object);
        assert_eq!(info.second_return_kind, Some(ReturnKind::Byref));
    }
}
