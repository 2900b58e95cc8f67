//! # DWARF CFI Unwinding
//!
//! Unwinding for ELF and Mach-O modules through the `.eh_frame` call frame
//! information the native toolchain emits for managed code.
//!
//! The FDE covering the IP is located through the `.eh_frame_hdr` search
//! table when the module has one, otherwise by scanning every entry. The row
//! for the IP then gives the CFA and a rule per register. Rules of the form
//! "saved at CFA + n" become slot pointers; nothing is copied, so the GC can
//! still update a root that lives in a callee-saved register of a caller.
//!
//! ## References
//!
//! - [DWARF Debugging Information Format](https://dwarfstd.org/)
//! - [gimli crate documentation](https://docs.rs/gimli/latest/gimli/)

use gimli::{
    BaseAddresses, CfaRule, EhFrame, EhFrameHdr, EndianSlice, LittleEndian, Register, RegisterRule, UnwindContext,
    UnwindSection,
};
use tracing::{debug, trace};

use crate::error::{Result, WalkError};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::{self, amd64, arm, arm64, x86};
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};

type Slice<'a> = EndianSlice<'a, LittleEndian>;
type Fde<'a> = gimli::FrameDescriptionEntry<Slice<'a>>;

/// DWARF numbers of x64 registers in machine order (`rax, rdx, rcx, rbx, rsi, rdi, rbp, rsp`)
const AMD64_DWARF_TO_MACHINE: [u8; 16] = [0, 2, 1, 3, 6, 7, 5, 4, 8, 9, 10, 11, 12, 13, 14, 15];

/// First DWARF number of XMM0 on x64
const AMD64_DWARF_XMM0: u16 = 17;
/// First DWARF number of D0 on ARM (VFP-v3 numbering)
const ARM_DWARF_D0: u16 = 256;
/// First DWARF number of V0 on ARM64
const ARM64_DWARF_V0: u16 = 64;

/// The frame description entry covering an IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdeInfo
{
    /// First code address described
    pub start: Address,
    pub len: u64,
    /// Language-specific data: the method-info blob of managed code
    pub lsda: Option<Address>,
}

struct CfiSections<'a>
{
    eh_frame: EhFrame<Slice<'a>>,
    hdr: Option<EhFrameHdr<Slice<'a>>>,
    bases: BaseAddresses,
    address_size: u8,
}

fn cfi_sections(image: &ModuleImage) -> Result<CfiSections<'_>>
{
    let eh = image
        .section(".eh_frame")
        .ok_or_else(|| WalkError::UnwindStepFailed("module has no .eh_frame".to_string()))?;

    let address_size = image.arch().pointer_size() as u8;
    let mut bases = BaseAddresses::default().set_eh_frame(eh.address.value());
    if let Some((text, _)) = image.code_range() {
        bases = bases.set_text(text.value());
    }

    let mut hdr = None;
    if let Some(section) = image.section(".eh_frame_hdr") {
        bases = bases.set_eh_frame_hdr(section.address.value());
        hdr = Some(EhFrameHdr::new(&section.data[..], LittleEndian));
    }

    let mut eh_frame = EhFrame::new(&eh.data[..], LittleEndian);
    eh_frame.set_address_size(address_size);

    Ok(CfiSections {
        eh_frame,
        hdr,
        bases,
        address_size,
    })
}

impl<'a> CfiSections<'a>
{
    fn find_fde(&self, pc: u64) -> Result<Option<Fde<'a>>>
    {
        if let Some(hdr) = &self.hdr {
            let parsed = hdr.parse(&self.bases, self.address_size)?;
            if let Some(table) = parsed.table() {
                let pointer = match table.lookup(pc, &self.bases) {
                    Ok(pointer) => pointer,
                    Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                let offset = table.pointer_to_offset(pointer)?;
                let fde = self
                    .eh_frame
                    .partial_fde_from_offset(&self.bases, offset)?
                    .parse(|section, bases, cie_offset| section.cie_from_offset(bases, cie_offset))?;
                return Ok(fde.contains(pc).then_some(fde));
            }
        }

        let mut entries = self.eh_frame.entries(&self.bases);
        while let Some(entry) = entries.next()? {
            let gimli::CieOrFde::Fde(partial) = entry else {
                continue;
            };
            let fde = partial.parse(|section, bases, cie_offset| section.cie_from_offset(bases, cie_offset))?;
            if fde.contains(pc) {
                return Ok(Some(fde));
            }
        }
        Ok(None)
    }
}

/// Find the FDE covering `ip`.
///
/// An indirect LSDA pointer is followed through the image.
///
/// ## Errors
///
/// `UnwindStepFailed` when the module has no `.eh_frame` or the CFI is
/// malformed.
pub fn find_fde(image: &ModuleImage, ip: Address) -> Result<Option<FdeInfo>>
{
    let sections = cfi_sections(image)?;
    let pc = image.arch().code_address(ip.value());
    let Some(fde) = sections.find_fde(pc)? else {
        return Ok(None);
    };

    let lsda = match fde.lsda() {
        Some(gimli::Pointer::Direct(address)) => Some(Address::new(address)),
        Some(gimli::Pointer::Indirect(cell)) => Some(image.read_address(image.arch(), Address::new(cell))?),
        None => None,
    };
    Ok(Some(FdeInfo {
        start: Address::new(fde.initial_address()),
        len: fde.len(),
        lsda,
    }))
}

/// Display register for DWARF register `dwarf`
fn display_register(arch: Architecture, dwarf: u16) -> Option<u8>
{
    let reg = match arch {
        Architecture::X86 => (dwarf < 8).then_some(dwarf as u8)?,
        Architecture::Amd64 => *AMD64_DWARF_TO_MACHINE.get(usize::from(dwarf))?,
        Architecture::Arm => (dwarf < 15).then_some(dwarf as u8)?,
        Architecture::Arm64 => (dwarf < 31).then_some(dwarf as u8)?,
    };
    (reg != stack_pointer(arch)).then_some(reg)
}

fn dwarf_register(arch: Architecture, reg: u8) -> Register
{
    match arch {
        Architecture::Amd64 => {
            let dwarf = AMD64_DWARF_TO_MACHINE
                .iter()
                .position(|machine| *machine == reg)
                .unwrap_or(usize::from(reg));
            Register(dwarf as u16)
        }
        _ => Register(u16::from(reg)),
    }
}

/// Display number of SP, which the display keeps by value
const fn stack_pointer(arch: Architecture) -> u8
{
    match arch {
        Architecture::X86 => x86::ESP,
        Architecture::Amd64 => amd64::RSP,
        Architecture::Arm => arm::SP,
        Architecture::Arm64 => arm64::SP,
    }
}

const fn dwarf_stack_pointer(arch: Architecture) -> u16
{
    match arch {
        Architecture::X86 => 4,
        Architecture::Amd64 => 7,
        Architecture::Arm => 13,
        Architecture::Arm64 => 31,
    }
}

/// Column holding the return address
const fn return_address_register(arch: Architecture) -> Register
{
    match arch {
        Architecture::X86 => Register(8),
        Architecture::Amd64 => Register(16),
        Architecture::Arm => Register(14),
        Architecture::Arm64 => Register(30),
    }
}

fn register_value(display: &RegDisplay, memory: &dyn MemoryAccess, dwarf: Register) -> Result<u64>
{
    let arch = display.arch();
    if dwarf.0 == dwarf_stack_pointer(arch) {
        return Ok(display.sp.value());
    }
    let reg = display_register(arch, dwarf.0)
        .ok_or_else(|| WalkError::UnwindStepFailed(format!("CFA based on unknown register {}", dwarf.0)))?;
    display.read_reg(memory, reg)
}

/// Unwind one frame with the module's CFI.
///
/// On success `display` describes the caller. When the caller's return
/// address is zero or the IP did not move, the display IP is set to zero:
/// the walk reached the end of the stack.
///
/// ## Errors
///
/// `UnwindStepFailed` when no FDE covers the IP or a rule cannot be
/// evaluated (CFA expressions, a missing base register).
pub fn unwind_stack_frame(image: &ModuleImage, display: &mut RegDisplay, memory: &dyn MemoryAccess) -> Result<()>
{
    let arch = display.arch();
    let sections = cfi_sections(image)?;
    let pc = arch.code_address(display.ip.value());
    let fde = sections
        .find_fde(pc)?
        .ok_or_else(|| WalkError::UnwindStepFailed(format!("no CFI covers {}", display.ip)))?;

    let mut ctx = UnwindContext::<usize>::new();
    let row = fde.unwind_info_for_address(&sections.eh_frame, &sections.bases, &mut ctx, pc)?;

    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            Address::new(register_value(display, memory, *register)?).offset(*offset)
        }
        CfaRule::Expression(_) => {
            return Err(WalkError::UnwindStepFailed("CFA expressions are not supported".to_string()));
        }
    };
    trace!(pc = format_args!("0x{pc:x}"), cfa = %cfa, "CFI row");

    let mut next = display.clone();
    for reg in 0..regs::slot_count(arch) as u8 {
        if reg == stack_pointer(arch) {
            continue;
        }
        match row.register(dwarf_register(arch, reg)) {
            RegisterRule::Offset(offset) => next.set_slot(reg, Some(cfa.offset(offset))),
            RegisterRule::Register(from) => {
                let slot = display_register(arch, from.0).and_then(|from| display.slot(from));
                next.set_slot(reg, slot);
            }
            // Undefined on a callee-saved column means "not touched by this frame".
            RegisterRule::Undefined | RegisterRule::SameValue => {}
            other => trace!(reg, rule = ?other, "register rule without a save slot"),
        }
    }
    restore_float_registers(&row, cfa, &mut next, memory)?;

    let return_address = return_address_register(arch);
    match row.register(return_address) {
        RegisterRule::Offset(offset) => next.set_ip_from_slot(memory, cfa.offset(offset))?,
        RegisterRule::Undefined | RegisterRule::SameValue if matches!(arch, Architecture::Arm | Architecture::Arm64) => {
            let lr = display
                .slot(return_address.0 as u8)
                .ok_or_else(|| WalkError::UnwindStepFailed("return address in LR without a slot".to_string()))?;
            next.set_ip_from_slot(memory, lr)?;
        }
        RegisterRule::Undefined => {
            next.ip = Address::ZERO;
            next.p_ip = None;
        }
        other => {
            return Err(WalkError::UnwindStepFailed(format!("unsupported return address rule {other:?}")));
        }
    }
    next.sp = cfa;

    if next.ip.is_null() || next.ip == display.ip {
        let ip = display.ip;
        debug!(ip = %ip, "end of stack");
        next.ip = Address::ZERO;
        next.p_ip = None;
    } else {
        debug!(sp = %next.sp, ip = %next.ip, "unwound with CFI");
    }

    *display = next;
    Ok(())
}

/// Nonvolatile vector registers are carried by value in the display.
fn restore_float_registers(
    row: &gimli::UnwindTableRow<usize>,
    cfa: Address,
    display: &mut RegDisplay,
    memory: &dyn MemoryAccess,
) -> Result<()>
{
    match display.arch() {
        Architecture::Amd64 => {
            for index in 0..display.xmm.len() {
                let column = Register(AMD64_DWARF_XMM0 + 6 + index as u16);
                if let RegisterRule::Offset(offset) = row.register(column) {
                    let cell = cfa.offset(offset);
                    let low = memory.read_u64(cell)?;
                    let high = memory.read_u64(cell.saturating_add(8))?;
                    display.xmm[index] = u128::from(low) | (u128::from(high) << 64);
                }
            }
        }
        Architecture::Arm | Architecture::Arm64 => {
            let d0 = if display.arch() == Architecture::Arm {
                ARM_DWARF_D0
            } else {
                ARM64_DWARF_V0
            };
            for index in 0..display.d.len() {
                let column = Register(d0 + 8 + index as u16);
                if let RegisterRule::Offset(offset) = row.register(column) {
                    display.d[index] = memory.read_u64(cfa.offset(offset))?;
                }
            }
        }
        Architecture::X86 => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_amd64_register_mapping()
    {
        assert_eq!(display_register(Architecture::Amd64, 6), Some(amd64::RBP));
        assert_eq!(display_register(Architecture::Amd64, 1), Some(amd64::RDX));
        assert_eq!(display_register(Architecture::Amd64, 7), None);
        assert_eq!(dwarf_register(Architecture::Amd64, amd64::RBX), Register(3));
        assert_eq!(dwarf_register(Architecture::Amd64, amd64::RSI), Register(4));
        assert_eq!(dwarf_register(Architecture::Arm64, arm64::FP), Register(29));
    }

    #[test]
    fn test_missing_eh_frame()
    {
        let image = ModuleImage::new(Architecture::Amd64, Address::new(0x1000));
        let err = find_fde(&image, Address::new(0x1000)).unwrap_err();
        assert!(err.is_end_of_walk());
    }
}
