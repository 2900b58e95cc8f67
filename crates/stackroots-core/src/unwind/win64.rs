//! # Windows x64 Unwinding
//!
//! Interpreter for the `RUNTIME_FUNCTION` / `UNWIND_INFO` tables of PE
//! modules.
//!
//! Unwind codes are listed in reverse prolog order, each tagged with the
//! prolog offset just past the instruction it describes. Replaying them from
//! the top undoes the prolog. An IP inside the prolog only replays the codes
//! whose instruction has already executed. An IP inside an epilog is detected
//! by looking at the code itself, and the remaining epilog instructions are
//! simulated instead.
//!
//! ```text
//! UNWIND_INFO
//!   u8  version:3 flags:5
//!   u8  prolog size
//!   u8  code count (16-bit slots)
//!   u8  frame register:4 frame offset:4 (x16)
//!   u16 codes[count]           padded to an even count
//!   u32 handler RVA            EHANDLER | UHANDLER
//!   RUNTIME_FUNCTION chained   CHAININFO
//! ```

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::error::{Result, WalkError};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::amd64;
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};

/// Longest instruction run followed while simulating an epilog
const MAX_EPILOG_INSTRUCTIONS: usize = 64;

/// Longest chain of `CHAININFO` records followed
const MAX_CHAIN_DEPTH: usize = 32;

/// One `.pdata` entry; all fields are RVAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeFunction
{
    pub begin: u32,
    pub end: u32,
    pub unwind_data: u32,
}

impl RuntimeFunction
{
    pub const SIZE: usize = 12;

    pub fn parse(bytes: &[u8]) -> Option<Self>
    {
        let field = |at: usize| -> Option<u32> { Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?)) };
        Some(Self {
            begin: field(0)?,
            end: field(4)?,
            unwind_data: field(8)?,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>)
    {
        out.extend_from_slice(&self.begin.to_le_bytes());
        out.extend_from_slice(&self.end.to_le_bytes());
        out.extend_from_slice(&self.unwind_data.to_le_bytes());
    }

    pub fn contains_rva(&self, rva: u32) -> bool
    {
        rva >= self.begin && rva < self.end
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnwindFlags: u8 {
        const EHANDLER = 0x01;
        const UHANDLER = 0x02;
        const CHAININFO = 0x04;
    }
}

/// Decoded unwind operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp
{
    /// `push reg`
    PushNonvol
    {
        reg: u8,
    },
    /// `sub rsp, size`, small or large form
    Alloc
    {
        size: u32,
    },
    /// `lea fp, [rsp + frame offset]`
    SetFpreg,
    /// `mov [rsp + offset], reg`
    SaveNonvol
    {
        reg: u8,
        offset: u32,
    },
    /// `movaps [rsp + offset], xmm`
    SaveXmm128
    {
        reg: u8,
        offset: u32,
    },
    /// Version 2 epilog marker
    Epilog,
    /// Hardware interrupt or exception frame, optionally with an error code
    PushMachframe
    {
        error_code: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode
{
    /// Prolog offset just past the instruction
    pub prolog_offset: u8,
    pub op: UnwindOp,
}

impl UnwindCode
{
    /// Number of 16-bit slots the code occupies
    pub fn slot_count(&self) -> usize
    {
        match self.op {
            UnwindOp::PushNonvol { .. } | UnwindOp::SetFpreg | UnwindOp::PushMachframe { .. } => 1,
            UnwindOp::Alloc { size } if size <= 128 => 1,
            UnwindOp::Alloc { size } if size % 8 == 0 && size / 8 <= u32::from(u16::MAX) => 2,
            UnwindOp::Alloc { .. } => 3,
            UnwindOp::SaveNonvol { offset, .. } if offset % 8 == 0 && offset / 8 <= u32::from(u16::MAX) => 2,
            UnwindOp::SaveXmm128 { offset, .. } if offset % 16 == 0 && offset / 16 <= u32::from(u16::MAX) => 2,
            UnwindOp::SaveNonvol { .. } | UnwindOp::SaveXmm128 { .. } => 3,
            UnwindOp::Epilog => 2,
        }
    }

    fn encode(&self, out: &mut Vec<u8>)
    {
        let mut slot = |op: u8, info: u8| {
            out.push(self.prolog_offset);
            out.push(op | (info << 4));
        };
        match self.op {
            UnwindOp::PushNonvol { reg } => slot(0, reg),
            UnwindOp::Alloc { size } if size <= 128 => slot(2, (size / 8).saturating_sub(1) as u8),
            UnwindOp::Alloc { size } if self.slot_count() == 2 => {
                slot(1, 0);
                out.extend_from_slice(&((size / 8) as u16).to_le_bytes());
            }
            UnwindOp::Alloc { size } => {
                slot(1, 1);
                out.extend_from_slice(&size.to_le_bytes());
            }
            UnwindOp::SetFpreg => slot(3, 0),
            UnwindOp::SaveNonvol { reg, offset } if self.slot_count() == 2 => {
                slot(4, reg);
                out.extend_from_slice(&((offset / 8) as u16).to_le_bytes());
            }
            UnwindOp::SaveNonvol { reg, offset } => {
                slot(5, reg);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            UnwindOp::SaveXmm128 { reg, offset } if self.slot_count() == 2 => {
                slot(8, reg);
                out.extend_from_slice(&((offset / 16) as u16).to_le_bytes());
            }
            UnwindOp::SaveXmm128 { reg, offset } => {
                slot(9, reg);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            UnwindOp::Epilog => {
                slot(6, 1);
                out.extend_from_slice(&[0, 0]);
            }
            UnwindOp::PushMachframe { error_code } => slot(10, u8::from(error_code)),
        }
    }
}

/// Decoded `UNWIND_INFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindInfo
{
    pub version: u8,
    pub flags: UnwindFlags,
    pub prolog_size: u8,
    /// Frame register in machine numbering, 0 for none
    pub frame_register: u8,
    /// Scaled frame register offset in 16-byte units
    pub frame_offset: u8,
    pub codes: Vec<UnwindCode>,
    /// Number of 16-bit code slots as recorded
    pub code_slots: u8,
    pub handler: Option<u32>,
    pub chained: Option<RuntimeFunction>,
}

impl UnwindInfo
{
    pub fn new(prolog_size: u8, codes: Vec<UnwindCode>) -> Self
    {
        let code_slots = codes.iter().map(UnwindCode::slot_count).sum::<usize>() as u8;
        Self {
            version: 1,
            flags: UnwindFlags::empty(),
            prolog_size,
            frame_register: 0,
            frame_offset: 0,
            codes,
            code_slots,
            handler: None,
            chained: None,
        }
    }

    /// Decode the unwind info at the start of `bytes`.
    ///
    /// ## Errors
    ///
    /// `DecodeTruncated` when the codes run past `bytes`, `UnwindStepFailed`
    /// for an unknown opcode.
    pub fn parse(bytes: &[u8]) -> Result<Self>
    {
        let byte = |at: usize| bytes.get(at).copied().ok_or(WalkError::DecodeTruncated { offset: at });
        let u16_at = |at: usize| -> Result<u16> { Ok(u16::from(byte(at)?) | (u16::from(byte(at + 1)?) << 8)) };
        let u32_at = |at: usize| -> Result<u32> { Ok(u32::from(u16_at(at)?) | (u32::from(u16_at(at + 2)?) << 16)) };

        let version = byte(0)? & 0x07;
        let flags = UnwindFlags::from_bits_truncate(byte(0)? >> 3);
        let prolog_size = byte(1)?;
        let code_slots = byte(2)?;
        let frame_register = byte(3)? & 0x0f;
        let frame_offset = byte(3)? >> 4;

        let mut codes = Vec::new();
        let mut index = 0usize;
        while index < usize::from(code_slots) {
            let at = 4 + index * 2;
            let prolog_offset = byte(at)?;
            let op = byte(at + 1)? & 0x0f;
            let info = byte(at + 1)? >> 4;
            let (op, slots) = match op {
                0 => (UnwindOp::PushNonvol { reg: info }, 1),
                1 if info == 0 => (
                    UnwindOp::Alloc {
                        size: u32::from(u16_at(at + 2)?) * 8,
                    },
                    2,
                ),
                1 => (UnwindOp::Alloc { size: u32_at(at + 2)? }, 3),
                2 => (
                    UnwindOp::Alloc {
                        size: (u32::from(info) + 1) * 8,
                    },
                    1,
                ),
                3 => (UnwindOp::SetFpreg, 1),
                4 => (
                    UnwindOp::SaveNonvol {
                        reg: info,
                        offset: u32::from(u16_at(at + 2)?) * 8,
                    },
                    2,
                ),
                5 => (
                    UnwindOp::SaveNonvol {
                        reg: info,
                        offset: u32_at(at + 2)?,
                    },
                    3,
                ),
                6 => (UnwindOp::Epilog, 2),
                8 => (
                    UnwindOp::SaveXmm128 {
                        reg: info,
                        offset: u32::from(u16_at(at + 2)?) * 16,
                    },
                    2,
                ),
                9 => (
                    UnwindOp::SaveXmm128 {
                        reg: info,
                        offset: u32_at(at + 2)?,
                    },
                    3,
                ),
                10 => (UnwindOp::PushMachframe { error_code: info != 0 }, 1),
                other => {
                    return Err(WalkError::UnwindStepFailed(format!("unknown unwind opcode {other}")));
                }
            };
            codes.push(UnwindCode { prolog_offset, op });
            index += slots;
        }

        let tail = 4 + 2 * ((usize::from(code_slots) + 1) & !1);
        let mut handler = None;
        let mut chained = None;
        if flags.contains(UnwindFlags::CHAININFO) {
            let entry = bytes
                .get(tail..tail + RuntimeFunction::SIZE)
                .ok_or(WalkError::DecodeTruncated { offset: tail })?;
            chained = RuntimeFunction::parse(entry);
        } else if flags.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER) {
            handler = Some(u32_at(tail)?);
        }

        Ok(Self {
            version,
            flags,
            prolog_size,
            frame_register,
            frame_offset,
            codes,
            code_slots,
            handler,
            chained,
        })
    }

    /// Bytes up to the end of the codes or the handler RVA.
    ///
    /// Managed code keeps its method-info blob right after this.
    pub fn size(&self) -> usize
    {
        let size = 4 + 2 * usize::from(self.code_slots);
        if self.flags.intersects(UnwindFlags::EHANDLER | UnwindFlags::UHANDLER) {
            size.next_multiple_of(4) + 4
        } else {
            size
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>)
    {
        out.push((self.version & 0x07) | (self.flags.bits() << 3));
        out.push(self.prolog_size);
        out.push(self.code_slots);
        out.push((self.frame_register & 0x0f) | (self.frame_offset << 4));
        for code in &self.codes {
            code.encode(out);
        }
        let written = usize::from(self.code_slots);
        if let Some(chained) = &self.chained {
            if written % 2 == 1 {
                out.extend_from_slice(&[0, 0]);
            }
            chained.encode(out);
        } else if let Some(handler) = self.handler {
            if written % 2 == 1 {
                out.extend_from_slice(&[0, 0]);
            }
            out.extend_from_slice(&handler.to_le_bytes());
        }
    }

    /// Prolog offset of the `SET_FPREG` code
    fn set_fpreg_offset(&self) -> Option<u8>
    {
        self.codes
            .iter()
            .find(|code| code.op == UnwindOp::SetFpreg)
            .map(|code| code.prolog_offset)
    }
}

/// Unwind info for `function`.
pub fn unwind_info(image: &ModuleImage, function: &RuntimeFunction) -> Result<UnwindInfo>
{
    let address = image.rva(function.unwind_data);
    let bytes = image.bytes_from(address).ok_or(WalkError::MemoryRead { address })?;
    UnwindInfo::parse(bytes)
}

fn int_reg(display: &RegDisplay, memory: &dyn MemoryAccess, reg: u8) -> Result<u64>
{
    if reg == amd64::RSP {
        Ok(display.sp.value())
    } else {
        display.read_reg(memory, reg)
    }
}

/// Unwind one frame of the function `function` with its unwind info.
///
/// ## Errors
///
/// `UnwindStepFailed` for malformed unwind data, `MemoryRead` when a saved
/// value is outside the snapshot.
pub fn unwind_stack_frame(
    image: &ModuleImage,
    function: &RuntimeFunction,
    display: &mut RegDisplay,
    memory: &dyn MemoryAccess,
) -> Result<()>
{
    if display.arch() != Architecture::Amd64 {
        return Err(WalkError::InvalidArgument(format!(
            "x64 unwind data used for {}",
            display.arch()
        )));
    }

    let base = image.base();
    let pc = u32::try_from(display.ip.distance_from(base))
        .map_err(|_| WalkError::UnwindStepFailed(format!("{} is not in the module", display.ip)))?;

    let mut next = display.clone();
    let mut current = *function;
    let mut machine_frame = false;

    for depth in 0..MAX_CHAIN_DEPTH {
        let info = unwind_info(image, &current)?;

        let prolog_offset = if pc >= current.begin && pc < current.begin + u32::from(info.prolog_size) {
            pc - current.begin
        } else {
            if depth == 0 && is_inside_epilog(image, display.ip, function)? {
                let ip = display.ip;
                trace!(ip = %ip, "IP is inside an epilog");
                interpret_epilog(image, &mut next, memory)?;
                finish(display, next);
                return Ok(());
            }
            u32::MAX
        };

        let mut frame = next.sp;
        if info.frame_register != 0 {
            let established = info
                .set_fpreg_offset()
                .is_none_or(|offset| prolog_offset >= u32::from(offset));
            if established {
                let value = int_reg(&next, memory, info.frame_register)?;
                frame = Address::new(value).offset(-(i64::from(info.frame_offset) * 16));
            }
        }

        for code in &info.codes {
            if prolog_offset < u32::from(code.prolog_offset) {
                continue;
            }
            trace!(op = ?code.op, rsp = %next.sp, "replay unwind code");
            match code.op {
                UnwindOp::PushNonvol { reg } => {
                    next.set_slot(reg, Some(next.sp));
                    next.sp = next.sp.saturating_add(8);
                }
                UnwindOp::Alloc { size } => next.sp = next.sp.saturating_add(u64::from(size)),
                UnwindOp::SetFpreg => next.sp = frame,
                UnwindOp::SaveNonvol { reg, offset } => {
                    next.set_slot(reg, Some(frame.saturating_add(u64::from(offset))));
                }
                UnwindOp::SaveXmm128 { reg, offset } => {
                    let cell = frame.saturating_add(u64::from(offset));
                    if let Some(index) = usize::from(reg).checked_sub(6).filter(|index| *index < next.xmm.len()) {
                        let low = memory.read_u64(cell)?;
                        let high = memory.read_u64(cell.saturating_add(8))?;
                        next.xmm[index] = u128::from(low) | (u128::from(high) << 64);
                    }
                }
                UnwindOp::Epilog => {}
                UnwindOp::PushMachframe { error_code } => {
                    if error_code {
                        next.sp = next.sp.saturating_add(8);
                    }
                    let rsp = next.sp;
                    next.set_ip_from_slot(memory, rsp)?;
                    next.sp = memory.read_address(Architecture::Amd64, rsp.saturating_add(24))?;
                    machine_frame = true;
                }
            }
        }

        match info.chained {
            Some(chained) => current = chained,
            None => {
                if !machine_frame {
                    let rsp = next.sp;
                    next.set_ip_from_slot(memory, rsp)?;
                    next.sp = rsp.saturating_add(8);
                }
                finish(display, next);
                return Ok(());
            }
        }
    }

    Err(WalkError::UnwindStepFailed("chained unwind info does not terminate".to_string()))
}

fn finish(display: &mut RegDisplay, mut next: RegDisplay)
{
    if next.ip.is_null() {
        next.p_ip = None;
    }
    debug!(sp = %next.sp, ip = %next.ip, "unwound with x64 unwind data");
    *display = next;
}

/// Whether `ip` is at an epilog instruction.
///
/// An epilog is an optional `add rsp`/`lea rsp` with a REX.W prefix, then
/// `pop`s, then a `ret` or a jump that stays inside the function.
pub fn is_inside_epilog(image: &ModuleImage, ip: Address, function: &RuntimeFunction) -> Result<bool>
{
    let base = image.base();
    let mut pc = ip;
    let byte = |at: Address| image.read_u8(at);

    let first = byte(pc)?;
    if first & 0xf8 == 0x48 {
        let opcode = byte(pc.saturating_add(1))?;
        let modrm = byte(pc.saturating_add(2))?;
        match opcode {
            0x81 if first == 0x48 && modrm == 0xc4 => pc = pc.saturating_add(7),
            0x83 if first == 0x48 && modrm == 0xc4 => pc = pc.saturating_add(4),
            0x81 | 0x83 => return Ok(false),
            0x8d => {
                // REX.R/REX.X clear, destination RSP, no SIB
                if first & 0x06 != 0 || (modrm >> 3) & 7 != 4 || modrm & 7 == 4 {
                    return Ok(false);
                }
                match modrm >> 6 {
                    1 => pc = pc.saturating_add(4),
                    2 => pc = pc.saturating_add(7),
                    _ => return Ok(false),
                }
            }
            _ => {}
        }
    }

    for _ in 0..MAX_EPILOG_INSTRUCTIONS {
        if byte(pc)? & 0xf0 == 0x40 {
            pc = pc.saturating_add(1);
        }
        match byte(pc)? {
            0x58..=0x5f => pc = pc.saturating_add(1),
            0xc2 | 0xc3 => return Ok(true),
            0xf3 => return Ok(byte(pc.saturating_add(1))? == 0xc3),
            0xe9 => {
                let displacement = image.read_i32(pc.saturating_add(1))?;
                pc = pc.offset(5 + i64::from(displacement));
                if !jump_stays_inside(pc, base, function) {
                    return Ok(false);
                }
            }
            0xeb => {
                let displacement = byte(pc.saturating_add(1))? as i8;
                pc = pc.offset(2 + i64::from(displacement));
                if !jump_stays_inside(pc, base, function) {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }
    }
    Ok(false)
}

fn jump_stays_inside(target: Address, base: Address, function: &RuntimeFunction) -> bool
{
    u32::try_from(target.distance_from(base)).is_ok_and(|rva| function.contains_rva(rva))
}

/// Execute the rest of an epilog against `display`.
fn interpret_epilog(image: &ModuleImage, display: &mut RegDisplay, memory: &dyn MemoryAccess) -> Result<()>
{
    let mut pc = display.ip;
    for _ in 0..MAX_EPILOG_INSTRUCTIONS {
        let mut rex = 0u8;
        if image.read_u8(pc)? & 0xf0 == 0x40 {
            rex = image.read_u8(pc)? & 0x0f;
            pc = pc.saturating_add(1);
        }
        let high = (rex & 1) * 8;
        match image.read_u8(pc)? {
            pop @ 0x58..=0x5f => {
                display.set_slot(pop - 0x58 + high, Some(display.sp));
                display.sp = display.sp.saturating_add(8);
                pc = pc.saturating_add(1);
            }
            0x81 => {
                display.sp = display.sp.offset(i64::from(image.read_i32(pc.saturating_add(2))?));
                pc = pc.saturating_add(6);
            }
            0x83 => {
                display.sp = display.sp.offset(i64::from(image.read_u8(pc.saturating_add(2))? as i8));
                pc = pc.saturating_add(3);
            }
            0x8d => {
                let modrm = image.read_u8(pc.saturating_add(1))?;
                let base = int_reg(display, memory, (modrm & 7) + high)?;
                if modrm >> 6 == 1 {
                    let displacement = image.read_u8(pc.saturating_add(2))? as i8;
                    display.sp = Address::new(base).offset(i64::from(displacement));
                    pc = pc.saturating_add(3);
                } else {
                    let displacement = image.read_i32(pc.saturating_add(2))?;
                    display.sp = Address::new(base).offset(i64::from(displacement));
                    pc = pc.saturating_add(6);
                }
            }
            0xc2 => {
                let pop = image.read_u16(pc.saturating_add(1))?;
                let rsp = display.sp;
                display.set_ip_from_slot(memory, rsp)?;
                display.sp = rsp.saturating_add(8 + u64::from(pop));
                return Ok(());
            }
            0xc3 | 0xf3 => {
                let rsp = display.sp;
                display.set_ip_from_slot(memory, rsp)?;
                display.sp = rsp.saturating_add(8);
                return Ok(());
            }
            0xe9 => {
                let displacement = image.read_i32(pc.saturating_add(1))?;
                pc = pc.offset(5 + i64::from(displacement));
            }
            0xeb => {
                let displacement = image.read_u8(pc.saturating_add(1))? as i8;
                pc = pc.offset(2 + i64::from(displacement));
            }
            other => {
                return Err(WalkError::UnwindStepFailed(format!(
                    "unexpected epilog byte 0x{other:02x} at {pc}"
                )));
            }
        }
    }
    Err(WalkError::UnwindStepFailed("epilog does not return".to_string()))
}
