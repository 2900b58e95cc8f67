//! # Epilog Matching
//!
//! Legacy methods carry no unwind data for their epilogs. When a thread is
//! stopped inside one, part of the frame has already been torn down and the
//! body rules no longer apply. The matcher decodes the epilog's machine code
//! into an [`EpilogProgram`] and replays the instructions that have not run
//! yet against a copy of the register display. That yields the return
//! address cell for hijacking and, for unwinding, every callee-saved slot
//! still on the stack plus the caller's SP.
//!
//! The same decoded program drives [`verify_epilog_bytes`], which checks that
//! the code matches what the GC-info header promises.

pub mod amd64;
pub mod arm;
pub mod x86;

use tracing::{debug, trace};

use crate::codeman::MethodInfo;
use crate::error::{Result, WalkError};
use crate::gcinfo::{EpilogInfo, GcInfoHeader};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::{amd64 as amd64_regs, arm as arm_regs, x86 as x86_regs};
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};

/// One decoded epilog instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpilogOp
{
    /// `sp = reg + displacement` (`lea rsp, [rbp+d]`, `mov esp, ebp`, `add sp, r7, #n`)
    SetSpFromFrame
    {
        reg: u8,
        displacement: i32,
    },
    AddSp(u32),
    /// Pop one register
    Pop(u8),
    /// ARM register list; bit N pops rN, bit 15 pops the PC
    PopRegs(u16),
    /// ARM `vpop {d<first>..}`
    PopVfp
    {
        first: u8,
        count: u8,
    },
    /// ARM `movw`/`movt r12` feeding a large stack adjustment
    LoadImmediate(u16),
    /// ARM `ldr pc, [sp], #n`
    LoadPc(u32),
    /// `ret` / `ret N`; `pop_size` is N
    Return
    {
        pop_size: u32,
    },
    /// ARM `bx lr`
    BranchToLr,
    /// Jump to another method or a throw helper
    TailCall,
}

impl EpilogOp
{
    /// Whether the instruction leaves the method
    pub const fn is_terminator(&self) -> bool
    {
        match self {
            EpilogOp::Return { .. } | EpilogOp::BranchToLr | EpilogOp::TailCall | EpilogOp::LoadPc(_) => true,
            EpilogOp::PopRegs(mask) => *mask & (1 << 15) != 0,
            _ => false,
        }
    }
}

/// An instruction and where it sits in the epilog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpilogStep
{
    /// Offset from the epilog start
    pub offset: u32,
    /// Encoded length in bytes
    pub len: u32,
    pub op: EpilogOp,
}

/// Decoded epilog, ending with its terminator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpilogProgram
{
    pub steps: Vec<EpilogStep>,
}

impl EpilogProgram
{
    pub(crate) fn push(&mut self, offset: usize, len: usize, op: EpilogOp)
    {
        self.steps.push(EpilogStep {
            offset: offset as u32,
            len: len as u32,
            op,
        });
    }

    /// Total bytes covered by the decoded instructions
    pub fn len(&self) -> u32
    {
        self.steps.last().map_or(0, |step| step.offset + step.len)
    }

    pub fn is_empty(&self) -> bool
    {
        self.steps.is_empty()
    }

    /// Whether the epilog leaves through a jump rather than a return
    pub fn is_tail_call(&self) -> bool
    {
        matches!(self.steps.last(), Some(step) if step.op == EpilogOp::TailCall)
    }
}

/// Decode the epilog starting at `bytes[0]`.
///
/// Decoding stops after the first terminator (`ret`, tail jump, `bx`, a
/// pop or load of the PC).
///
/// ## Errors
///
/// `UnknownEpilogOpcode` at the first byte that starts no epilog instruction;
/// `DecodeTruncated` if the bytes end before a terminator; `InvalidArgument`
/// for ARM64, whose legacy epilogs are not matched.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::types::Architecture;
/// use stackroots_core::unwind::epilog::{decode, EpilogOp};
///
/// // pop rbx; pop rbp; ret
/// let program = decode(Architecture::Amd64, &[0x5b, 0x5d, 0xc3])?;
/// assert_eq!(program.steps.len(), 3);
/// assert_eq!(program.steps[2].op, EpilogOp::Return { pop_size: 0 });
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
pub fn decode(arch: Architecture, bytes: &[u8]) -> Result<EpilogProgram>
{
    match arch {
        Architecture::Amd64 => amd64::decode(bytes),
        Architecture::X86 => x86::decode(bytes),
        Architecture::Arm => arm::decode(bytes),
        Architecture::Arm64 => Err(WalkError::InvalidArgument("ARM64 legacy epilogs are not matched".to_string())),
    }
}

/// Check that an epilog's code is exactly what `header` describes.
///
/// Methods returning to native code are never hijacked and always pass.
///
/// ## Errors
///
/// `UnknownEpilogOpcode` at the first instruction that differs from the
/// expected sequence, in opcode or in operand.
pub fn verify_epilog_bytes(header: &GcInfoHeader, bytes: &[u8]) -> Result<()>
{
    if header.returns_to_native() {
        return Ok(());
    }
    let program = decode(header.arch, bytes)?;
    let mut expect = Expectation::new(&program, bytes);
    match header.arch {
        Architecture::Amd64 => amd64::verify(header, &mut expect)?,
        Architecture::X86 => x86::verify(header, &mut expect)?,
        Architecture::Arm => arm::verify(header, &mut expect)?,
        Architecture::Arm64 => {
            return Err(WalkError::InvalidArgument("ARM64 legacy epilogs are not validated".to_string()));
        }
    }
    expect.finish()
}

/// Run [`verify_epilog_bytes`] over every epilog of the method.
pub fn verify_method_epilogs(image: &ModuleImage, info: &MethodInfo) -> Result<()>
{
    let table = info.epilogs(image)?;
    for epilog in table.iter() {
        let bytes = epilog_bytes(image, info, epilog)?;
        verify_epilog_bytes(&info.header, bytes).inspect_err(|err| {
            debug!(start = epilog.start, %err, "epilog does not match its header");
        })?;
    }
    Ok(())
}

pub(crate) fn epilog_bytes<'a>(image: &'a ModuleImage, info: &MethodInfo, epilog: &EpilogInfo) -> Result<&'a [u8]>
{
    let start = info.method_start.saturating_add(u64::from(epilog.start));
    image.bytes_from(start).ok_or(WalkError::MemoryRead { address: start })
}

/// Cursor over a decoded program used by the per-architecture validators
pub(crate) struct Expectation<'p>
{
    steps: &'p [EpilogStep],
    bytes: &'p [u8],
    next: usize,
}

impl<'p> Expectation<'p>
{
    fn new(program: &'p EpilogProgram, bytes: &'p [u8]) -> Self
    {
        Self {
            steps: &program.steps,
            bytes,
            next: 0,
        }
    }

    pub(crate) fn peek(&self) -> Option<&'p EpilogStep>
    {
        self.steps.get(self.next)
    }

    /// Consume the next step if `accept` takes it; otherwise fail at that step.
    pub(crate) fn step(&mut self, accept: impl FnOnce(&EpilogStep) -> bool) -> Result<&'p EpilogStep>
    {
        match self.steps.get(self.next) {
            Some(step) if accept(step) => {
                self.next += 1;
                Ok(step)
            }
            Some(step) => Err(self.mismatch(step.offset)),
            None => Err(self.mismatch(self.end_offset())),
        }
    }

    /// Consume the next step only if `accept` takes it.
    pub(crate) fn optional(&mut self, accept: impl FnOnce(&EpilogStep) -> bool) -> Option<&'p EpilogStep>
    {
        let step = self.steps.get(self.next).filter(|step| accept(step))?;
        self.next += 1;
        Some(step)
    }

    pub(crate) fn mismatch(&self, offset: u32) -> WalkError
    {
        WalkError::UnknownEpilogOpcode {
            offset,
            byte: self.bytes.get(offset as usize).copied().unwrap_or(0),
        }
    }

    fn end_offset(&self) -> u32
    {
        self.steps.last().map_or(0, |step| step.offset + step.len)
    }

    fn finish(&self) -> Result<()>
    {
        match self.steps.get(self.next) {
            Some(step) => Err(self.mismatch(step.offset)),
            None => Ok(()),
        }
    }
}

/// Where the epilog hands control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpilogExit
{
    /// Cell holding the return address; `None` if it lives only in a register
    pub return_slot: Option<Address>,
    /// The epilog jumps away instead of returning
    pub tail_call: bool,
}

/// Replay the instructions at or after `epilog_offset` on `display`.
///
/// Slots of popped callee-saved registers are pointed at their stack cells,
/// SP advances past everything the remaining instructions pop, and the
/// return address cell is reported. The IP is not changed.
pub fn simulate(
    program: &EpilogProgram,
    epilog_offset: u32,
    header: &GcInfoHeader,
    display: &mut RegDisplay,
    memory: &dyn MemoryAccess,
) -> Result<EpilogExit>
{
    let arch = display.arch();
    let ptr = arch.pointer_size();
    let mut exit = EpilogExit {
        return_slot: None,
        tail_call: false,
    };

    for step in program.steps.iter().filter(|step| step.offset >= epilog_offset) {
        let sp = display.sp;
        trace!(offset = step.offset, op = ?step.op, sp = %sp, "replaying epilog step");
        match step.op {
            EpilogOp::SetSpFromFrame { reg, displacement } => {
                let base = display.read_reg(memory, reg)?;
                display.sp = Address::new(base).offset(i64::from(displacement));
            }
            EpilogOp::AddSp(amount) => display.sp = display.sp.saturating_add(u64::from(amount)),
            EpilogOp::Pop(reg) => {
                if is_callee_saved(arch, reg) {
                    display.set_slot(reg, Some(display.sp));
                }
                display.sp = display.sp.saturating_add(ptr);
            }
            EpilogOp::PopRegs(mask) => {
                for reg in 0..16u8 {
                    if mask & (1 << reg) == 0 {
                        continue;
                    }
                    if reg == arm_regs::PC {
                        exit.return_slot = Some(display.sp);
                    } else if is_callee_saved(arch, reg) {
                        display.set_slot(reg, Some(display.sp));
                    }
                    display.sp = display.sp.saturating_add(ptr);
                }
            }
            EpilogOp::PopVfp { first, count } => {
                for reg in first..first.saturating_add(count) {
                    if let Some(index) = usize::from(reg).checked_sub(8).filter(|index| *index < display.d.len()) {
                        display.d[index] = memory.read_u64(display.sp)?;
                    }
                    display.sp = display.sp.saturating_add(8);
                }
            }
            EpilogOp::LoadImmediate(_) => {}
            EpilogOp::LoadPc(post_increment) => {
                exit.return_slot = Some(display.sp);
                display.sp = display.sp.saturating_add(u64::from(post_increment));
            }
            EpilogOp::Return { pop_size } => {
                exit.return_slot = Some(display.sp);
                display.sp = display.sp.saturating_add(ptr + u64::from(pop_size));
            }
            EpilogOp::BranchToLr => exit.return_slot = display.slot(arm_regs::LR),
            EpilogOp::TailCall => {
                exit.tail_call = true;
                if arch == Architecture::Arm {
                    exit.return_slot = display.slot(arm_regs::LR);
                } else {
                    exit.return_slot = Some(display.sp);
                    display.sp = display.sp.saturating_add(ptr + u64::from(header.return_pop_size()));
                }
            }
        }
    }

    Ok(exit)
}

fn is_callee_saved(arch: Architecture, reg: u8) -> bool
{
    match arch {
        Architecture::X86 => matches!(reg, x86_regs::EBX | x86_regs::EBP | x86_regs::ESI | x86_regs::EDI),
        Architecture::Amd64 => matches!(
            reg,
            amd64_regs::RBX | amd64_regs::RBP | amd64_regs::RSI | amd64_regs::RDI | amd64_regs::R12..=amd64_regs::R15
        ),
        Architecture::Arm => (arm_regs::R4..=arm_regs::R11).contains(&reg) || reg == arm_regs::LR,
        Architecture::Arm64 => false,
    }
}
