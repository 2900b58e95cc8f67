//! # GC-info Header
//!
//! Per-method metadata produced by the AOT compiler: prolog and epilog
//! geometry, frame size, saved-register mask, return kind and the
//! architecture-specific extras each unwinder needs.
//!
//! ## Encoding
//!
//! A fixed 4-byte header is followed by optional var-int fields. The order of
//! the optional fields is part of the format:
//!
//! 1. frame size (pointer units)
//! 2. reverse-PInvoke frame offset
//! 3. the architecture block (x64 frame pointer offset and XMM mask; x86
//!    argument count high byte and stack-change string; ARM pushed parameter
//!    set and VFP range; ARM64 high saved-register byte, parameter count and
//!    VFP mask)
//! 4. extra-data byte, param pointer register, GS cookie offset
//! 5. epilog count
//! 6. funclet table and nested funclet headers
//!
//! Nothing may follow the funclet headers: they are decoded recursively in
//! place when a method offset selects a funclet.

pub mod epilog;
pub mod regs;
pub mod stack_changes;

use smallvec::SmallVec;

pub use epilog::{EpilogInfo, EpilogTable};
pub use regs::{Amd64SavedRegs, Arm64SavedRegs, ArmSavedRegs};
pub use stack_changes::StackChange;

use crate::error::{Result, WalkError};
use crate::types::Architecture;
use crate::varint::{encode_unsigned, VarIntReader};

/// Size of the fixed part of every header
pub const FIXED_HEADER_SIZE: usize = 4;

/// `epilogCountSmall` value meaning "count follows as a var-int"
const EPILOG_COUNT_SMALL_MAX: u8 = 3;

/// ARM64 keeps the low nine saved-register bits in the fixed header
const ARM64_PRESERVED_REGS_LOW: u32 = 9;

/// Stack pointer skew applied to x64 SP-relative frame pointer offsets
pub const X64_SP_SKEW: i64 = 0x10;

/// How a method hands back its return value
///
/// `ToNative` marks a reverse-PInvoke entry point: the method returns to
/// unmanaged code and its frame holds the saved transition frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnKind
{
    #[default]
    Scalar,
    Object,
    Byref,
    ToNative,
}

impl ReturnKind
{
    pub const fn from_bits(bits: u8) -> Self
    {
        match bits & 3 {
            0 => ReturnKind::Scalar,
            1 => ReturnKind::Object,
            2 => ReturnKind::Byref,
            _ => ReturnKind::ToNative,
        }
    }

    pub const fn bits(self) -> u8
    {
        match self {
            ReturnKind::Scalar => 0,
            ReturnKind::Object => 1,
            ReturnKind::Byref => 2,
            ReturnKind::ToNative => 3,
        }
    }

    pub const fn name(self) -> &'static str
    {
        match self {
            ReturnKind::Scalar => "scalar",
            ReturnKind::Object => "object",
            ReturnKind::Byref => "byref",
            ReturnKind::ToNative => "native",
        }
    }
}

/// Decoded GC-info header
///
/// All sizes and offsets are in bytes, already scaled from their on-disk
/// units (pointer units for the frame size, 4-byte instructions for ARM64
/// prolog and epilog sizes). Register masks keep their raw encoding; use the
/// typed views in [`regs`] to interpret them.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::gcinfo::{GcInfoHeader, ReturnKind};
/// use stackroots_core::types::Architecture;
///
/// let header = GcInfoHeader {
///     prolog_size: 8,
///     frame_size: 0x20,
///     epilog_count: 1,
///     epilog_at_end: true,
///     fixed_epilog_size: 6,
///     return_kind: ReturnKind::Object,
///     ..GcInfoHeader::new(Architecture::Amd64)
/// };
///
/// let mut bytes = Vec::new();
/// header.encode(&mut bytes)?;
/// let (decoded, size) = GcInfoHeader::decode(Architecture::Amd64, &bytes, 0x10)?;
/// assert_eq!(decoded, header);
/// assert_eq!(size, bytes.len());
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcInfoHeader
{
    pub arch: Architecture,
    pub prolog_size: u32,
    /// Set by `decode` when a funclet table follows the header.
    pub has_funclets: bool,
    /// Zero means every epilog carries its own size in the epilog table.
    pub fixed_epilog_size: u32,
    pub epilog_count: u32,
    /// The single epilog is the last `fixed_epilog_size` bytes of the method.
    pub epilog_at_end: bool,
    pub return_kind: ReturnKind,
    /// ARM64 only: GC class of a value returned in `x1`.
    pub reg1_return_kind: ReturnKind,
    pub has_frame_pointer: bool,
    pub frame_size: u32,
    /// Raw callee-saved register mask; bit meaning depends on `arch`.
    pub saved_regs: u16,
    /// Signed reverse-PInvoke transition frame offset, when `return_kind` is `ToNative`.
    pub reverse_pinvoke_offset: i32,
    /// x64 frame pointer offset in 16-byte units; zero for RBP-chained frames.
    pub x64_frame_ptr_offset: u32,
    /// x64 saved XMM registers, bit N = xmmN (only xmm6..xmm15 may be set).
    pub saved_xmm_mask: u16,
    /// x86 bytes popped by `ret N`.
    pub return_pop_size: u32,
    /// x86 push/pop history of frameless methods.
    pub stack_changes: SmallVec<[StackChange; 4]>,
    /// ARM: pushed subset of r0..r3. ARM64: number of x0..x7 pushed.
    pub parm_regs_pushed: u8,
    /// ARM: first pushed D register (8..15).
    pub vfp_first_pushed: u8,
    /// ARM: number of consecutive D registers pushed.
    pub vfp_pushed_count: u8,
    /// ARM64: pushed subset of d8..d15.
    pub vfp_pushed_mask: u8,
    /// Binary logarithm of the dynamic frame alignment, zero when not aligned.
    pub log_stack_alignment: u8,
    /// Register holding the incoming-argument pointer of a dynamically aligned frame.
    pub param_pointer_reg: Option<u8>,
    pub gs_cookie_offset: Option<u32>,
    pub has_common_vars: bool,
    /// ARM64: FP and LR are saved above the locals rather than below.
    pub fplr_on_top: bool,
    /// Start offset of the funclet the header was decoded for; zero for the main body.
    pub funclet_offset: u32,
}

impl GcInfoHeader
{
    /// Empty header for `arch`: no frame, no saved registers, scalar return.
    pub fn new(arch: Architecture) -> Self
    {
        Self {
            arch,
            prolog_size: 0,
            has_funclets: false,
            fixed_epilog_size: 0,
            epilog_count: 0,
            epilog_at_end: false,
            return_kind: ReturnKind::Scalar,
            reg1_return_kind: ReturnKind::Scalar,
            has_frame_pointer: false,
            frame_size: 0,
            saved_regs: 0,
            reverse_pinvoke_offset: 0,
            x64_frame_ptr_offset: 0,
            saved_xmm_mask: 0,
            return_pop_size: 0,
            stack_changes: SmallVec::new(),
            parm_regs_pushed: 0,
            vfp_first_pushed: 0,
            vfp_pushed_count: 0,
            vfp_pushed_mask: 0,
            log_stack_alignment: 0,
            param_pointer_reg: None,
            gs_cookie_offset: None,
            has_common_vars: false,
            fplr_on_top: false,
            funclet_offset: 0,
        }
    }

    /// Decode the header at the start of `data` for code offset `method_offset`.
    ///
    /// When the method has funclets, the header returned is the one of the
    /// code body containing `method_offset` (the last funclet whose start is
    /// at or below it, or the main body). A funclet header inherits the main
    /// body's epilog geometry and common-vars flag because the epilog table is
    /// per method.
    ///
    /// Returns the header and the total encoded size including every nested
    /// funclet header, which is where the epilog table starts.
    ///
    /// ## Errors
    ///
    /// `DecodeTruncated` if the encoding runs past `data`; `MalformedGcInfo`
    /// if a field is out of range for its in-memory width.
    pub fn decode(arch: Architecture, data: &[u8], method_offset: u32) -> Result<(Self, usize)>
    {
        let mut reader = VarIntReader::new(data);
        let header = Self::decode_from(arch, &mut reader, method_offset)?;
        Ok((header, reader.position()))
    }

    fn decode_from(arch: Architecture, reader: &mut VarIntReader<'_>, method_offset: u32) -> Result<Self>
    {
        let ptr = arch.pointer_size() as u32;
        let mut header = Self::new(arch);

        let first = reader.read_u16()?;
        let prolog_units = u32::from(first & 0x3f);
        header.has_funclets = first & 0x40 != 0;
        let epilog_units = u32::from((first >> 7) & 0x3f);
        let epilog_count_small = ((first >> 13) & 3) as u8;
        let has_extra_data = first & 0x8000 != 0;

        let (prolog_size, fixed_epilog_size) = if arch == Architecture::Arm64 {
            (prolog_units << 2, epilog_units << 2)
        } else {
            (prolog_units, epilog_units)
        };
        header.prolog_size = prolog_size;
        header.fixed_epilog_size = fixed_epilog_size;

        let second = reader.read_u16()?;
        let [b2, b3] = second.to_le_bytes();
        header.return_kind = ReturnKind::from_bits(b2);
        header.has_frame_pointer = b2 & 0x04 != 0;
        header.epilog_at_end = b2 & 0x08 != 0;

        let has_frame_size;
        let mut x64_small = 0u8;
        let mut has_xmm = false;
        let mut x86_arg_low = 0u32;
        let mut x86_arg_large = false;
        let mut x86_has_stack_changes = false;
        let mut parm_or_vfp = false;
        let mut arm64_long_csr = false;

        match arch {
            Architecture::Amd64 => {
                has_frame_size = b2 & 0x10 != 0;
                x64_small = (b2 >> 5) & 3;
                has_xmm = b2 & 0x80 != 0;
                header.saved_regs = u16::from(b3);
            }
            Architecture::X86 => {
                header.saved_regs = u16::from(b2 >> 4);
                x86_arg_low = u32::from(b3 & 0x1f);
                x86_arg_large = b3 & 0x20 != 0;
                x86_has_stack_changes = b3 & 0x40 != 0;
                has_frame_size = b3 & 0x80 != 0;
            }
            Architecture::Arm => {
                has_frame_size = second & 0x10 != 0;
                header.saved_regs = (second >> 5) & 0x1ff;
                parm_or_vfp = second & 0x4000 != 0;
            }
            Architecture::Arm64 => {
                has_frame_size = second & 0x10 != 0;
                arm64_long_csr = second & 0x20 != 0;
                parm_or_vfp = second & 0x40 != 0;
                header.saved_regs = second >> 7;
            }
        }

        if has_frame_size {
            header.frame_size = scaled(reader.read_unsigned()?, ptr, "frame size")?;
        }

        if header.return_kind == ReturnKind::ToNative {
            let encoded = reader.read_unsigned()?;
            header.reverse_pinvoke_offset = decode_reverse_pinvoke_offset(arch, encoded)?;
        }

        match arch {
            Architecture::Amd64 => {
                header.x64_frame_ptr_offset = if x64_small == 3 {
                    let value = reader.read_unsigned()?;
                    if value > 0xff {
                        return Err(WalkError::MalformedGcInfo(format!("frame pointer offset {value} out of range")));
                    }
                    value
                } else {
                    u32::from(x64_small) + 3
                };
                if has_xmm {
                    let encoded = reader.read_unsigned()?;
                    if encoded & !0x3ff != 0 {
                        return Err(WalkError::MalformedGcInfo(format!("saved xmm mask 0x{encoded:x} out of range")));
                    }
                    header.saved_xmm_mask = (encoded << 6) as u16;
                }
            }
            Architecture::X86 => {
                let high = if x86_arg_large { u32::from(reader.read_u8()?) } else { 0 };
                header.return_pop_size = ((high << 5) | x86_arg_low) * ptr;
                if x86_has_stack_changes {
                    header.stack_changes = stack_changes::decode(reader)?;
                }
            }
            Architecture::Arm => {
                if parm_or_vfp {
                    let encoded = reader.read_unsigned()?;
                    header.parm_regs_pushed = (encoded & 0x0f) as u8;
                    header.vfp_pushed_count = (encoded >> 4) as u8;
                    header.vfp_first_pushed = match encoded >> 12 {
                        0 => 8,
                        first => (first - 1) as u8,
                    };
                }
            }
            Architecture::Arm64 => {
                if arm64_long_csr {
                    header.saved_regs |= u16::from(reader.read_u8()?) << ARM64_PRESERVED_REGS_LOW;
                }
                if parm_or_vfp {
                    let encoded = reader.read_unsigned()?;
                    header.vfp_pushed_mask = encoded as u8;
                    header.parm_regs_pushed = (encoded >> 8) as u8;
                }
            }
        }

        if has_extra_data {
            let extra = reader.read_unsigned()?;
            if extra > 0xff {
                return Err(WalkError::MalformedGcInfo(format!("extra data 0x{extra:x} out of range")));
            }
            if arch == Architecture::Arm64 {
                header.fplr_on_top = extra & 0x01 != 0;
                header.reg1_return_kind = ReturnKind::from_bits((extra >> 1) as u8);
                header.gs_cookie_offset = (extra & 0x08 != 0).then_some(0);
                header.has_common_vars = extra & 0x10 != 0;
            } else {
                header.log_stack_alignment = (extra & 0x0f) as u8;
                header.gs_cookie_offset = (extra & 0x10 != 0).then_some(0);
                header.has_common_vars = extra & 0x20 != 0;
            }
        }

        if header.has_dynamic_alignment() {
            header.param_pointer_reg = Some(reader.read_unsigned()? as u8);
        }

        if header.gs_cookie_offset.is_some() {
            header.gs_cookie_offset = Some(scaled(reader.read_unsigned()?, ptr, "GS cookie offset")?);
        }

        header.epilog_count = if epilog_count_small < EPILOG_COUNT_SMALL_MAX {
            u32::from(epilog_count_small)
        } else {
            reader.read_unsigned()?
        };

        if header.has_funclets {
            header.select_funclet(reader, method_offset)?;
        }

        Ok(header)
    }

    /// Walk the funclet table, decoding every nested header so the reader
    /// ends past them, and adopt the one covering `method_offset`.
    fn select_funclet(&mut self, reader: &mut VarIntReader<'_>, method_offset: u32) -> Result<()>
    {
        let count = reader.read_unsigned()?;
        if count as usize > reader.remaining().len() {
            return Err(WalkError::MalformedGcInfo(format!("funclet count {count} exceeds encoding")));
        }

        let mut selected: Option<(u32, u32)> = None;
        let mut previous_start = 0u32;
        for index in 0..count {
            let start = previous_start.wrapping_add(reader.read_unsigned()?);
            if selected.is_none() && method_offset < start {
                if index > 0 {
                    selected = Some((index - 1, previous_start));
                } else {
                    // The main body covers the offset; mark the search as done.
                    selected = Some((u32::MAX, 0));
                }
            }
            previous_start = start;
        }
        if selected.is_none() && count > 0 {
            selected = Some((count - 1, previous_start));
        }

        let main_epilog_at_end = self.epilog_at_end;
        let main_epilog_count = self.epilog_count;
        let main_fixed_epilog_size = self.fixed_epilog_size;
        let main_common_vars = self.has_common_vars;

        for index in 0..count {
            let nested = Self::decode_from(self.arch, reader, method_offset)?;
            if let Some((wanted, funclet_start)) = selected {
                if wanted == index {
                    *self = nested;
                    self.has_funclets = true;
                    self.funclet_offset = funclet_start;
                }
            }
        }

        self.epilog_at_end = main_epilog_at_end;
        self.epilog_count = main_epilog_count;
        self.fixed_epilog_size = main_fixed_epilog_size;
        self.has_common_vars = main_common_vars;
        Ok(())
    }

    /// Append the encoding of this header (without funclets) to `out`.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if a field does not fit its encoded width.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()>
    {
        self.encode_with_funclets(&[], out)
    }

    /// Append the encoding of this header followed by a funclet table.
    ///
    /// `funclets` lists `(start offset, header)` pairs in ascending order.
    pub fn encode_with_funclets(&self, funclets: &[(u32, GcInfoHeader)], out: &mut Vec<u8>) -> Result<()>
    {
        let arch = self.arch;
        let ptr = arch.pointer_size() as u32;

        let (prolog_units, epilog_units) = if arch == Architecture::Arm64 {
            (self.prolog_size >> 2, self.fixed_epilog_size >> 2)
        } else {
            (self.prolog_size, self.fixed_epilog_size)
        };
        check_width(prolog_units, 0x3f, "prolog size")?;
        check_width(epilog_units, 0x3f, "fixed epilog size")?;

        let extra = self.extra_data_byte();
        let epilog_count_small = self.epilog_count.min(u32::from(EPILOG_COUNT_SMALL_MAX)) as u16;

        let mut first = prolog_units as u16;
        if !funclets.is_empty() {
            first |= 0x40;
        }
        first |= (epilog_units as u16) << 7;
        first |= epilog_count_small << 13;
        if extra != 0 {
            first |= 0x8000;
        }
        out.extend_from_slice(&first.to_le_bytes());

        let has_frame_size = self.frame_size != 0;
        let rk = u16::from(self.return_kind.bits());
        let mut second = rk;
        if self.has_frame_pointer {
            second |= 0x04;
        }
        if self.epilog_at_end {
            second |= 0x08;
        }

        let x64_small = match self.x64_frame_ptr_offset {
            3..=5 => (self.x64_frame_ptr_offset - 3) as u16,
            _ => 3,
        };
        let x86_args = self.return_pop_size / ptr;
        let parm_or_vfp = match arch {
            Architecture::Arm => self.parm_regs_pushed != 0 || self.vfp_pushed_count != 0,
            Architecture::Arm64 => self.parm_regs_pushed != 0 || self.vfp_pushed_mask != 0,
            _ => false,
        };
        let arm64_high = self.saved_regs >> ARM64_PRESERVED_REGS_LOW;

        match arch {
            Architecture::Amd64 => {
                if has_frame_size {
                    second |= 0x10;
                }
                second |= x64_small << 5;
                if self.saved_xmm_mask != 0 {
                    second |= 0x80;
                }
                check_width(u32::from(self.saved_regs), 0xff, "saved register mask")?;
                second |= self.saved_regs << 8;
            }
            Architecture::X86 => {
                check_width(u32::from(self.saved_regs), 0x0f, "saved register mask")?;
                check_width(x86_args, 0x1fff, "return pop size")?;
                second |= self.saved_regs << 4;
                second |= ((x86_args & 0x1f) as u16) << 8;
                if x86_args > 0x1f {
                    second |= 0x2000;
                }
                if !self.stack_changes.is_empty() {
                    second |= 0x4000;
                }
                if has_frame_size {
                    second |= 0x8000;
                }
            }
            Architecture::Arm => {
                if has_frame_size {
                    second |= 0x10;
                }
                check_width(u32::from(self.saved_regs), 0x1ff, "saved register mask")?;
                second |= self.saved_regs << 5;
                if parm_or_vfp {
                    second |= 0x4000;
                }
            }
            Architecture::Arm64 => {
                if has_frame_size {
                    second |= 0x10;
                }
                if arm64_high != 0 {
                    second |= 0x20;
                }
                if parm_or_vfp {
                    second |= 0x40;
                }
                second |= (self.saved_regs & 0x1ff) << 7;
            }
        }
        out.extend_from_slice(&second.to_le_bytes());

        if has_frame_size {
            encode_unsigned(self.frame_size / ptr, out);
        }
        if self.return_kind == ReturnKind::ToNative {
            encode_unsigned(encode_reverse_pinvoke_offset(arch, self.reverse_pinvoke_offset), out);
        }

        match arch {
            Architecture::Amd64 => {
                if x64_small == 3 {
                    encode_unsigned(self.x64_frame_ptr_offset, out);
                }
                if self.saved_xmm_mask != 0 {
                    encode_unsigned(u32::from(self.saved_xmm_mask) >> 6, out);
                }
            }
            Architecture::X86 => {
                if x86_args > 0x1f {
                    out.push((x86_args >> 5) as u8);
                }
                if !self.stack_changes.is_empty() {
                    stack_changes::encode(&self.stack_changes, out);
                }
            }
            Architecture::Arm => {
                if parm_or_vfp {
                    let mut encoded = u32::from(self.parm_regs_pushed) | (u32::from(self.vfp_pushed_count) << 4);
                    if self.vfp_first_pushed != 8 {
                        encoded |= (u32::from(self.vfp_first_pushed) + 1) << 12;
                    }
                    encode_unsigned(encoded, out);
                }
            }
            Architecture::Arm64 => {
                if arm64_high != 0 {
                    out.push(arm64_high as u8);
                }
                if parm_or_vfp {
                    encode_unsigned(u32::from(self.vfp_pushed_mask) | (u32::from(self.parm_regs_pushed) << 8), out);
                }
            }
        }

        if extra != 0 {
            encode_unsigned(u32::from(extra), out);
        }
        if self.has_dynamic_alignment() {
            encode_unsigned(u32::from(self.param_pointer_reg.unwrap_or(0)), out);
        }
        if let Some(offset) = self.gs_cookie_offset {
            encode_unsigned(offset / ptr, out);
        }
        if self.epilog_count >= u32::from(EPILOG_COUNT_SMALL_MAX) {
            encode_unsigned(self.epilog_count, out);
        }

        if !funclets.is_empty() {
            encode_unsigned(funclets.len() as u32, out);
            let mut previous = 0u32;
            for (start, _) in funclets {
                encode_unsigned(start.wrapping_sub(previous), out);
                previous = *start;
            }
            for (_, nested) in funclets {
                nested.encode(out)?;
            }
        }
        Ok(())
    }

    fn extra_data_byte(&self) -> u8
    {
        let gs = self.gs_cookie_offset.is_some();
        if self.arch == Architecture::Arm64 {
            u8::from(self.fplr_on_top)
                | (self.reg1_return_kind.bits() << 1)
                | (u8::from(gs) << 3)
                | (u8::from(self.has_common_vars) << 4)
        } else {
            (self.log_stack_alignment & 0x0f) | (u8::from(gs) << 4) | (u8::from(self.has_common_vars) << 5)
        }
    }

    /// Whether the epilogs carry individual sizes in the epilog table
    pub const fn has_varying_epilog_sizes(&self) -> bool
    {
        self.fixed_epilog_size == 0
    }

    pub fn returns_to_native(&self) -> bool
    {
        self.return_kind == ReturnKind::ToNative
    }

    pub const fn is_funclet(&self) -> bool
    {
        self.funclet_offset != 0
    }

    /// x86 two-frame-pointer scheme; never set on ARM64
    pub fn has_dynamic_alignment(&self) -> bool
    {
        self.arch != Architecture::Arm64 && self.log_stack_alignment != 0
    }

    pub fn dynamic_alignment(&self) -> u32
    {
        1u32 << self.log_stack_alignment
    }

    pub fn is_reg_saved(&self, mask: u16) -> bool
    {
        self.saved_regs & mask != 0
    }

    /// Bytes occupied by the pushed callee-saved registers
    pub fn preserved_regs_save_size(&self) -> u32
    {
        self.saved_regs.count_ones() * self.arch.pointer_size() as u32
    }

    /// x64 frame pointer offset measured from SP at the end of the prolog
    pub fn is_frame_pointer_offset_from_sp(&self) -> bool
    {
        self.arch == Architecture::Amd64 && self.x64_frame_ptr_offset != 0
    }

    pub fn frame_pointer_offset_from_sp(&self) -> i64
    {
        i64::from(self.x64_frame_ptr_offset) * 0x10 - X64_SP_SKEW
    }

    /// Distance from the frame pointer down to the saved-register area
    ///
    /// Zero for traditional frames where the frame pointer addresses the
    /// pushed RBP; only x64 SP-relative frames produce a non-zero value.
    pub fn frame_pointer_offset(&self) -> i64
    {
        if !self.is_frame_pointer_offset_from_sp() {
            return 0;
        }
        let ptr = self.arch.pointer_size() as i64;
        let mut save_size = i64::from(self.preserved_regs_save_size());
        if self.is_reg_saved(Amd64SavedRegs::RBP.bits()) {
            save_size -= ptr;
        }
        self.frame_pointer_offset_from_sp() - save_size - i64::from(self.frame_size)
    }

    pub fn reverse_pinvoke_frame_offset(&self) -> i32
    {
        self.reverse_pinvoke_offset
    }

    /// x86 `ret N` operand in bytes
    pub const fn return_pop_size(&self) -> u32
    {
        self.return_pop_size
    }

    pub fn gs_cookie_offset(&self) -> Option<u32>
    {
        self.gs_cookie_offset
    }

    /// ARM: number of r0..r3 pushed in the prolog. ARM64: x0..x7 count.
    pub fn parm_regs_pushed_count(&self) -> u32
    {
        match self.arch {
            Architecture::Arm => u32::from(self.parm_regs_pushed).count_ones(),
            _ => u32::from(self.parm_regs_pushed),
        }
    }

    /// Whether `epilog_offset` lies inside an epilog of `epilog_size` bytes
    pub fn is_valid_epilog_offset(&self, epilog_offset: u32, epilog_size: u32) -> bool
    {
        if self.has_varying_epilog_sizes() {
            epilog_offset < epilog_size
        } else {
            epilog_offset < self.fixed_epilog_size
        }
    }
}

fn scaled(units: u32, ptr: u32, what: &str) -> Result<u32>
{
    units
        .checked_mul(ptr)
        .ok_or_else(|| WalkError::MalformedGcInfo(format!("{what} {units} overflows")))
}

fn check_width(value: u32, max: u32, what: &str) -> Result<()>
{
    if value > max {
        return Err(WalkError::InvalidArgument(format!("{what} 0x{value:x} does not fit its field")));
    }
    Ok(())
}

/// x86 stores the distance below EBP; the other targets store a signed
/// pointer count with the sign in bit 0.
fn decode_reverse_pinvoke_offset(arch: Architecture, encoded: u32) -> Result<i32>
{
    let ptr = arch.pointer_size() as i64;
    let bytes = match arch {
        Architecture::X86 => -(i64::from(encoded) * ptr),
        _ => {
            let magnitude = i64::from(encoded >> 1) * ptr;
            if encoded & 1 == 1 {
                -magnitude
            } else {
                magnitude
            }
        }
    };
    i32::try_from(bytes).map_err(|_| WalkError::MalformedGcInfo(format!("reverse PInvoke offset {bytes} out of range")))
}

fn encode_reverse_pinvoke_offset(arch: Architecture, offset: i32) -> u32
{
    let ptr = arch.pointer_size() as u32;
    let units = offset.unsigned_abs() / ptr;
    match arch {
        Architecture::X86 => units,
        _ => (units << 1) | u32::from(offset < 0),
    }
}
