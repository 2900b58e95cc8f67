//! # Code Managers
//!
//! A code manager owns the metadata of one registered module and answers
//! every per-frame question a stack walk asks: which method contains an IP,
//! how to unwind out of it, which roots are live, which EH clauses protect it
//! and where its return address can be hijacked.
//!
//! Three implementations share the [`CodeManager`] contract:
//!
//! - [`LegacyCodeManager`]: the runtime's own GC encoding with hand-rolled
//!   unwinding and epilog matching.
//! - [`Win64CodeManager`]: PE modules with `RUNTIME_FUNCTION` / `UNWIND_INFO`
//!   tables.
//! - [`DwarfCodeManager`]: ELF and Mach-O modules with `.eh_frame` CFI, the
//!   method info being each FDE's LSDA.
//!
//! ## Method lookup
//!
//! [`CodeManager::find_method_info`] returns a transient [`MethodInfo`] by
//! value. It records the root method start, the body (root or funclet) the IP
//! is in, the decoded GC-info header for that body and the addresses of the
//! epilog table and callsite map. A walker keeps it only for the frame it
//! describes.

pub mod blob;
pub mod coff;
pub mod legacy;
pub mod unix;

use std::fmt;

use bitflags::bitflags;

pub use blob::{CustomUnwindMode, MethodInfoBlob};
pub use coff::{RuntimeFunction, Win64CodeManager};
pub use legacy::{LegacyCodeManager, LegacyMethod, LegacyModuleWriter};
pub use unix::DwarfCodeManager;

use crate::eh::{EhClause, EhEnumState};
use crate::error::{Result, WalkError};
use crate::fault;
use crate::gcinfo::{EpilogTable, GcInfoHeader};
use crate::gcref::{self, CallsiteTables, GcEnumFlags, GcRoot, RootContext};
use crate::hijack::HijackInfo;
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};
use crate::varint::VarIntReader;

/// Which code body of a method an IP is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FuncletKind
{
    /// The main body
    #[default]
    Root,
    /// A catch, finally or fault handler
    Handler,
    /// An exception filter
    Filter,
}

impl FuncletKind
{
    pub const fn from_bits(bits: u8) -> Self
    {
        match bits & MethodFlags::KIND_MASK.bits() {
            0 => FuncletKind::Root,
            2 => FuncletKind::Filter,
            _ => FuncletKind::Handler,
        }
    }

    pub const fn bits(self) -> u8
    {
        match self {
            FuncletKind::Root => 0,
            FuncletKind::Handler => 1,
            FuncletKind::Filter => 2,
        }
    }

    pub const fn name(self) -> &'static str
    {
        match self {
            FuncletKind::Root => "root",
            FuncletKind::Handler => "handler",
            FuncletKind::Filter => "filter",
        }
    }
}

bitflags! {
    /// Flags byte at the start of a method-info blob
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u8 {
        /// Funclet kind, see [`FuncletKind`]
        const KIND_MASK = 0x03;
        const HAS_EHINFO = 0x04;
        const REVERSE_PINVOKE = 0x08;
        const HAS_ASSOCIATED_DATA = 0x10;
        /// ARM64 DWARF modules: a compact or step unwind blob replaces CFI
        const CUSTOM_UNWIND = 0x20;
    }
}

impl MethodFlags
{
    pub fn kind(self) -> FuncletKind
    {
        FuncletKind::from_bits(self.bits())
    }
}

/// Entries of a module's classlib function table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClasslibFunctionId
{
    GetRuntimeException = 0,
    FailFast = 1,
    UnhandledExceptionHandler = 2,
    AppendExceptionStackFrame = 3,
    CheckStaticClassConstruction = 4,
}

impl ClasslibFunctionId
{
    pub const ALL: [ClasslibFunctionId; 5] = [
        ClasslibFunctionId::GetRuntimeException,
        ClasslibFunctionId::FailFast,
        ClasslibFunctionId::UnhandledExceptionHandler,
        ClasslibFunctionId::AppendExceptionStackFrame,
        ClasslibFunctionId::CheckStaticClassConstruction,
    ];

    /// Id for a raw table index; out-of-range indices have no id.
    pub fn from_index(index: u32) -> Option<Self>
    {
        Self::ALL.get(index as usize).copied()
    }

    pub const fn index(self) -> usize
    {
        self as usize
    }
}

/// How the platform unwinder reaches the caller of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindSource
{
    /// GC-info header driven body unwind and epilog matching
    Legacy,
    /// Windows x64 unwind data of the `RUNTIME_FUNCTION` covering the IP
    Win64(RuntimeFunction),
    /// `.eh_frame` CFI located by the IP
    Dwarf,
    /// ARM64 custom unwind blob
    Arm64Custom
    {
        mode: CustomUnwindMode,
        data: Address,
    },
}

/// Which manager implementation a registered module uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeManagerKind
{
    Legacy,
    Win64,
    Dwarf,
}

impl fmt::Display for CodeManagerKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            CodeManagerKind::Legacy => "legacy",
            CodeManagerKind::Win64 => "win64",
            CodeManagerKind::Dwarf => "dwarf",
        };
        f.write_str(name)
    }
}

/// Result of one successful unwind step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindOutcome
{
    /// Saved transition frame of a reverse-PInvoke method. The display is
    /// left untouched: the walk continues from the transition frame.
    pub prev_transition_frame: Option<Address>,
}

/// Per-frame view of one method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo
{
    /// Start of the root method body
    pub method_start: Address,
    /// Start of the body (root or funclet) the IP is in
    pub body_start: Address,
    /// IP offset from `method_start`
    pub code_offset: u32,
    /// Extent of the method from `method_start`
    pub code_size: u32,
    pub kind: FuncletKind,
    /// Flags of the body's own blob
    pub flags: MethodFlags,
    /// Header of the body containing the IP
    pub header: GcInfoHeader,
    /// Start of the root method's GC info
    pub gc_info: Address,
    pub epilog_table: Address,
    pub callsite_map: Address,
    /// Method-info blob of the body, when the module has per-body blobs
    pub blob: Option<Address>,
    /// Root blob of a funclet
    pub parent_blob: Option<Address>,
    pub eh_info: Option<Address>,
    pub associated_data: Option<Address>,
    pub unwind: UnwindSource,
    /// The frame stopped at a hardware fault
    pub execution_aborted: bool,
}

impl MethodInfo
{
    pub fn is_funclet(&self) -> bool
    {
        self.kind != FuncletKind::Root
    }

    pub fn is_filter(&self) -> bool
    {
        self.kind == FuncletKind::Filter
    }

    pub fn is_reverse_pinvoke(&self) -> bool
    {
        self.flags.contains(MethodFlags::REVERSE_PINVOKE) || self.header.returns_to_native()
    }

    /// Offset of the IP from the start of its own body
    pub fn body_offset(&self) -> u32
    {
        self.code_offset.saturating_sub(self.header.funclet_offset)
    }

    /// Whether the IP is still inside the body's prolog
    pub fn in_prolog(&self) -> bool
    {
        self.body_offset() < self.header.prolog_size
    }

    /// Epilog table of the method.
    pub fn epilogs(&self, image: &ModuleImage) -> Result<EpilogTable>
    {
        let bytes = image
            .bytes_from(self.epilog_table)
            .ok_or(WalkError::MemoryRead { address: self.epilog_table })?;
        EpilogTable::decode(&self.header, self.code_size, &mut VarIntReader::new(bytes))
    }

    /// Callsite map bytes through the end of their section.
    pub fn callsite_map<'a>(&self, image: &'a ModuleImage) -> Result<&'a [u8]>
    {
        image
            .bytes_from(self.callsite_map)
            .ok_or(WalkError::MemoryRead { address: self.callsite_map })
    }
}

/// GC info located for one method body
pub(crate) struct GcInfoLayout
{
    pub header: GcInfoHeader,
    pub epilog_table: Address,
    pub callsite_map: Address,
}

/// Decode the header at `gc_info` for `code_offset` and locate the tables after it.
pub(crate) fn locate_gc_info(image: &ModuleImage, gc_info: Address, code_offset: u32, code_size: u32) -> Result<GcInfoLayout>
{
    let bytes = image.bytes_from(gc_info).ok_or(WalkError::MemoryRead { address: gc_info })?;
    let (header, header_size) = GcInfoHeader::decode(image.arch(), bytes, code_offset)?;

    let mut reader = VarIntReader::at(bytes, header_size);
    EpilogTable::decode(&header, code_size, &mut reader)?;

    Ok(GcInfoLayout {
        epilog_table: gc_info.saturating_add(header_size as u64),
        callsite_map: gc_info.saturating_add(reader.position() as u64),
        header,
    })
}

/// Saved transition frame of a reverse-PInvoke method of a PE or DWARF module
///
/// The frame slot is addressed from the frame pointer, or from SP when the
/// method has none.
pub(crate) fn platform_reverse_pinvoke_frame(
    info: &MethodInfo,
    display: &RegDisplay,
    memory: &dyn MemoryAccess,
) -> Result<Address>
{
    let base = if info.header.has_frame_pointer {
        display.frame_pointer(memory)?
    } else {
        display.sp
    };
    let slot = base.offset(i64::from(info.header.reverse_pinvoke_frame_offset()));
    memory.read_address(display.arch(), slot)
}

/// Per-module metadata answering the walker's per-frame questions
pub trait CodeManager: Send + Sync + fmt::Debug
{
    fn kind(&self) -> CodeManagerKind;

    /// Sections of the module this manager reads
    fn image(&self) -> &ModuleImage;

    /// Registered managed code range
    fn code_range(&self) -> (Address, u64);

    /// Module-global delta shortcuts and callsite strings
    fn gc_tables(&self) -> CallsiteTables<'_>;

    fn classlib_functions(&self) -> &[Address];

    /// Resolve the method containing `ip`.
    ///
    /// ## Errors
    ///
    /// `MethodNotFound` when `ip` is outside this module's managed code.
    fn find_method_info(&self, ip: Address) -> Result<MethodInfo>;

    /// Move `display` to the caller of the frame described by `info`.
    ///
    /// On success the display's slots point at the caller's save locations
    /// and `p_ip` at the return address cell. A display IP of zero afterwards
    /// means the walk reached the end of the stack.
    fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        display: &mut RegDisplay,
        memory: &dyn MemoryAccess,
    ) -> Result<UnwindOutcome>;

    /// Locate the return address cell of the frame and the GC class of its
    /// return value. `None` when the frame must not be hijacked.
    fn get_return_address_hijack_info(
        &self,
        info: &MethodInfo,
        display: &RegDisplay,
        memory: &dyn MemoryAccess,
    ) -> Result<Option<HijackInfo>>;

    /// Start enumerating the EH clauses of the root method; `None` without EH info.
    fn eh_enum_init(&self, info: &MethodInfo) -> Result<Option<EhEnumState>>;

    fn architecture(&self) -> Architecture
    {
        self.image().arch()
    }

    fn module_base(&self) -> Address
    {
        self.image().base()
    }

    fn contains(&self, ip: Address) -> bool
    {
        let (start, size) = self.code_range();
        ip.value() >= start.value() && (ip.distance_from(start) as u64) < size
    }

    fn is_funclet(&self, info: &MethodInfo) -> bool
    {
        info.is_funclet()
    }

    fn is_filter(&self, info: &MethodInfo) -> bool
    {
        info.is_filter()
    }

    /// Frame pointer of methods that establish one and of funclets; `None` otherwise.
    fn get_frame_pointer(&self, info: &MethodInfo, display: &RegDisplay, memory: &dyn MemoryAccess) -> Option<Address>
    {
        if info.header.has_frame_pointer || info.is_funclet() {
            display.frame_pointer(memory).ok()
        } else {
            None
        }
    }

    /// Report the roots live at `safe_point` in the frame described by `display`.
    fn enum_gc_refs(
        &self,
        info: &MethodInfo,
        safe_point: Address,
        display: &RegDisplay,
        memory: &dyn MemoryAccess,
        report: &mut dyn FnMut(GcRoot),
    ) -> Result<()>
    {
        let mut flags = GcEnumFlags::empty();
        if info.execution_aborted {
            flags |= GcEnumFlags::EXECUTION_ABORTED;
        }
        if self.is_filter(info) {
            flags |= GcEnumFlags::NO_REPORT_UNTRACKED;
        }

        let code_address = Address::new(self.architecture().code_address(safe_point.value()));
        let code_offset = u32::try_from(code_address.distance_from(info.method_start))
            .map_err(|_| WalkError::InvalidArgument(format!("safe point {safe_point} is not in its method")))?;

        let ctx = RootContext {
            header: &info.header,
            display,
            memory,
        };
        gcref::enum_gc_refs(&ctx, info.callsite_map(self.image())?, self.gc_tables(), code_offset, flags, report)
    }

    /// Mark the frame as stopped at a hardware fault; returns the IP to use as its safe point.
    fn remap_hardware_fault_to_gc_safe_point(&self, info: &mut MethodInfo, ip: Address) -> Address
    {
        fault::mark_execution_aborted(info, ip)
    }

    fn eh_enum_next(&self, state: &mut EhEnumState) -> Result<Option<EhClause>>
    {
        state.next(self.image())
    }

    fn get_method_start_address(&self, info: &MethodInfo) -> Address
    {
        info.method_start
    }

    /// Entry of the module's classlib table; `None` for out-of-range or null entries.
    fn get_classlib_function(&self, id: ClasslibFunctionId) -> Option<Address>
    {
        self.classlib_functions()
            .get(id.index())
            .copied()
            .filter(|function| !function.is_null())
    }

    /// Associated data of the body containing `ip`.
    fn get_associated_data(&self, ip: Address) -> Option<Address>
    {
        self.find_method_info(ip).ok().and_then(|info| info.associated_data)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_funclet_kind_bits()
    {
        assert_eq!(FuncletKind::from_bits(0x05), FuncletKind::Handler);
        assert_eq!(FuncletKind::from_bits(0x0a), FuncletKind::Filter);
        assert_eq!(MethodFlags::from_bits_truncate(0x0c).kind(), FuncletKind::Root);
        assert_eq!(FuncletKind::Filter.bits(), 2);
    }

    #[test]
    fn test_classlib_ids()
    {
        assert_eq!(ClasslibFunctionId::from_index(4), Some(ClasslibFunctionId::CheckStaticClassConstruction));
        assert_eq!(ClasslibFunctionId::from_index(5), None);
        assert_eq!(ClasslibFunctionId::FailFast.index(), 1);
    }

    #[test]
    fn test_body_offset_in_funclet()
    {
        let header = GcInfoHeader {
            prolog_size: 4,
            funclet_offset: 0x40,
            ..GcInfoHeader::new(Architecture::Amd64)
        };
        let info = MethodInfo {
            method_start: Address::new(0x1000),
            body_start: Address::new(0x1040),
            code_offset: 0x42,
            code_size: 0x80,
            kind: FuncletKind::Handler,
            flags: MethodFlags::from_bits_truncate(1),
            header,
            gc_info: Address::ZERO,
            epilog_table: Address::ZERO,
            callsite_map: Address::ZERO,
            blob: None,
            parent_blob: None,
            eh_info: None,
            associated_data: None,
            unwind: UnwindSource::Legacy,
            execution_aborted: false,
        };
        assert_eq!(info.body_offset(), 2);
        assert!(info.in_prolog());
        assert!(info.is_funclet());
        assert!(!info.is_filter());
    }
}
