//! Code manager for PE modules.
//!
//! Every managed code body has a `RUNTIME_FUNCTION` in `.pdata`. Its unwind
//! info is followed directly by the body's method-info blob, so finding the
//! blob for an IP is a table search plus the size of the unwind data.

use tracing::{debug, trace};

use super::blob::{self, MethodInfoBlob, GC_STRINGS_SECTION};
use super::{
    platform_reverse_pinvoke_frame, CodeManager, CodeManagerKind, FuncletKind, MethodInfo, UnwindOutcome,
    UnwindSource,
};
use crate::eh::{EhEnumState, TypeReference};
use crate::error::{Result, WalkError};
use crate::gcref::{CallsiteTables, DeltaShortcuts};
use crate::hijack::{self, HijackInfo};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};
use crate::unwind::win64::{self, UnwindInfo};

pub use crate::unwind::win64::RuntimeFunction;

/// Function tables at most this long are scanned linearly
const LINEAR_SEARCH_LIMIT: usize = 10;

/// Windows x64 module
#[derive(Debug)]
pub struct Win64CodeManager
{
    image: ModuleImage,
    code_range: (Address, u64),
    functions: Vec<RuntimeFunction>,
    shortcuts: DeltaShortcuts,
    strings: Vec<u8>,
    classlib: Vec<Address>,
}

impl Win64CodeManager
{
    /// Manager for a PE image with `.text`, `.pdata` and `.gcstrings`.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` for a non-x64 image, `Object` when a required
    /// section is missing, `MalformedGcInfo` for a short `.gcstrings`.
    pub fn new(image: ModuleImage, classlib: Vec<Address>) -> Result<Self>
    {
        if image.arch() != Architecture::Amd64 {
            return Err(WalkError::InvalidArgument(format!(
                "PE unwind tables are only supported for x64, not {}",
                image.arch()
            )));
        }
        let code_range = image
            .code_range()
            .ok_or_else(|| WalkError::Object("module has no .text section".to_string()))?;
        let pdata = image
            .section(".pdata")
            .ok_or_else(|| WalkError::Object("module has no .pdata section".to_string()))?;
        let functions: Vec<RuntimeFunction> = pdata
            .data
            .chunks_exact(RuntimeFunction::SIZE)
            .filter_map(RuntimeFunction::parse)
            .collect();
        let (shortcuts, strings) = blob::read_gc_strings(&image)?;

        debug!(
            base = %image.base(),
            functions = functions.len(),
            code_start = %code_range.0,
            code_size = code_range.1,
            "created x64 code manager"
        );
        Ok(Self {
            image,
            code_range,
            functions,
            shortcuts,
            strings,
            classlib,
        })
    }

    /// Restrict the managed range to part of `.text`.
    #[must_use]
    pub fn with_code_range(mut self, start: Address, size: u64) -> Self
    {
        self.code_range = (start, size);
        self
    }

    pub fn functions(&self) -> &[RuntimeFunction]
    {
        &self.functions
    }

    /// Index of the function containing `rva`.
    ///
    /// Binary search narrows the table to a handful of entries, then a
    /// linear scan finds the last function starting at or before `rva`.
    pub fn lookup_function(&self, rva: u32) -> Option<usize>
    {
        let functions = &self.functions;
        if functions.is_empty() {
            return None;
        }

        let mut low = 0usize;
        let mut high = functions.len() - 1;
        while high - low > LINEAR_SEARCH_LIMIT {
            let middle = low + (high - low) / 2;
            if rva < functions[middle].begin {
                high = middle - 1;
            } else {
                low = middle;
            }
        }

        for index in low..high {
            if rva < functions[index + 1].begin {
                high = index;
                break;
            }
        }

        (rva >= functions[high].begin).then_some(high)
    }

    /// Method-info blob that follows the unwind info of `function`
    fn blob_address(&self, function: &RuntimeFunction) -> Result<Address>
    {
        let info = win64::unwind_info(&self.image, function)?;
        Ok(self.image.rva(function.unwind_data).saturating_add(info.size() as u64))
    }

    fn function_length(&self, rva: u32) -> Option<u32>
    {
        let function = self.functions.get(self.lookup_function(rva)?)?;
        Some(function.end.saturating_sub(function.begin))
    }
}

impl CodeManager for Win64CodeManager
{
    fn kind(&self) -> CodeManagerKind
    {
        CodeManagerKind::Win64
    }

    fn image(&self) -> &ModuleImage
    {
        &self.image
    }

    fn code_range(&self) -> (Address, u64)
    {
        self.code_range
    }

    fn gc_tables(&self) -> CallsiteTables<'_>
    {
        CallsiteTables {
            shortcuts: &self.shortcuts,
            strings: &self.strings,
        }
    }

    fn classlib_functions(&self) -> &[Address]
    {
        &self.classlib
    }

    fn find_method_info(&self, ip: Address) -> Result<MethodInfo>
    {
        if !self.contains(ip) {
            return Err(WalkError::MethodNotFound { ip });
        }
        let rva = u32::try_from(ip.distance_from(self.image.base())).map_err(|_| WalkError::MethodNotFound { ip })?;
        let function = self
            .lookup_function(rva)
            .and_then(|index| self.functions.get(index))
            .copied()
            .ok_or(WalkError::MethodNotFound { ip })?;

        let blob_address = self.blob_address(&function)?;
        let resolved = blob::resolve(&self.image, blob_address, self.image.rva(function.begin))?;

        let root_rva = u32::try_from(resolved.method_start.distance_from(self.image.base()))
            .map_err(|_| WalkError::MalformedGcInfo(format!("method start {} is outside the module", resolved.method_start)))?;
        let code_size = self
            .function_length(root_rva)
            .ok_or_else(|| WalkError::MalformedGcInfo(format!("no function at method start {}", resolved.method_start)))?;

        trace!(ip = %ip, begin = function.begin, end = function.end, kind = resolved.body.kind().name(), "x64 method lookup");
        blob::build_method_info(&self.image, ip, &resolved, code_size, UnwindSource::Win64(function))
    }

    fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        display: &mut RegDisplay,
        memory: &dyn MemoryAccess,
    ) -> Result<UnwindOutcome>
    {
        if info.is_reverse_pinvoke() {
            let prev = platform_reverse_pinvoke_frame(info, display, memory)?;
            debug!(prev = %prev, "reverse pinvoke frame");
            return Ok(UnwindOutcome {
                prev_transition_frame: Some(prev),
            });
        }

        let UnwindSource::Win64(function) = info.unwind else {
            return Err(WalkError::InvalidArgument(format!(
                "method at {} has no x64 unwind data",
                info.method_start
            )));
        };
        win64::unwind_stack_frame(&self.image, &function, display, memory)?;
        Ok(UnwindOutcome::default())
    }

    fn get_return_address_hijack_info(
        &self,
        info: &MethodInfo,
        display: &RegDisplay,
        memory: &dyn MemoryAccess,
    ) -> Result<Option<HijackInfo>>
    {
        hijack::unwound_hijack_info(self, info, display, memory)
    }

    fn eh_enum_init(&self, info: &MethodInfo) -> Result<Option<EhEnumState>>
    {
        let types = TypeReference::ModuleRva {
            module_base: self.image.base(),
        };
        info.eh_info
            .map(|eh_info| EhEnumState::new(&self.image, info.method_start, eh_info, types))
            .transpose()
    }
}

/// Builds x64 PE images in memory.
///
/// Functions are laid out back to back in `.text`; each function's unwind
/// info and method-info blob go to `.xdata`, 4-byte aligned. EH tables and
/// associated data can be appended to `.xdata` as well.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::codeman::coff::Win64ModuleWriter;
/// use stackroots_core::codeman::{CodeManager, MethodInfoBlob, Win64CodeManager};
/// use stackroots_core::gcinfo::GcInfoHeader;
/// use stackroots_core::gcref::DeltaShortcuts;
/// use stackroots_core::types::{Address, Architecture};
/// use stackroots_core::unwind::{UnwindCode, UnwindInfo, UnwindOp};
///
/// let mut gc_info = Vec::new();
/// GcInfoHeader { prolog_size: 1, ..GcInfoHeader::new(Architecture::Amd64) }.encode(&mut gc_info)?;
/// gc_info.push(0xff);
///
/// let unwind = UnwindInfo::new(1, vec![UnwindCode { prolog_offset: 1, op: UnwindOp::PushNonvol { reg: 3 } }]);
/// let mut writer = Win64ModuleWriter::new(0x1000, 0x4000);
/// writer.add_root(&[0x53, 0x90, 0x5b, 0xc3], &unwind, MethodInfoBlob::root(), &gc_info);
///
/// let base = Address::new(0x1_4000_0000);
/// let image = writer.build(base, &DeltaShortcuts::default(), &[]);
/// let manager = Win64CodeManager::new(image, Vec::new())?;
/// let info = manager.find_method_info(base + 0x1001)?;
/// assert_eq!(info.method_start, base + 0x1000);
/// assert_eq!(info.code_offset, 1);
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Win64ModuleWriter
{
    text_rva: u32,
    xdata_rva: u32,
    text: Vec<u8>,
    xdata: Vec<u8>,
    functions: Vec<RuntimeFunction>,
    blobs: Vec<u32>,
}

impl Win64ModuleWriter
{
    pub fn new(text_rva: u32, xdata_rva: u32) -> Self
    {
        Self {
            text_rva,
            xdata_rva,
            ..Self::default()
        }
    }

    fn append_function(&mut self, code: &[u8], unwind: &UnwindInfo, blob: &MethodInfoBlob, gc_info: &[u8]) -> usize
    {
        let begin = self.text_rva + self.text.len() as u32;
        self.text.extend_from_slice(code);

        self.align_xdata(4);
        let unwind_data = self.xdata_rva + self.xdata.len() as u32;
        unwind.encode(&mut self.xdata);
        self.blobs.push(self.xdata_rva + self.xdata.len() as u32);
        blob.encode(&mut self.xdata);
        self.xdata.extend_from_slice(gc_info);

        self.functions.push(RuntimeFunction {
            begin,
            end: begin + code.len() as u32,
            unwind_data,
        });
        self.functions.len() - 1
    }

    /// Append a root method. `gc_info` is its GC header, epilog table and
    /// callsite map. Returns the function index.
    pub fn add_root(&mut self, code: &[u8], unwind: &UnwindInfo, blob: MethodInfoBlob, gc_info: &[u8]) -> usize
    {
        self.append_function(code, unwind, &blob, gc_info)
    }

    /// Append a funclet of the root method at index `parent`.
    pub fn add_funclet(&mut self, parent: usize, kind: FuncletKind, code: &[u8], unwind: &UnwindInfo) -> usize
    {
        let begin = self.text_rva + self.text.len() as u32;
        let parent_begin = self.functions.get(parent).map_or(begin, |function| function.begin);
        let parent_blob = self.blobs.get(parent).copied().unwrap_or_default();

        // The blob lands after the aligned unwind info; compute its RVA first.
        let unwind_data = (self.xdata_rva + self.xdata.len() as u32).next_multiple_of(4);
        let blob_rva = unwind_data + unwind.size() as u32;
        let blob = MethodInfoBlob::funclet(
            kind,
            parent_blob.wrapping_sub(blob_rva) as i32,
            parent_begin.wrapping_sub(begin) as i32,
        );
        self.append_function(code, unwind, &blob, &[])
    }

    /// Append data to `.xdata` and return its RVA.
    pub fn add_data(&mut self, data: &[u8]) -> u32
    {
        self.align_xdata(4);
        let rva = self.xdata_rva + self.xdata.len() as u32;
        self.xdata.extend_from_slice(data);
        rva
    }

    pub fn function(&self, index: usize) -> Option<RuntimeFunction>
    {
        self.functions.get(index).copied()
    }

    pub fn blob_rva(&self, index: usize) -> Option<u32>
    {
        self.blobs.get(index).copied()
    }

    fn align_xdata(&mut self, alignment: usize)
    {
        let padded = (self.xdata_rva as usize + self.xdata.len()).next_multiple_of(alignment) - self.xdata_rva as usize;
        self.xdata.resize(padded, 0);
    }

    /// Lay out `.text`, `.xdata`, `.pdata` and `.gcstrings` at `base`.
    pub fn build(self, base: Address, shortcuts: &DeltaShortcuts, strings: &[u8]) -> ModuleImage
    {
        let mut pdata = Vec::with_capacity(self.functions.len() * RuntimeFunction::SIZE);
        for function in &self.functions {
            function.encode(&mut pdata);
        }

        let xdata_end = u64::from(self.xdata_rva) + self.xdata.len() as u64;
        let pdata_rva = xdata_end.next_multiple_of(0x10);
        let strings_rva = (pdata_rva + pdata.len() as u64).next_multiple_of(0x10);

        ModuleImage::new(Architecture::Amd64, base)
            .with_section(".text", base + u64::from(self.text_rva), self.text)
            .with_section(".xdata", base + u64::from(self.xdata_rva), self.xdata)
            .with_section(".pdata", base + pdata_rva, pdata)
            .with_section(GC_STRINGS_SECTION, base + strings_rva, blob::encode_gc_strings(shortcuts, strings))
    }
}
