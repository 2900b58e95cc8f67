//! Code manager for modules in the runtime's own GC-info format.
//!
//! These modules carry no platform unwind data. All method metadata is in
//! one `.gcinfo` section:
//!
//! ```text
//! u32 method_count
//! u32 shortcuts_offset        16-byte delta shortcut table
//! u32 strings_offset          callsite strings, through the section end
//! u32 types_offset            pointer-sized EH type table
//! u32 type_count
//! method_count entries, ascending by code offset
//!   u32 code_offset           from the start of .text
//!   u32 code_size
//!   u32 gc_info_offset        header, epilog table and callsite map
//!   u32 eh_info_offset        0xffffffff without EH
//! ```
//!
//! Offsets other than `code_offset` are relative to the section start.
//! Funclets are part of their method's code and are found through the
//! funclet table of the method's GC-info header.

use tracing::{debug, trace};

use super::{locate_gc_info, CodeManager, CodeManagerKind, FuncletKind, MethodFlags, MethodInfo, UnwindOutcome, UnwindSource};
use crate::eh::{encode_clause, EhClause, EhEnumState, TypeReference};
use crate::error::{Result, WalkError};
use crate::gcinfo::{EpilogInfo, EpilogTable, GcInfoHeader};
use crate::gcref::callsite::{self, CallsiteEntry};
use crate::gcref::{CallsiteTables, DeltaShortcuts};
use crate::hijack::{self, HijackInfo};
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::regdisplay::RegDisplay;
use crate::types::{Address, Architecture};
use crate::unwind::legacy;
use crate::varint::encode_unsigned;

/// Section holding the method table and GC info of a legacy module
pub const GC_INFO_SECTION: &str = ".gcinfo";

const HEADER_SIZE: usize = 20;
const ENTRY_SIZE: usize = 16;
const NO_EH_INFO: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MethodEntry
{
    code_offset: u32,
    code_size: u32,
    gc_info_offset: u32,
    eh_info_offset: u32,
}

/// Module in the legacy format
#[derive(Debug)]
pub struct LegacyCodeManager
{
    image: ModuleImage,
    code_range: (Address, u64),
    text: Address,
    gc_section: Address,
    entries: Vec<MethodEntry>,
    shortcuts: DeltaShortcuts,
    strings: Vec<u8>,
    types: Address,
    classlib: Vec<Address>,
    verify_epilogs: bool,
}

fn read_u32_at(data: &[u8], offset: usize) -> Result<u32>
{
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(WalkError::DecodeTruncated { offset })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl LegacyCodeManager
{
    /// Manager for an image with `.text` and `.gcinfo`.
    ///
    /// ## Errors
    ///
    /// `Object` when a section is missing, `DecodeTruncated` or
    /// `MalformedGcInfo` for a damaged method table.
    pub fn new(image: ModuleImage, classlib: Vec<Address>) -> Result<Self>
    {
        let code_range = image
            .code_range()
            .ok_or_else(|| WalkError::Object("module has no .text section".to_string()))?;
        let section = image
            .section(GC_INFO_SECTION)
            .ok_or_else(|| WalkError::Object(format!("module has no {GC_INFO_SECTION} section")))?;
        let data = &section.data;

        let method_count = read_u32_at(data, 0)? as usize;
        let shortcuts_offset = read_u32_at(data, 4)? as usize;
        let strings_offset = read_u32_at(data, 8)? as usize;
        let types_offset = read_u32_at(data, 12)?;

        let mut entries = Vec::with_capacity(method_count);
        for index in 0..method_count {
            let at = HEADER_SIZE + index * ENTRY_SIZE;
            entries.push(MethodEntry {
                code_offset: read_u32_at(data, at)?,
                code_size: read_u32_at(data, at + 4)?,
                gc_info_offset: read_u32_at(data, at + 8)?,
                eh_info_offset: read_u32_at(data, at + 12)?,
            });
        }
        let overlapping = entries
            .windows(2)
            .any(|pair| pair[0].code_offset.saturating_add(pair[0].code_size) > pair[1].code_offset);
        if overlapping {
            return Err(WalkError::MalformedGcInfo("method table entries overlap".to_string()));
        }

        let shortcuts = DeltaShortcuts::from_slice(data.get(shortcuts_offset..).unwrap_or_default())?;
        let strings = data
            .get(strings_offset..)
            .ok_or(WalkError::DecodeTruncated { offset: strings_offset })?
            .to_vec();
        let gc_section = section.address;

        debug!(
            base = %image.base(),
            arch = %image.arch(),
            methods = method_count,
            "created legacy code manager"
        );
        Ok(Self {
            code_range,
            text: code_range.0,
            gc_section,
            entries,
            shortcuts,
            strings,
            types: gc_section.saturating_add(u64::from(types_offset)),
            classlib,
            verify_epilogs: false,
            image,
        })
    }

    /// Restrict the managed range to part of `.text`.
    #[must_use]
    pub fn with_code_range(mut self, start: Address, size: u64) -> Self
    {
        self.code_range = (start, size);
        self
    }

    /// Validate epilog code before replaying it during unwinds.
    #[must_use]
    pub fn with_epilog_verification(mut self, verify: bool) -> Self
    {
        self.verify_epilogs = verify;
        self
    }

    /// Number of methods in the table
    pub fn method_count(&self) -> usize
    {
        self.entries.len()
    }

    /// Start address of every method, in code order
    pub fn method_starts(&self) -> impl Iterator<Item = Address> + '_
    {
        let text = self.text;
        self.entries
            .iter()
            .map(move |entry| text.saturating_add(u64::from(entry.code_offset)))
    }

    fn eh_info(&self, entry: &MethodEntry) -> Option<Address>
    {
        (entry.eh_info_offset != NO_EH_INFO).then(|| self.gc_section.saturating_add(u64::from(entry.eh_info_offset)))
    }

    /// Handler or filter, from the clause that names the funclet
    fn funclet_kind(&self, method_start: Address, eh_info: Option<Address>, funclet_offset: u32) -> Result<FuncletKind>
    {
        let Some(eh_info) = eh_info else {
            return Ok(FuncletKind::Handler);
        };
        let types = TypeReference::TypeTable { table: self.types };
        let clauses = EhEnumState::new(&self.image, method_start, eh_info, types)?.collect_all(&self.image)?;
        let is_filter = clauses
            .iter()
            .any(|clause| clause.filter_offset() == Some(funclet_offset));
        Ok(if is_filter {
            FuncletKind::Filter
        } else {
            FuncletKind::Handler
        })
    }
}

impl CodeManager for LegacyCodeManager
{
    fn kind(&self) -> CodeManagerKind
    {
        CodeManagerKind::Legacy
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
        let text = self.text;
        let code_address = Address::new(self.architecture().code_address(ip.value()));
        let text_offset = u32::try_from(code_address.distance_from(text)).map_err(|_| WalkError::MethodNotFound { ip })?;

        let index = self
            .entries
            .partition_point(|entry| entry.code_offset <= text_offset)
            .checked_sub(1)
            .ok_or(WalkError::MethodNotFound { ip })?;
        let entry = self.entries[index];
        let code_offset = text_offset - entry.code_offset;
        let code_size = entry.code_size;
        // Padding between methods
        if code_offset >= code_size {
            return Err(WalkError::MethodNotFound { ip });
        }

        let method_start = text.saturating_add(u64::from(entry.code_offset));
        let gc_info = self.gc_section.saturating_add(u64::from(entry.gc_info_offset));
        let layout = locate_gc_info(&self.image, gc_info, code_offset, code_size)?;
        let eh_info = self.eh_info(&entry);

        let kind = if layout.header.is_funclet() {
            self.funclet_kind(method_start, eh_info, layout.header.funclet_offset)?
        } else {
            FuncletKind::Root
        };
        let mut flags = MethodFlags::from_bits_truncate(kind.bits());
        flags.set(MethodFlags::HAS_EHINFO, eh_info.is_some());
        flags.set(MethodFlags::REVERSE_PINVOKE, layout.header.returns_to_native());

        trace!(ip = %ip, method = %method_start, code_offset, kind = kind.name(), "legacy method lookup");
        Ok(MethodInfo {
            method_start,
            body_start: method_start.saturating_add(u64::from(layout.header.funclet_offset)),
            code_offset,
            code_size,
            kind,
            flags,
            header: layout.header,
            gc_info,
            epilog_table: layout.epilog_table,
            callsite_map: layout.callsite_map,
            blob: None,
            parent_blob: None,
            eh_info,
            associated_data: None,
            unwind: UnwindSource::Legacy,
            execution_aborted: false,
        })
    }

    fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        display: &mut RegDisplay,
        memory: &dyn MemoryAccess,
    ) -> Result<UnwindOutcome>
    {
        legacy::unwind_stack_frame(&self.image, info, display, memory, self.verify_epilogs)
    }

    fn get_return_address_hijack_info(
        &self,
        info: &MethodInfo,
        display: &RegDisplay,
        memory: &dyn MemoryAccess,
    ) -> Result<Option<HijackInfo>>
    {
        hijack::legacy_hijack_info(&self.image, info, display, memory)
    }

    fn eh_enum_init(&self, info: &MethodInfo) -> Result<Option<EhEnumState>>
    {
        let types = TypeReference::TypeTable { table: self.types };
        info.eh_info
            .map(|eh_info| EhEnumState::new(&self.image, info.method_start, eh_info, types))
            .transpose()
    }
}

/// One method for [`LegacyModuleWriter`]
#[derive(Debug, Clone)]
pub struct LegacyMethod
{
    /// Machine code of the root body followed by its funclets
    pub code: Vec<u8>,
    pub header: GcInfoHeader,
    /// `(start offset, header)` of each funclet, ascending
    pub funclets: Vec<(u32, GcInfoHeader)>,
    pub epilogs: Vec<EpilogInfo>,
    pub callsites: Vec<CallsiteEntry>,
    /// Clauses, inner first, with the type table index of typed clauses
    pub eh_clauses: Vec<(EhClause, u32)>,
}

impl LegacyMethod
{
    pub fn new(header: GcInfoHeader, code: Vec<u8>) -> Self
    {
        Self {
            code,
            header,
            funclets: Vec::new(),
            epilogs: Vec::new(),
            callsites: Vec::new(),
            eh_clauses: Vec::new(),
        }
    }

    fn encode_gc_info(&self, shortcuts: &DeltaShortcuts, out: &mut Vec<u8>) -> Result<()>
    {
        self.header.encode_with_funclets(&self.funclets, out)?;
        EpilogTable::encode(&self.header, &self.epilogs, out);
        callsite::encode(&self.callsites, shortcuts, out);
        Ok(())
    }

    fn encode_eh_info(&self, out: &mut Vec<u8>)
    {
        encode_unsigned(self.eh_clauses.len() as u32, out);
        for (clause, type_index) in &self.eh_clauses {
            let mut type_ref = Vec::new();
            encode_unsigned(*type_index, &mut type_ref);
            encode_clause(clause, &type_ref, out);
        }
    }
}

/// Builds legacy-format images in memory.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::codeman::{CodeManager, LegacyCodeManager, LegacyMethod, LegacyModuleWriter};
/// use stackroots_core::gcinfo::GcInfoHeader;
/// use stackroots_core::gcref::DeltaShortcuts;
/// use stackroots_core::types::{Address, Architecture};
///
/// let header = GcInfoHeader { prolog_size: 1, ..GcInfoHeader::new(Architecture::X86) };
/// let mut writer = LegacyModuleWriter::new(Architecture::X86, DeltaShortcuts::default());
/// let offset = writer.add_method(LegacyMethod::new(header, vec![0x90, 0x90, 0xc3]));
///
/// let base = Address::new(0x40_0000);
/// let manager = LegacyCodeManager::new(writer.build(base)?, Vec::new())?;
/// let info = manager.find_method_info(base + 0x1000 + u64::from(offset) + 2)?;
/// assert_eq!(info.code_offset, 2);
/// assert_eq!(info.code_size, 3);
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LegacyModuleWriter
{
    arch: Architecture,
    shortcuts: DeltaShortcuts,
    strings: Vec<u8>,
    types: Vec<u64>,
    methods: Vec<(u32, LegacyMethod)>,
    code_len: u32,
}

impl LegacyModuleWriter
{
    /// Text section offset of the module's code
    pub const TEXT_RVA: u32 = 0x1000;

    pub fn new(arch: Architecture, shortcuts: DeltaShortcuts) -> Self
    {
        Self {
            arch,
            shortcuts,
            strings: Vec::new(),
            types: Vec::new(),
            methods: Vec::new(),
            code_len: 0,
        }
    }

    /// Append callsite string bytes and return their offset.
    pub fn add_strings(&mut self, strings: &[u8]) -> u32
    {
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(strings);
        offset
    }

    /// Append an EH type table entry and return its index.
    pub fn add_type(&mut self, entry: u64) -> u32
    {
        self.types.push(entry);
        self.types.len() as u32 - 1
    }

    /// Append a method; returns its offset in `.text`. Methods are 16-byte aligned.
    pub fn add_method(&mut self, method: LegacyMethod) -> u32
    {
        let offset = self.code_len.next_multiple_of(16);
        self.code_len = offset + method.code.len() as u32;
        self.methods.push((offset, method));
        offset
    }

    /// Lay out `.text` at `base + 0x1000` and `.gcinfo` after it.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` when a header field does not fit its encoding.
    pub fn build(self, base: Address) -> Result<ModuleImage>
    {
        let mut text = vec![0xcc; self.code_len as usize];
        for (offset, method) in &self.methods {
            let start = *offset as usize;
            text[start..start + method.code.len()].copy_from_slice(&method.code);
        }

        let table_size = HEADER_SIZE + self.methods.len() * ENTRY_SIZE;
        let mut blobs = Vec::new();
        let mut entries = Vec::with_capacity(self.methods.len());
        for (offset, method) in &self.methods {
            let gc_info_offset = (table_size + blobs.len()) as u32;
            method.encode_gc_info(&self.shortcuts, &mut blobs)?;
            let eh_info_offset = if method.eh_clauses.is_empty() {
                NO_EH_INFO
            } else {
                let at = (table_size + blobs.len()) as u32;
                method.encode_eh_info(&mut blobs);
                at
            };
            entries.push(MethodEntry {
                code_offset: *offset,
                code_size: method.code.len() as u32,
                gc_info_offset,
                eh_info_offset,
            });
        }

        let ptr = self.arch.pointer_size() as usize;
        let types_offset = (table_size + blobs.len()).next_multiple_of(ptr);
        let shortcuts_offset = types_offset + self.types.len() * ptr;
        let strings_offset = shortcuts_offset + self.shortcuts.0.len();

        let mut section = Vec::with_capacity(strings_offset + self.strings.len());
        for value in [
            self.methods.len() as u32,
            shortcuts_offset as u32,
            strings_offset as u32,
            types_offset as u32,
            self.types.len() as u32,
        ] {
            section.extend_from_slice(&value.to_le_bytes());
        }
        for entry in &entries {
            section.extend_from_slice(&entry.code_offset.to_le_bytes());
            section.extend_from_slice(&entry.code_size.to_le_bytes());
            section.extend_from_slice(&entry.gc_info_offset.to_le_bytes());
            section.extend_from_slice(&entry.eh_info_offset.to_le_bytes());
        }
        section.extend_from_slice(&blobs);
        section.resize(types_offset, 0);
        for entry in &self.types {
            section.extend_from_slice(&entry.to_le_bytes()[..ptr]);
        }
        section.extend_from_slice(&self.shortcuts.0);
        section.extend_from_slice(&self.strings);

        let text_end = u64::from(Self::TEXT_RVA) + text.len() as u64;
        let gc_rva = text_end.next_multiple_of(0x1000);
        Ok(ModuleImage::new(self.arch, base)
            .with_section(".text", base + u64::from(Self::TEXT_RVA), text)
            .with_section(GC_INFO_SECTION, base + gc_rva, section))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::eh::ClauseHandler;

    fn filter_method() -> LegacyMethod
    {
        let header = GcInfoHeader {
            prolog_size: 2,
            has_funclets: true,
            ..GcInfoHeader::new(Architecture::X86)
        };
        let funclet = GcInfoHeader {
            prolog_size: 1,
            funclet_offset: 0x20,
            ..GcInfoHeader::new(Architecture::X86)
        };
        let mut method = LegacyMethod::new(header, vec![0x90; 0x30]);
        method.funclets.push((0x20, funclet));
        let clause = EhClause {
            try_start_offset: 4,
            try_end_offset: 0x10,
            handler: ClauseHandler::Filter {
                handler_offset: 0x28,
                handler: Address::ZERO,
                filter_offset: 0x20,
                filter: Address::ZERO,
            },
        };
        method.eh_clauses.push((clause, 0));
        method
    }

    #[test]
    fn test_lookup_between_methods()
    {
        let mut writer = LegacyModuleWriter::new(Architecture::X86, DeltaShortcuts::default());
        writer.add_method(LegacyMethod::new(GcInfoHeader::new(Architecture::X86), vec![0xc3; 5]));
        let second = writer.add_method(LegacyMethod::new(GcInfoHeader::new(Architecture::X86), vec![0xc3; 3]));
        assert_eq!(second, 0x10);

        let base = Address::new(0x40_0000);
        let manager = LegacyCodeManager::new(writer.build(base).unwrap(), Vec::new()).unwrap();
        assert_eq!(manager.method_count(), 2);

        let info = manager.find_method_info(base + 0x1011).unwrap();
        assert_eq!(info.method_start, base + 0x1010);
        assert_eq!(info.code_offset, 1);
        assert_eq!(info.code_size, 3);

        let err = manager.find_method_info(base + 0x1008).unwrap_err();
        assert!(matches!(err, WalkError::MethodNotFound { .. }));
    }

    #[test]
    fn test_filter_funclet_kind()
    {
        let mut writer = LegacyModuleWriter::new(Architecture::X86, DeltaShortcuts::default());
        writer.add_type(0x1234);
        writer.add_method(filter_method());
        let base = Address::new(0x40_0000);
        let manager = LegacyCodeManager::new(writer.build(base).unwrap(), Vec::new()).unwrap();

        let info = manager.find_method_info(base + 0x1022).unwrap();
        assert_eq!(info.kind, FuncletKind::Filter);
        assert_eq!(info.body_start, base + 0x1020);
        assert!(info.flags.contains(MethodFlags::HAS_EHINFO));
        assert!(manager.is_filter(&info));
    }
}
