//! Code manager for ELF and Mach-O modules.
//!
//! Managed bodies are described by ordinary `.eh_frame` FDEs. The FDE's LSDA
//! points at the body's method-info blob instead of a C++ exception table.

use gimli::write::{
    Address as CfiAddress, CallFrameInstruction, CommonInformationEntry, EhFrame, EndianVec, FrameDescriptionEntry,
    FrameTable,
};
use gimli::{constants, Encoding, Format, LittleEndian, Register};
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
use crate::unwind::{arm64, dwarf};

/// ELF or Mach-O module
#[derive(Debug)]
pub struct DwarfCodeManager
{
    image: ModuleImage,
    code_range: (Address, u64),
    shortcuts: DeltaShortcuts,
    strings: Vec<u8>,
    classlib: Vec<Address>,
}

impl DwarfCodeManager
{
    /// Manager for an image with `.text`, `.eh_frame` and `.gcstrings`.
    ///
    /// ## Errors
    ///
    /// `Object` when `.text` or `.eh_frame` is missing, `MalformedGcInfo`
    /// for a missing or short `.gcstrings`.
    pub fn new(image: ModuleImage, classlib: Vec<Address>) -> Result<Self>
    {
        let code_range = image
            .code_range()
            .ok_or_else(|| WalkError::Object("module has no .text section".to_string()))?;
        if image.section(".eh_frame").is_none() {
            return Err(WalkError::Object("module has no .eh_frame section".to_string()));
        }
        let (shortcuts, strings) = blob::read_gc_strings(&image)?;

        debug!(
            base = %image.base(),
            arch = %image.arch(),
            code_start = %code_range.0,
            code_size = code_range.1,
            "created dwarf code manager"
        );
        Ok(Self {
            image,
            code_range,
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
}

impl CodeManager for DwarfCodeManager
{
    fn kind(&self) -> CodeManagerKind
    {
        CodeManagerKind::Dwarf
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
        // Native code in the range has CFI but no method-info blob
        let fde = dwarf::find_fde(&self.image, ip)?.ok_or(WalkError::MethodNotFound { ip })?;
        let lsda = fde.lsda.ok_or(WalkError::MethodNotFound { ip })?;

        let resolved = blob::resolve(&self.image, lsda, fde.start)?;
        let code_size = if resolved.method_start == fde.start {
            fde.len
        } else {
            dwarf::find_fde(&self.image, resolved.method_start)?
                .ok_or_else(|| WalkError::MalformedGcInfo(format!("no FDE at method start {}", resolved.method_start)))?
                .len
        };
        let code_size = u32::try_from(code_size)
            .map_err(|_| WalkError::MalformedGcInfo(format!("method at {} is too large", resolved.method_start)))?;

        trace!(ip = %ip, fde_start = %fde.start, lsda = %lsda, "dwarf method lookup");
        blob::build_method_info(&self.image, ip, &resolved, code_size, UnwindSource::Dwarf)
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

        match info.unwind {
            UnwindSource::Dwarf => dwarf::unwind_stack_frame(&self.image, display, memory)?,
            UnwindSource::Arm64Custom { mode, data } => {
                arm64::unwind_stack_frame(&self.image, mode, data, display, memory)?;
            }
            other => {
                return Err(WalkError::InvalidArgument(format!(
                    "method at {} has {other:?} unwind data in a dwarf module",
                    info.method_start
                )));
            }
        }
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
        info.eh_info
            .map(|eh_info| EhEnumState::new(&self.image, info.method_start, eh_info, TypeReference::SelfRelative))
            .transpose()
    }
}

#[derive(Debug, Clone)]
struct DwarfBody
{
    begin: u32,
    len: u32,
    blob_rva: u32,
    instructions: Vec<(u32, CallFrameInstruction)>,
}

/// Builds ELF-style images in memory.
///
/// Code goes to `.text`, method-info blobs and extra data to `.rodata`, and
/// one FDE per body to `.eh_frame` with the blob as its LSDA. Frame
/// instructions are given per body as `(code offset, instruction)` pairs on
/// top of a CIE describing the state at function entry.
#[derive(Debug, Clone)]
pub struct DwarfModuleWriter
{
    arch: Architecture,
    text_rva: u32,
    rodata_rva: u32,
    text: Vec<u8>,
    rodata: Vec<u8>,
    bodies: Vec<DwarfBody>,
}

impl DwarfModuleWriter
{
    pub fn new(arch: Architecture, text_rva: u32, rodata_rva: u32) -> Self
    {
        Self {
            arch,
            text_rva,
            rodata_rva,
            text: Vec::new(),
            rodata: Vec::new(),
            bodies: Vec::new(),
        }
    }

    fn append_body(
        &mut self,
        code: &[u8],
        instructions: Vec<(u32, CallFrameInstruction)>,
        blob: &MethodInfoBlob,
        gc_info: &[u8],
    ) -> usize
    {
        let begin = self.text_rva + self.text.len() as u32;
        self.text.extend_from_slice(code);

        let blob_rva = self.add_data(&[]);
        blob.encode(&mut self.rodata);
        self.rodata.extend_from_slice(gc_info);

        self.bodies.push(DwarfBody {
            begin,
            len: code.len() as u32,
            blob_rva,
            instructions,
        });
        self.bodies.len() - 1
    }

    /// Append a root method and return its body index.
    pub fn add_root(
        &mut self,
        code: &[u8],
        instructions: Vec<(u32, CallFrameInstruction)>,
        blob: MethodInfoBlob,
        gc_info: &[u8],
    ) -> usize
    {
        self.append_body(code, instructions, &blob, gc_info)
    }

    /// Append a funclet of the root method at index `parent`.
    pub fn add_funclet(
        &mut self,
        parent: usize,
        kind: FuncletKind,
        code: &[u8],
        instructions: Vec<(u32, CallFrameInstruction)>,
    ) -> usize
    {
        let begin = self.text_rva + self.text.len() as u32;
        let blob_rva = (self.rodata_rva + self.rodata.len() as u32).next_multiple_of(4);
        let (parent_begin, parent_blob) = self
            .bodies
            .get(parent)
            .map_or((begin, blob_rva), |body| (body.begin, body.blob_rva));
        let blob = MethodInfoBlob::funclet(
            kind,
            parent_blob.wrapping_sub(blob_rva) as i32,
            parent_begin.wrapping_sub(begin) as i32,
        );
        self.append_body(code, instructions, &blob, &[])
    }

    /// Append 4-byte aligned data to `.rodata` and return its RVA.
    pub fn add_data(&mut self, data: &[u8]) -> u32
    {
        let padded = (self.rodata_rva as usize + self.rodata.len()).next_multiple_of(4) - self.rodata_rva as usize;
        self.rodata.resize(padded, 0);
        let rva = self.rodata_rva + self.rodata.len() as u32;
        self.rodata.extend_from_slice(data);
        rva
    }

    /// Start of body `index` relative to the module base
    pub fn body_rva(&self, index: usize) -> Option<u32>
    {
        self.bodies.get(index).map(|body| body.begin)
    }

    pub fn blob_rva(&self, index: usize) -> Option<u32>
    {
        self.bodies.get(index).map(|body| body.blob_rva)
    }

    /// CIE for the state at function entry
    fn entry_cie(&self) -> CommonInformationEntry
    {
        let encoding = Encoding {
            address_size: self.arch.pointer_size() as u8,
            format: Format::Dwarf32,
            version: 1,
        };
        let mut cie = match self.arch {
            Architecture::X86 => {
                let mut cie = CommonInformationEntry::new(encoding, 1, -4, gimli::X86::RA);
                cie.add_instruction(CallFrameInstruction::Cfa(gimli::X86::ESP, 4));
                cie.add_instruction(CallFrameInstruction::Offset(gimli::X86::RA, -4));
                cie
            }
            Architecture::Amd64 => {
                let mut cie = CommonInformationEntry::new(encoding, 1, -8, gimli::X86_64::RA);
                cie.add_instruction(CallFrameInstruction::Cfa(gimli::X86_64::RSP, 8));
                cie.add_instruction(CallFrameInstruction::Offset(gimli::X86_64::RA, -8));
                cie
            }
            Architecture::Arm => {
                let mut cie = CommonInformationEntry::new(encoding, 2, -4, Register(14));
                cie.add_instruction(CallFrameInstruction::Cfa(Register(13), 0));
                cie
            }
            Architecture::Arm64 => {
                let mut cie = CommonInformationEntry::new(encoding, 4, -8, gimli::AArch64::X30);
                cie.add_instruction(CallFrameInstruction::Cfa(gimli::AArch64::SP, 0));
                cie
            }
        };
        cie.lsda_encoding = Some(constants::DW_EH_PE_absptr);
        cie
    }

    /// Lay out `.text`, `.rodata`, `.eh_frame` and `.gcstrings` at `base`.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` when gimli rejects the frame table.
    pub fn build(self, base: Address, shortcuts: &DeltaShortcuts, strings: &[u8]) -> Result<ModuleImage>
    {
        let mut table = FrameTable::default();
        let cie = table.add_cie(self.entry_cie());
        for body in &self.bodies {
            let mut fde = FrameDescriptionEntry::new(
                CfiAddress::Constant(base.value() + u64::from(body.begin)),
                body.len,
            );
            fde.lsda = Some(CfiAddress::Constant(base.value() + u64::from(body.blob_rva)));
            for (offset, instruction) in &body.instructions {
                fde.add_instruction(*offset, instruction.clone());
            }
            table.add_fde(cie, fde);
        }

        let mut eh_frame = EhFrame(EndianVec::new(LittleEndian));
        table
            .write_eh_frame(&mut eh_frame)
            .map_err(|err| WalkError::InvalidArgument(format!("cannot write .eh_frame: {err}")))?;
        let eh_frame = eh_frame.0.into_vec();

        let rodata_end = u64::from(self.rodata_rva) + self.rodata.len() as u64;
        let eh_frame_rva = rodata_end.next_multiple_of(0x10);
        let strings_rva = (eh_frame_rva + eh_frame.len() as u64).next_multiple_of(0x10);

        Ok(ModuleImage::new(self.arch, base)
            .with_section(".text", base + u64::from(self.text_rva), self.text)
            .with_section(".rodata", base + u64::from(self.rodata_rva), self.rodata)
            .with_section(".eh_frame", base + eh_frame_rva, eh_frame)
            .with_section(GC_STRINGS_SECTION, base + strings_rva, blob::encode_gc_strings(shortcuts, strings)))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::gcinfo::GcInfoHeader;

    fn gc_info(arch: Architecture) -> Vec<u8>
    {
        let mut bytes = Vec::new();
        GcInfoHeader::new(arch).encode(&mut bytes).unwrap();
        bytes.push(0xff);
        bytes
    }

    #[test]
    fn test_funclet_resolves_to_root()
    {
        let mut writer = DwarfModuleWriter::new(Architecture::Amd64, 0x1000, 0x3000);
        let root = writer.add_root(&[0x90; 0x20], Vec::new(), MethodInfoBlob::root(), &gc_info(Architecture::Amd64));
        writer.add_funclet(root, FuncletKind::Handler, &[0x90; 0x10], Vec::new());

        let base = Address::new(0x7f00_0000_0000);
        let image = writer.build(base, &DeltaShortcuts::default(), &[]).unwrap();
        let manager = DwarfCodeManager::new(image, Vec::new()).unwrap();

        let info = manager.find_method_info(base + 0x1024).unwrap();
        assert_eq!(info.method_start, base + 0x1000);
        assert_eq!(info.body_start, base + 0x1020);
        assert_eq!(info.code_offset, 0x24);
        assert_eq!(info.code_size, 0x20);
        assert_eq!(info.kind, FuncletKind::Handler);
        assert!(info.parent_blob.is_some());
    }

    #[test]
    fn test_missing_eh_frame_rejected()
    {
        let base = Address::new(0x1000);
        let image = ModuleImage::new(Architecture::Arm64, base).with_section(".text", base, vec![0; 4]);
        assert!(matches!(DwarfCodeManager::new(image, Vec::new()), Err(WalkError::Object(_))));
    }
}
