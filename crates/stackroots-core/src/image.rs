//! # Module Images
//!
//! The read-only sections of a loaded module: code for the epilog matcher,
//! unwind tables for the platform unwinders, and rodata holding method-info
//! blobs and EH tables.
//!
//! Images are built from an on-disk PE, ELF or Mach-O file with the `object`
//! crate, or assembled section by section for captured snapshots and tests.
//! Every section is stored at its run-time address so an image answers
//! [`MemoryAccess`] reads directly.

use std::borrow::Cow;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use object::{Object, ObjectSection};
use tracing::debug;

use crate::error::{Result, WalkError};
use crate::memory::MemoryAccess;
use crate::types::{Address, Architecture};

/// Container format the image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat
{
    Pe,
    Elf,
    MachO,
    /// Assembled in memory from individual sections
    Raw,
}

/// One loaded section
#[derive(Debug, Clone)]
pub struct SectionBlob
{
    pub name: String,
    /// Run-time address of the first byte
    pub address: Address,
    pub data: Arc<[u8]>,
}

impl SectionBlob
{
    pub fn contains(&self, address: Address) -> bool
    {
        address.value() >= self.address.value() && address.distance_from(self.address) < self.data.len() as i64
    }

    pub fn end(&self) -> Address
    {
        self.address.saturating_add(self.data.len() as u64)
    }
}

const LOADED_SECTIONS: &[(&str, &[&str])] = &[
    (".text", &[".text", "__text"]),
    (".pdata", &[".pdata"]),
    (".xdata", &[".xdata"]),
    (".rdata", &[".rdata", ".rodata", "__const"]),
    (".eh_frame", &[".eh_frame", "__eh_frame"]),
    (".eh_frame_hdr", &[".eh_frame_hdr"]),
    (".unbox", &[".unbox", "__unbox"]),
    (".gcinfo", &[".gcinfo", "__gcinfo"]),
    (".gcstrings", &[".gcstrings", "__gcstrings"]),
];

fn load_section_blob<'data>(
    file: &object::File<'data>,
    canonical: &str,
    names: &[&str],
    slide: i64,
) -> Result<Option<SectionBlob>>
{
    for name in names {
        if let Some(section) = file.section_by_name(name) {
            let data = section
                .uncompressed_data()
                .map_err(|err| WalkError::Object(format!("failed to read {name}: {err}")))?;
            let data = match data {
                Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes.to_vec()),
                Cow::Owned(vec) => vec.into(),
            };
            let address = Address::new(section.address()).offset(slide);
            return Ok(Some(SectionBlob {
                name: canonical.to_string(),
                address,
                data,
            }));
        }
    }

    Ok(None)
}

/// A module mapped at `base`
///
/// ## Example
///
/// ```rust
/// use stackroots_core::image::ModuleImage;
/// use stackroots_core::memory::MemoryAccess;
/// use stackroots_core::types::{Address, Architecture};
///
/// let image = ModuleImage::new(Architecture::Amd64, Address::new(0x40_0000))
///     .with_section(".text", Address::new(0x40_1000), vec![0x5d, 0xc3]);
/// assert_eq!(image.read_u8(Address::new(0x40_1001))?, 0xc3);
/// assert!(image.code_range().is_some());
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ModuleImage
{
    base: Address,
    arch: Architecture,
    format: ImageFormat,
    sections: Vec<SectionBlob>,
}

impl ModuleImage
{
    /// Empty raw image
    pub fn new(arch: Architecture, base: Address) -> Self
    {
        Self {
            base,
            arch,
            format: ImageFormat::Raw,
            sections: Vec::new(),
        }
    }

    /// Add a section at a run-time address.
    #[must_use]
    pub fn with_section(mut self, name: &str, address: Address, data: impl Into<Arc<[u8]>>) -> Self
    {
        self.add_section(name, address, data);
        self
    }

    /// Add a section, replacing any section with the same name.
    pub fn add_section(&mut self, name: &str, address: Address, data: impl Into<Arc<[u8]>>)
    {
        self.sections.retain(|section| section.name != name);
        self.sections.push(SectionBlob {
            name: name.to_string(),
            address,
            data: data.into(),
        });
    }

    /// Parse an object file and map it at `base`.
    ///
    /// Section addresses are rebased from the file's preferred image base to
    /// `base`. Only the sections the walker reads are kept.
    ///
    /// ## Errors
    ///
    /// `Object` if the file is not a supported PE/ELF/Mach-O image or its
    /// architecture is not one the walker handles.
    pub fn from_object(bytes: &[u8], base: Address) -> Result<Self>
    {
        let file = object::File::parse(bytes)?;

        let arch = match file.architecture() {
            object::Architecture::I386 => Architecture::X86,
            object::Architecture::X86_64 => Architecture::Amd64,
            object::Architecture::Arm => Architecture::Arm,
            object::Architecture::Aarch64 => Architecture::Arm64,
            other => return Err(WalkError::Object(format!("unsupported architecture {other:?}"))),
        };

        let format = match file.format() {
            object::BinaryFormat::Pe | object::BinaryFormat::Coff => ImageFormat::Pe,
            object::BinaryFormat::Elf => ImageFormat::Elf,
            object::BinaryFormat::MachO => ImageFormat::MachO,
            other => return Err(WalkError::Object(format!("unsupported format {other:?}"))),
        };

        let slide = base.value().wrapping_sub(file.relative_address_base()) as i64;

        let mut sections = Vec::new();
        for (canonical, aliases) in LOADED_SECTIONS {
            if let Some(blob) = load_section_blob(&file, canonical, aliases, slide)? {
                sections.push(blob);
            }
        }

        debug!(?arch, ?format, base = %base, sections = sections.len(), "loaded module image");

        Ok(Self {
            base,
            arch,
            format,
            sections,
        })
    }

    /// Read and parse an image file from disk.
    pub fn from_path(path: &Path, base: Address) -> Result<Self>
    {
        let bytes = fs::read(path)?;
        Self::from_object(&bytes, base)
    }

    pub const fn base(&self) -> Address
    {
        self.base
    }

    pub const fn arch(&self) -> Architecture
    {
        self.arch
    }

    pub const fn format(&self) -> ImageFormat
    {
        self.format
    }

    pub fn sections(&self) -> &[SectionBlob]
    {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&SectionBlob>
    {
        self.sections.iter().find(|section| section.name == name)
    }

    /// Start and length of the managed code section
    pub fn code_range(&self) -> Option<(Address, u64)>
    {
        self.section(".text").map(|text| (text.address, text.data.len() as u64))
    }

    /// Start and length of the unboxing stub section
    pub fn unboxing_stub_range(&self) -> Option<(Address, u64)>
    {
        self.section(".unbox").map(|stubs| (stubs.address, stubs.data.len() as u64))
    }

    /// Bytes from `address` to the end of its section
    pub fn bytes_from(&self, address: Address) -> Option<&[u8]>
    {
        let section = self.sections.iter().find(|section| section.contains(address))?;
        let offset = address.distance_from(section.address) as usize;
        section.data.get(offset..)
    }

    /// Address of `rva` relative to the module base
    pub fn rva(&self, rva: u32) -> Address
    {
        self.base.saturating_add(u64::from(rva))
    }
}

impl MemoryAccess for ModuleImage
{
    fn read_bytes(&self, address: Address, dst: &mut [u8]) -> Result<()>
    {
        let bytes = self.bytes_from(address).ok_or(WalkError::MemoryRead { address })?;
        let src = bytes.get(..dst.len()).ok_or(WalkError::MemoryRead { address })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}
