//! Method-info blobs of PE and DWARF modules.
//!
//! Every code body (root method or funclet) has a blob. On Win64 it follows
//! the body's `UNWIND_INFO`; in ELF and Mach-O modules it is the FDE's LSDA.
//!
//! ```text
//! flags: u8                                 MethodFlags
//! [kind != root]        parentBlobDelta: i32, parentCodeDelta: i32
//! [HAS_ASSOCIATED_DATA] dataRVA: i32
//! [HAS_EHINFO]          ehInfoRVA: i32
//! [CUSTOM_UNWIND]       mode: u8, unwindRVA: i32
//! [kind == root]        GC info: header, epilog table, callsite map
//! ```
//!
//! The delta shortcut table and the callsite strings are shared by the whole
//! module and live in `.gcstrings`.

use tracing::trace;

use super::{locate_gc_info, FuncletKind, MethodFlags, MethodInfo, UnwindSource};
use crate::error::{Result, WalkError};
use crate::gcref::DeltaShortcuts;
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::types::Address;

/// Section holding the module's shortcut table and callsite strings
pub const GC_STRINGS_SECTION: &str = ".gcstrings";

/// Encoding of an ARM64 custom unwind blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CustomUnwindMode
{
    /// One 16-bit word
    Compact,
    /// CFA rule plus explicit register saves
    Step,
}

impl CustomUnwindMode
{
    pub fn from_byte(byte: u8) -> Result<Self>
    {
        match byte {
            0 => Ok(CustomUnwindMode::Compact),
            1 => Ok(CustomUnwindMode::Step),
            other => Err(WalkError::MalformedGcInfo(format!("custom unwind mode {other}"))),
        }
    }

    pub const fn byte(self) -> u8
    {
        match self {
            CustomUnwindMode::Compact => 0,
            CustomUnwindMode::Step => 1,
        }
    }
}

/// Fixed fields of a method-info blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodInfoBlob
{
    /// Kind and reverse-PInvoke bits; presence bits are derived from the
    /// optional fields when encoding.
    pub flags: MethodFlags,
    /// Root blob address minus this blob's address
    pub parent_blob_delta: i32,
    /// Root method start minus this body's start
    pub parent_code_delta: i32,
    pub associated_data_rva: Option<u32>,
    pub eh_info_rva: Option<u32>,
    pub custom_unwind: Option<(CustomUnwindMode, u32)>,
}

impl MethodInfoBlob
{
    pub fn root() -> Self
    {
        Self::default()
    }

    pub fn funclet(kind: FuncletKind, parent_blob_delta: i32, parent_code_delta: i32) -> Self
    {
        Self {
            flags: MethodFlags::from_bits_truncate(kind.bits()),
            parent_blob_delta,
            parent_code_delta,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> FuncletKind
    {
        self.flags.kind()
    }

    /// Decode the blob at `address`.
    ///
    /// Returns the blob and the address just past its fixed fields, where a
    /// root blob's GC info starts.
    ///
    /// ## Errors
    ///
    /// `MemoryRead` outside the image, `MalformedGcInfo` for an unknown
    /// custom unwind mode.
    pub fn decode(image: &ModuleImage, address: Address) -> Result<(Self, Address)>
    {
        let flags = MethodFlags::from_bits_retain(image.read_u8(address)?);
        let mut cursor = address.saturating_add(1);

        let mut blob = Self {
            flags,
            ..Self::default()
        };
        if flags.kind() != FuncletKind::Root {
            blob.parent_blob_delta = read_i32(image, &mut cursor)?;
            blob.parent_code_delta = read_i32(image, &mut cursor)?;
        }
        if flags.contains(MethodFlags::HAS_ASSOCIATED_DATA) {
            blob.associated_data_rva = Some(read_i32(image, &mut cursor)? as u32);
        }
        if flags.contains(MethodFlags::HAS_EHINFO) {
            blob.eh_info_rva = Some(read_i32(image, &mut cursor)? as u32);
        }
        if flags.contains(MethodFlags::CUSTOM_UNWIND) {
            let mode = CustomUnwindMode::from_byte(image.read_u8(cursor)?)?;
            cursor = cursor.saturating_add(1);
            blob.custom_unwind = Some((mode, read_i32(image, &mut cursor)? as u32));
        }

        trace!(%address, ?blob, "method info blob");
        Ok((blob, cursor))
    }

    pub fn encode(&self, out: &mut Vec<u8>)
    {
        let mut flags = self.flags & (MethodFlags::KIND_MASK | MethodFlags::REVERSE_PINVOKE);
        flags.set(MethodFlags::HAS_ASSOCIATED_DATA, self.associated_data_rva.is_some());
        flags.set(MethodFlags::HAS_EHINFO, self.eh_info_rva.is_some());
        flags.set(MethodFlags::CUSTOM_UNWIND, self.custom_unwind.is_some());
        out.push(flags.bits());

        if flags.kind() != FuncletKind::Root {
            out.extend_from_slice(&self.parent_blob_delta.to_le_bytes());
            out.extend_from_slice(&self.parent_code_delta.to_le_bytes());
        }
        if let Some(rva) = self.associated_data_rva {
            out.extend_from_slice(&rva.to_le_bytes());
        }
        if let Some(rva) = self.eh_info_rva {
            out.extend_from_slice(&rva.to_le_bytes());
        }
        if let Some((mode, rva)) = self.custom_unwind {
            out.push(mode.byte());
            out.extend_from_slice(&rva.to_le_bytes());
        }
    }
}

fn read_i32(image: &ModuleImage, cursor: &mut Address) -> Result<i32>
{
    let value = image.read_i32(*cursor)?;
    *cursor = cursor.saturating_add(4);
    Ok(value)
}

/// A body's blob together with its root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedBlob
{
    pub body: MethodInfoBlob,
    pub root: MethodInfoBlob,
    pub blob: Address,
    pub parent_blob: Option<Address>,
    pub body_start: Address,
    pub method_start: Address,
    /// Start of the root's GC info
    pub gc_info: Address,
}

/// Decode the blob of the body starting at `body_start` and follow it to its root.
pub(crate) fn resolve(image: &ModuleImage, blob: Address, body_start: Address) -> Result<ResolvedBlob>
{
    let (body, after_body) = MethodInfoBlob::decode(image, blob)?;
    if body.kind() == FuncletKind::Root {
        return Ok(ResolvedBlob {
            body,
            root: body,
            blob,
            parent_blob: None,
            body_start,
            method_start: body_start,
            gc_info: after_body,
        });
    }

    if body.flags.contains(MethodFlags::REVERSE_PINVOKE) {
        return Err(WalkError::MalformedGcInfo(format!("reverse pinvoke funclet blob at {blob}")));
    }

    // A funclet's code follows its parent's start
    if body.parent_code_delta >= 0 {
        return Err(WalkError::MalformedGcInfo(format!(
            "funclet at {body_start} is outside its parent method starting at {}",
            body_start.offset(i64::from(body.parent_code_delta))
        )));
    }

    let parent = blob.offset(i64::from(body.parent_blob_delta));
    let (root, after_root) = MethodInfoBlob::decode(image, parent)?;
    if root.kind() != FuncletKind::Root {
        return Err(WalkError::MalformedGcInfo(format!(
            "parent blob {parent} of funclet blob {blob} is not a root"
        )));
    }

    Ok(ResolvedBlob {
        body,
        root,
        blob,
        parent_blob: Some(parent),
        body_start,
        method_start: body_start.offset(i64::from(body.parent_code_delta)),
        gc_info: after_root,
    })
}

/// Build the transient method info for `ip` from a resolved blob.
///
/// `code_size` is the extent of the root method; `unwind` is how the
/// platform unwinder reaches the caller unless the blob names a custom
/// unwind blob.
pub(crate) fn build_method_info(
    image: &ModuleImage,
    ip: Address,
    resolved: &ResolvedBlob,
    code_size: u32,
    unwind: UnwindSource,
) -> Result<MethodInfo>
{
    let code_address = Address::new(image.arch().code_address(ip.value()));
    let code_offset = u32::try_from(code_address.distance_from(resolved.method_start))
        .map_err(|_| WalkError::MalformedGcInfo(format!("{ip} is before its method start {}", resolved.method_start)))?;

    let layout = locate_gc_info(image, resolved.gc_info, code_offset, code_size)?;

    let unwind = match resolved.body.custom_unwind {
        Some((mode, rva)) => UnwindSource::Arm64Custom {
            mode,
            data: image.rva(rva),
        },
        None => unwind,
    };

    Ok(MethodInfo {
        method_start: resolved.method_start,
        body_start: resolved.body_start,
        code_offset,
        code_size,
        kind: resolved.body.kind(),
        flags: resolved.body.flags,
        header: layout.header,
        gc_info: resolved.gc_info,
        epilog_table: layout.epilog_table,
        callsite_map: layout.callsite_map,
        blob: Some(resolved.blob),
        parent_blob: resolved.parent_blob,
        eh_info: resolved.root.eh_info_rva.map(|rva| image.rva(rva)),
        associated_data: resolved.body.associated_data_rva.map(|rva| image.rva(rva)),
        unwind,
        execution_aborted: false,
    })
}

/// The module's shortcut table and callsite strings.
///
/// ## Errors
///
/// `MalformedGcInfo` when the module has no `.gcstrings` section or it is
/// shorter than the shortcut table.
pub(crate) fn read_gc_strings(image: &ModuleImage) -> Result<(DeltaShortcuts, Vec<u8>)>
{
    let section = image
        .section(GC_STRINGS_SECTION)
        .ok_or_else(|| WalkError::MalformedGcInfo(format!("module has no {GC_STRINGS_SECTION} section")))?;
    let shortcuts = DeltaShortcuts::from_slice(&section.data)?;
    let strings = section.data.get(shortcuts.0.len()..).unwrap_or_default().to_vec();
    Ok((shortcuts, strings))
}

/// Bytes of a `.gcstrings` section: the shortcut table, then the strings.
pub fn encode_gc_strings(shortcuts: &DeltaShortcuts, strings: &[u8]) -> Vec<u8>
{
    let mut out = shortcuts.0.to_vec();
    out.extend_from_slice(strings);
    out
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::Architecture;

    #[test]
    fn test_funclet_blob_fields()
    {
        let blob = MethodInfoBlob {
            associated_data_rva: Some(0x3000),
            custom_unwind: Some((CustomUnwindMode::Step, 0x4000)),
            ..MethodInfoBlob::funclet(FuncletKind::Filter, -0x20, -0x80)
        };
        let mut bytes = Vec::new();
        blob.encode(&mut bytes);
        assert_eq!(bytes[0], 0x02 | 0x10 | 0x20);
        assert_eq!(bytes.len(), 1 + 8 + 4 + 5);

        let base = Address::new(0x40_0000);
        let image = ModuleImage::new(Architecture::Arm64, base).with_section(".rodata", base + 0x1000, bytes.clone());
        let (decoded, after) = MethodInfoBlob::decode(&image, base + 0x1000).unwrap();
        assert_eq!(decoded.kind(), FuncletKind::Filter);
        assert_eq!(decoded.parent_blob_delta, -0x20);
        assert_eq!(decoded.associated_data_rva, Some(0x3000));
        assert_eq!(decoded.custom_unwind, Some((CustomUnwindMode::Step, 0x4000)));
        assert_eq!(after, base + 0x1000 + bytes.len() as u64);
    }

    #[test]
    fn test_parent_must_be_root()
    {
        let base = Address::new(0x40_0000);
        let mut bytes = Vec::new();
        MethodInfoBlob::funclet(FuncletKind::Handler, 9, -0x10).encode(&mut bytes);
        MethodInfoBlob::funclet(FuncletKind::Handler, -9, -0x10).encode(&mut bytes);
        let image = ModuleImage::new(Architecture::Amd64, base).with_section(".xdata", base + 0x100, bytes);

        let err = resolve(&image, base + 0x100, base + 0x2000).unwrap_err();
        assert!(matches!(err, WalkError::MalformedGcInfo(_)));
    }

    #[test]
    fn test_funclet_outside_parent_is_rejected()
    {
        let base = Address::new(0x40_0000);
        let mut bytes = Vec::new();
        MethodInfoBlob::root().encode(&mut bytes);
        for code_delta in [-0x10, 0, 0x10] {
            MethodInfoBlob::funclet(FuncletKind::Handler, -(bytes.len() as i32), code_delta).encode(&mut bytes);
        }
        let image = ModuleImage::new(Architecture::Amd64, base).with_section(".xdata", base + 0x100, bytes);
        let body_start = base + 0x2000;

        let inside = resolve(&image, base + 0x101, body_start).unwrap();
        assert_eq!(inside.method_start, base + 0x1ff0);
        assert_eq!(inside.parent_blob, Some(base + 0x100));

        for blob in [base + 0x10a, base + 0x113] {
            let err = resolve(&image, blob, body_start).unwrap_err();
            assert!(matches!(err, WalkError::MalformedGcInfo(_)), "{err}");
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_unknown_custom_unwind_mode()
    {
        assert!(CustomUnwindMode::from_byte(2).is_err());
        assert_eq!(CustomUnwindMode::from_byte(1).unwrap(), CustomUnwindMode::Step);
    }
}
