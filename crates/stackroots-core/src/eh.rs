//! # Exception-handling Clauses
//!
//! Enumeration of the protected regions of a method, and the legacy fault
//! remapping that moves a faulting offset into the handler that will catch
//! the fault.
//!
//! ## Clause Encoding
//!
//! ```text
//! count                          var-int
//! per clause:
//!   tryStart                     var-int, offset from the method start
//!   (tryLength << 2) | kind      var-int
//!   handlerStart                 var-int (typed, fault, filter)
//!   type reference               typed only; format depends on the module
//!   filterStart                  var-int (filter only)
//! ```
//!
//! The type reference of a typed clause is a var-int index into the EH type
//! table for legacy modules, a fixed u32 RVA from the module base for COFF
//! modules, and a self-relative i32 for ELF and Mach-O modules.

use std::fmt;

use tracing::{debug, trace};

use crate::codeman::{CodeManager, MethodInfo};
use crate::error::{Result, WalkError};
use crate::gcinfo::GcInfoHeader;
use crate::image::ModuleImage;
use crate::memory::MemoryAccess;
use crate::types::{Address, Architecture};
use crate::varint::VarIntReader;

/// Clause kind from the low two bits of the fused try-length field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EhClauseKind
{
    Typed,
    Fault,
    Filter,
    /// Legacy modules only: a region whose exceptions terminate the process
    FailFast,
}

impl EhClauseKind
{
    pub const fn bits(self) -> u32
    {
        match self {
            EhClauseKind::Typed => 0,
            EhClauseKind::Fault => 1,
            EhClauseKind::Filter => 2,
            EhClauseKind::FailFast => 3,
        }
    }
}

impl fmt::Display for EhClauseKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            EhClauseKind::Typed => "typed",
            EhClauseKind::Fault => "fault",
            EhClauseKind::Filter => "filter",
            EhClauseKind::FailFast => "failfast",
        };
        f.write_str(name)
    }
}

/// Payload of a clause, fixed per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseHandler
{
    Typed
    {
        handler_offset: u32,
        handler: Address,
        /// Type descriptor the handler catches
        target_type: Address,
    },
    Fault
    {
        handler_offset: u32,
        handler: Address,
    },
    Filter
    {
        handler_offset: u32,
        handler: Address,
        filter_offset: u32,
        filter: Address,
    },
    FailFast,
}

/// One protected region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhClause
{
    pub try_start_offset: u32,
    /// Exclusive end of the protected region
    pub try_end_offset: u32,
    pub handler: ClauseHandler,
}

impl EhClause
{
    pub fn kind(&self) -> EhClauseKind
    {
        match self.handler {
            ClauseHandler::Typed { .. } => EhClauseKind::Typed,
            ClauseHandler::Fault { .. } => EhClauseKind::Fault,
            ClauseHandler::Filter { .. } => EhClauseKind::Filter,
            ClauseHandler::FailFast => EhClauseKind::FailFast,
        }
    }

    /// Handler funclet offset from the method start, if the clause has one
    pub fn handler_offset(&self) -> Option<u32>
    {
        match self.handler {
            ClauseHandler::Typed { handler_offset, .. }
            | ClauseHandler::Fault { handler_offset, .. }
            | ClauseHandler::Filter { handler_offset, .. } => Some(handler_offset),
            ClauseHandler::FailFast => None,
        }
    }

    pub fn filter_offset(&self) -> Option<u32>
    {
        match self.handler {
            ClauseHandler::Filter { filter_offset, .. } => Some(filter_offset),
            _ => None,
        }
    }

    /// Whether `code_offset` is inside the protected region
    pub fn contains(&self, code_offset: u32) -> bool
    {
        self.try_start_offset <= code_offset && code_offset < self.try_end_offset
    }

    /// Whether this clause's try region strictly encloses `[start, end)`
    pub fn strictly_encloses(&self, start: u32, end: u32) -> bool
    {
        self.try_start_offset <= start
            && end <= self.try_end_offset
            && (self.try_start_offset != start || self.try_end_offset != end)
    }
}

/// How typed clauses name their target type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeReference
{
    /// Var-int index into a table of pointer-sized entries. An entry with the
    /// low bit set points one byte past an indirection cell.
    TypeTable
    {
        table: Address,
    },
    /// Fixed u32 RVA from the module base
    ModuleRva
    {
        module_base: Address,
    },
    /// Fixed i32 relative to the end of the field
    SelfRelative,
}

/// Position of an in-progress clause enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhEnumState
{
    pub method_start: Address,
    cursor: Address,
    clause: u32,
    count: u32,
    types: TypeReference,
    allow_fail_fast: bool,
}

impl EhEnumState
{
    /// Start enumerating the clause table at `eh_info`.
    ///
    /// ## Errors
    ///
    /// `MemoryRead` if the table is not inside the image.
    pub fn new(image: &ModuleImage, method_start: Address, eh_info: Address, types: TypeReference) -> Result<Self>
    {
        let mut reader = reader_at(image, eh_info)?;
        let count = reader.read_unsigned()?;
        trace!(%eh_info, count, "EH clause table");
        Ok(Self {
            method_start,
            cursor: eh_info.saturating_add(reader.position() as u64),
            clause: 0,
            count,
            types,
            allow_fail_fast: matches!(types, TypeReference::TypeTable { .. }),
        })
    }

    /// Number of clauses in the table
    pub const fn count(&self) -> u32
    {
        self.count
    }

    /// Decode the next clause; `None` once every clause has been returned.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use stackroots_core::eh::{ClauseHandler, EhEnumState, TypeReference};
    /// use stackroots_core::image::ModuleImage;
    /// use stackroots_core::types::{Address, Architecture};
    ///
    /// let base = Address::new(0x1000_0000);
    /// let table = vec![0x01, 0x10, 0x80, 0x01, 0x40, 0x45, 0x23, 0x01, 0x00];
    /// let image = ModuleImage::new(Architecture::Amd64, base).with_section(".rdata", base + 0x2000, table);
    ///
    /// let method_start = Address::new(0x1000_1000);
    /// let types = TypeReference::ModuleRva { module_base: base };
    /// let mut state = EhEnumState::new(&image, method_start, base + 0x2000, types)?;
    /// let clause = state.next(&image)?.expect("one clause");
    /// assert_eq!((clause.try_start_offset, clause.try_end_offset), (0x10, 0x30));
    /// assert!(matches!(clause.handler, ClauseHandler::Typed { target_type, .. } if target_type == base + 0x12345));
    /// assert!(state.next(&image)?.is_none());
    /// # Ok::<(), stackroots_core::WalkError>(())
    /// ```
    pub fn next(&mut self, image: &ModuleImage) -> Result<Option<EhClause>>
    {
        if self.clause >= self.count {
            return Ok(None);
        }
        self.clause += 1;

        let mut reader = reader_at(image, self.cursor)?;
        let try_start_offset = reader.read_unsigned()?;
        let fused = reader.read_unsigned()?;
        let try_end_offset = try_start_offset.wrapping_add(fused >> 2);

        let handler = match fused & 3 {
            0 => {
                let handler_offset = reader.read_unsigned()?;
                let target_type = self.read_type(image, &mut reader)?;
                ClauseHandler::Typed {
                    handler_offset,
                    handler: self.code_address(handler_offset),
                    target_type,
                }
            }
            1 => {
                let handler_offset = reader.read_unsigned()?;
                ClauseHandler::Fault {
                    handler_offset,
                    handler: self.code_address(handler_offset),
                }
            }
            2 => {
                let handler_offset = reader.read_unsigned()?;
                let filter_offset = reader.read_unsigned()?;
                ClauseHandler::Filter {
                    handler_offset,
                    handler: self.code_address(handler_offset),
                    filter_offset,
                    filter: self.code_address(filter_offset),
                }
            }
            _ if self.allow_fail_fast => ClauseHandler::FailFast,
            kind => return Err(WalkError::MalformedGcInfo(format!("unused EH clause kind {kind}"))),
        };

        self.cursor = self.cursor.saturating_add(reader.position() as u64);
        let clause = EhClause {
            try_start_offset,
            try_end_offset,
            handler,
        };
        trace!(?clause, "EH clause");
        Ok(Some(clause))
    }

    /// Every remaining clause, in table order.
    pub fn collect_all(&mut self, image: &ModuleImage) -> Result<Vec<EhClause>>
    {
        let mut clauses = Vec::with_capacity(self.count.saturating_sub(self.clause) as usize);
        while let Some(clause) = self.next(image)? {
            clauses.push(clause);
        }
        Ok(clauses)
    }

    fn code_address(&self, offset: u32) -> Address
    {
        self.method_start.saturating_add(u64::from(offset))
    }

    fn read_type(&self, image: &ModuleImage, reader: &mut VarIntReader<'_>) -> Result<Address>
    {
        match self.types {
            TypeReference::TypeTable { table } => {
                let index = reader.read_unsigned()?;
                let arch = image.arch();
                let entry_address = table.saturating_add(u64::from(index) * arch.pointer_size());
                let entry = image.read_pointer(arch, entry_address)?;
                if entry & 1 == 1 {
                    image.read_address(arch, Address::new(entry - 1))
                } else {
                    Ok(Address::new(entry))
                }
            }
            TypeReference::ModuleRva { module_base } => {
                let rva = reader.read_u32()?;
                Ok(module_base.saturating_add(u64::from(rva)))
            }
            TypeReference::SelfRelative => {
                let relative = reader.read_i32()?;
                let field_end = self.cursor.saturating_add(reader.position() as u64);
                Ok(field_end.offset(i64::from(relative)))
            }
        }
    }
}

fn reader_at(image: &ModuleImage, address: Address) -> Result<VarIntReader<'_>>
{
    let bytes = image.bytes_from(address).ok_or(WalkError::MemoryRead { address })?;
    Ok(VarIntReader::new(bytes))
}

/// Start a clause enumeration for the method containing return address `ip`.
///
/// Returns the method start and the enumeration, or `None` when the method
/// has no EH info.
pub fn eh_enum_init_from_return_address(
    manager: &dyn CodeManager,
    ip: Address,
) -> Result<Option<(Address, EhEnumState)>>
{
    let info = manager.find_method_info(ip)?;
    Ok(manager
        .eh_enum_init(&info)?
        .map(|state| (manager.get_method_start_address(&info), state)))
}

/// Remap a faulting code offset to the handler that will catch the fault.
///
/// When the offset is inside a try region the result is the first offset
/// after the prolog of that clause's handler funclet. When the faulting code
/// is itself a funclet, the clause it handles is found first and the result
/// comes from the next clause whose try region strictly encloses that
/// clause's region. `None` means the fault escapes the method.
///
/// ## Errors
///
/// Propagates clause decode errors, and `MalformedGcInfo` when a funclet
/// handles no clause of its method.
pub fn remap_fault_to_handler(manager: &dyn CodeManager, info: &MethodInfo) -> Result<Option<u32>>
{
    let image = manager.image();
    let Some(mut state) = manager.eh_enum_init(info)? else {
        return Ok(None);
    };
    let clauses = state.collect_all(image)?;

    let code_offset = info.code_offset;
    if let Some(clause) = clauses.iter().find(|clause| clause.contains(code_offset)) {
        return handler_safe_point(image, info, clause);
    }

    if !info.is_funclet() {
        return Ok(None);
    }

    // Clauses are emitted inside-out, so enclosing clauses follow the one
    // this funclet handles.
    let funclet_offset = info.header.funclet_offset;
    let mut region: Option<(u32, u32)> = None;
    for clause in &clauses {
        if let Some((start, end)) = region {
            if clause.strictly_encloses(start, end) {
                return handler_safe_point(image, info, clause);
            }
        }
        if clause.handler_offset() == Some(funclet_offset) || clause.filter_offset() == Some(funclet_offset) {
            region = Some((clause.try_start_offset, clause.try_end_offset));
        }
    }

    if region.is_none() {
        return Err(WalkError::MalformedGcInfo(format!(
            "funclet at 0x{funclet_offset:x} handles no EH clause"
        )));
    }
    Ok(None)
}

fn handler_safe_point(image: &ModuleImage, info: &MethodInfo, clause: &EhClause) -> Result<Option<u32>>
{
    let Some(handler_offset) = clause.handler_offset() else {
        return Ok(None);
    };
    let gc_info = image.bytes_from(info.gc_info).ok_or(WalkError::MemoryRead { address: info.gc_info })?;
    let (header, _) = GcInfoHeader::decode(info.header.arch, gc_info, handler_offset)?;
    let mut remapped = handler_offset + header.prolog_size;
    if info.header.arch == Architecture::Arm {
        remapped &= !1;
    }
    debug!(from = info.code_offset, to = remapped, "remapped fault to handler funclet");
    Ok(Some(remapped))
}

/// Append one clause in the table encoding; `type_ref` is written verbatim.
///
/// Used by fixture builders. The caller writes the clause count first.
pub fn encode_clause(clause: &EhClause, type_ref: &[u8], out: &mut Vec<u8>)
{
    use crate::varint::encode_unsigned;

    encode_unsigned(clause.try_start_offset, out);
    let length = clause.try_end_offset.wrapping_sub(clause.try_start_offset);
    encode_unsigned((length << 2) | clause.kind().bits(), out);
    match clause.handler {
        ClauseHandler::Typed { handler_offset, .. } => {
            encode_unsigned(handler_offset, out);
            out.extend_from_slice(type_ref);
        }
        ClauseHandler::Fault { handler_offset, .. } => encode_unsigned(handler_offset, out),
        ClauseHandler::Filter {
            handler_offset,
            filter_offset,
            ..
        } => {
            encode_unsigned(handler_offset, out);
            encode_unsigned(filter_offset, out);
        }
        ClauseHandler::FailFast => {}
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn image_with(table: Vec<u8>) -> (ModuleImage, Address)
    {
        let base = Address::new(0x40_0000);
        let image = ModuleImage::new(Architecture::Amd64, base).with_section(".rdata", base + 0x100, table);
        (image, base + 0x100)
    }

    #[test]
    fn test_fault_and_filter_clauses()
    {
        // fault [0x4, 0x8) -> 0x20; filter [0x4, 0xc) -> handler 0x30, filter 0x28
        let (image, eh_info) = image_with(vec![0x02, 0x04, 0x11, 0x20, 0x04, 0x22, 0x30, 0x28]);
        let start = Address::new(0x40_1000);
        let mut state = EhEnumState::new(&image, start, eh_info, TypeReference::SelfRelative).unwrap();
        let clauses = state.collect_all(&image).unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].kind(), EhClauseKind::Fault);
        assert_eq!(clauses[0].handler_offset(), Some(0x20));
        assert_eq!(clauses[1].try_end_offset, 0xc);
        assert_eq!(clauses[1].filter_offset(), Some(0x28));
        assert!(matches!(clauses[1].handler, ClauseHandler::Filter { filter, .. } if filter == start + 0x28));
    }

    #[test]
    fn test_kind_three_is_fail_fast_only_for_type_tables()
    {
        let (image, eh_info) = image_with(vec![0x01, 0x00, 0x0b]);
        let start = Address::new(0x40_1000);

        let table = TypeReference::TypeTable { table: Address::new(0) };
        let mut state = EhEnumState::new(&image, start, eh_info, table).unwrap();
        assert_eq!(state.next(&image).unwrap().map(|clause| clause.kind()), Some(EhClauseKind::FailFast));

        let rva = TypeReference::ModuleRva { module_base: image.base() };
        let mut state = EhEnumState::new(&image, start, eh_info, rva).unwrap();
        assert!(state.next(&image).is_err());
    }

    #[test]
    fn test_self_relative_type()
    {
        // typed [0, 4) handler 8, rel32 = 0x10 measured from the end of the field
        let (image, eh_info) = image_with(vec![0x01, 0x00, 0x10, 0x08, 0x10, 0x00, 0x00, 0x00]);
        let mut state = EhEnumState::new(&image, Address::new(0x40_1000), eh_info, TypeReference::SelfRelative).unwrap();
        let clause = state.next(&image).unwrap().unwrap();
        let field_end = eh_info + 8;
        assert!(matches!(clause.handler, ClauseHandler::Typed { target_type, .. } if target_type == field_end + 0x10));
    }

    #[test]
    fn test_strictly_encloses()
    {
        let clause = EhClause {
            try_start_offset: 0x10,
            try_end_offset: 0x40,
            handler: ClauseHandler::FailFast,
        };
        assert!(clause.strictly_encloses(0x10, 0x30));
        assert!(!clause.strictly_encloses(0x10, 0x40));
        assert!(!clause.strictly_encloses(0x08, 0x30));
    }
}
