//! # GC-info Dump
//!
//! Text rendering of a method's GC tables: the header, the epilog table,
//! the callsite map and the roots of every callsite string, one item per
//! line.
//!
//! ## Example
//!
//! ```rust
//! use stackroots_core::dump::GcInfoDumper;
//! use stackroots_core::gcinfo::GcInfoHeader;
//! use stackroots_core::gcref::{CallsiteTables, DeltaShortcuts};
//! use stackroots_core::types::Architecture;
//!
//! let header = GcInfoHeader {
//!     prolog_size: 4,
//!     frame_size: 0x10,
//!     ..GcInfoHeader::new(Architecture::Amd64)
//! };
//! let mut blob = Vec::new();
//! header.encode(&mut blob)?;
//! blob.push(0xff); // empty callsite map
//!
//! let shortcuts = DeltaShortcuts([0; 16]);
//! let tables = CallsiteTables { shortcuts: &shortcuts, strings: &[] };
//! let text = GcInfoDumper::new(Architecture::Amd64, tables).dump(&blob, 0x40)?;
//! assert!(text.contains("prolog size     0x4"));
//! # Ok::<(), stackroots_core::WalkError>(())
//! ```

use crate::error::Result;
use crate::gcinfo::regs::order;
use crate::gcinfo::{EpilogTable, GcInfoHeader, StackChange};
use crate::gcref::callsite;
use crate::gcref::{decode_string, CallsiteTables, GcSlotFlags, RootDescriptor};
use crate::regdisplay::regs;
use crate::types::Architecture;
use crate::varint::VarIntReader;

/// Renders GC tables of one module
pub struct GcInfoDumper<'a>
{
    arch: Architecture,
    tables: CallsiteTables<'a>,
}

impl<'a> GcInfoDumper<'a>
{
    pub fn new(arch: Architecture, tables: CallsiteTables<'a>) -> Self
    {
        Self { arch, tables }
    }

    /// Dump the whole GC info blob of a method of `code_size` bytes.
    ///
    /// ## Errors
    ///
    /// Decode errors of any of the tables.
    pub fn dump(&self, gc_info: &[u8], code_size: u32) -> Result<String>
    {
        let (header, header_size) = GcInfoHeader::decode(self.arch, gc_info, 0)?;
        let mut reader = VarIntReader::at(gc_info, header_size);
        let epilogs = EpilogTable::decode(&header, code_size, &mut reader)?;

        let mut lines = self.header_lines(&header);
        lines.extend(self.epilog_lines(&epilogs));
        lines.extend(self.callsite_lines(reader.remaining())?);
        Ok(join(lines))
    }

    /// Dump only the header, as decoded for `code_offset`.
    pub fn dump_header(&self, header: &GcInfoHeader) -> String
    {
        join(self.header_lines(header))
    }

    /// Dump a callsite map and the strings it refers to.
    pub fn dump_callsites(&self, map: &[u8]) -> Result<String>
    {
        self.callsite_lines(map).map(join)
    }

    /// Dump one callsite string.
    pub fn dump_string(&self, string_offset: u32) -> Result<String>
    {
        let descriptors = decode_string(self.tables.strings, string_offset)?;
        Ok(join(descriptors.iter().map(|d| format!("    {}", self.describe(d))).collect()))
    }

    fn header_lines(&self, header: &GcInfoHeader) -> Vec<String>
    {
        let mut lines = vec![
            format!("method info ({})", header.arch),
            format!("  prolog size     0x{:x}", header.prolog_size),
            format!("  frame size      0x{:x}", header.frame_size),
            format!("  frame pointer   {}", yes_no(header.has_frame_pointer)),
            format!("  saved regs      {}", self.saved_regs(header)),
            format!("  return kind     {}", header.return_kind.name()),
            format!("  epilog count    {}", header.epilog_count),
            format!("  epilog at end   {}", yes_no(header.epilog_at_end)),
        ];

        if header.fixed_epilog_size != 0 {
            lines.push(format!("  epilog size     0x{:x}", header.fixed_epilog_size));
        }
        if header.returns_to_native() {
            lines.push(format!("  rev pinvoke     {}", header.reverse_pinvoke_offset));
        }
        if header.funclet_offset != 0 {
            lines.push(format!("  funclet offset  0x{:x}", header.funclet_offset));
        }
        if header.has_funclets {
            lines.push("  has funclets".to_string());
        }
        if header.has_common_vars {
            lines.push("  has common vars".to_string());
        }
        if let Some(cookie) = header.gs_cookie_offset {
            lines.push(format!("  GS cookie       0x{cookie:x}"));
        }
        if header.has_dynamic_alignment() {
            lines.push(format!("  stack alignment 0x{:x}", header.dynamic_alignment()));
        }

        match header.arch {
            Architecture::Amd64 => {
                if header.x64_frame_ptr_offset != 0 {
                    lines.push(format!("  fp offset       0x{:x}", header.frame_pointer_offset()));
                }
                if header.saved_xmm_mask != 0 {
                    let xmms = (6..16)
                        .filter(|n| header.saved_xmm_mask & (1 << n) != 0)
                        .map(|n| format!("xmm{n}"))
                        .collect::<Vec<_>>();
                    lines.push(format!("  saved xmm       {}", xmms.join(" ")));
                }
            }
            Architecture::X86 => {
                if header.return_pop_size != 0 {
                    lines.push(format!("  ret pop size    0x{:x}", header.return_pop_size));
                }
                let mut offset = 0u32;
                for change in &header.stack_changes {
                    offset = offset.wrapping_add(change.delta());
                    lines.push(format!("  stack change    {offset:04x} {}", stack_change(change)));
                }
            }
            Architecture::Arm => {
                if header.parm_regs_pushed != 0 {
                    lines.push(format!("  pushed params   0x{:x}", header.parm_regs_pushed));
                }
                if header.vfp_pushed_count != 0 {
                    lines.push(format!(
                        "  pushed vfp      d{}..d{}",
                        header.vfp_first_pushed,
                        header.vfp_first_pushed + header.vfp_pushed_count - 1
                    ));
                }
            }
            Architecture::Arm64 => {
                if header.parm_regs_pushed != 0 {
                    lines.push(format!("  pushed params   {}", header.parm_regs_pushed));
                }
                if header.vfp_pushed_mask != 0 {
                    lines.push(format!("  pushed vfp      0x{:02x}", header.vfp_pushed_mask));
                }
                if header.fplr_on_top {
                    lines.push("  fp/lr on top".to_string());
                }
                if header.reg1_return_kind != crate::gcinfo::ReturnKind::Scalar {
                    lines.push(format!("  x1 return kind  {}", header.reg1_return_kind.name()));
                }
            }
        }
        lines
    }

    fn epilog_lines(&self, epilogs: &EpilogTable) -> Vec<String>
    {
        let mut lines = vec![format!("epilogs ({})", epilogs.len())];
        lines.extend(
            epilogs
                .iter()
                .map(|epilog| format!("  {:04x} size 0x{:x}", epilog.start, epilog.size)),
        );
        lines
    }

    fn callsite_lines(&self, map: &[u8]) -> Result<Vec<String>>
    {
        let entries = callsite::entries(map, self.tables.shortcuts)?;
        let mut lines = vec![format!("callsites ({})", entries.len())];
        for entry in &entries {
            lines.push(format!("  {:04x} string 0x{:x}", entry.code_offset, entry.string_offset));
            for descriptor in decode_string(self.tables.strings, entry.string_offset)? {
                lines.push(format!("    {}", self.describe(&descriptor)));
            }
        }
        Ok(lines)
    }

    fn saved_regs(&self, header: &GcInfoHeader) -> String
    {
        let names = callee_saved_order(self.arch)
            .iter()
            .enumerate()
            .filter(|(bit, _)| header.saved_regs & (1 << bit) != 0)
            .map(|(_, reg)| regs::name(self.arch, *reg))
            .collect::<Vec<_>>();
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(" ")
        }
    }

    fn register_name(&self, index: u8) -> &'static str
    {
        callee_saved_order(self.arch)
            .get(usize::from(index))
            .map_or("?", |reg| regs::name(self.arch, *reg))
    }

    fn describe(&self, descriptor: &RootDescriptor) -> String
    {
        match *descriptor {
            RootDescriptor::RegisterSet(mask) => {
                let names = (0..5u8)
                    .filter(|bit| mask & (1 << bit) != 0)
                    .map(|bit| self.register_name(bit))
                    .collect::<Vec<_>>();
                format!("regs {}", names.join(" "))
            }
            RootDescriptor::Register { index, flags } => {
                format!("reg {}{}", self.register_name(index), slot_flags(flags))
            }
            RootDescriptor::LocalSlotSet(mask) => {
                let slots = (0..4u8)
                    .filter(|slot| mask & (1 << slot) != 0)
                    .map(|slot| slot.to_string())
                    .collect::<Vec<_>>();
                format!("locals {}", slots.join(" "))
            }
            RootDescriptor::LocalSlot(slot) => format!("local {slot}"),
            RootDescriptor::StackSlots {
                frame_relative,
                offset,
                mask,
                flags,
            } => {
                let base = if frame_relative { "fp" } else { "sp" };
                let sign = if offset < 0 { '-' } else { '+' };
                let mask = if mask == 0 {
                    String::new()
                } else {
                    format!(" mask 0x{mask:x}")
                };
                format!("[{base}{sign}0x{:x}]{mask}{}", offset.unsigned_abs(), slot_flags(flags))
            }
            RootDescriptor::ScratchRegisters { regs, interior, pinned } => {
                format!("scratch 0x{regs:02x} interior 0x{interior:02x} pinned 0x{pinned:02x}")
            }
        }
    }
}

fn callee_saved_order(arch: Architecture) -> &'static [u8]
{
    match arch {
        Architecture::X86 | Architecture::Amd64 => &order::AMD64,
        Architecture::Arm => &order::ARM,
        Architecture::Arm64 => &order::ARM64,
    }
}

fn slot_flags(flags: GcSlotFlags) -> &'static str
{
    match (flags.contains(GcSlotFlags::INTERIOR), flags.contains(GcSlotFlags::PINNED)) {
        (false, false) => "",
        (true, false) => " (interior)",
        (false, true) => " (pinned)",
        (true, true) => " (interior pinned)",
    }
}

fn stack_change(change: &StackChange) -> String
{
    match *change {
        StackChange::Forward { .. } => "forward".to_string(),
        StackChange::Push { .. } => "push".to_string(),
        StackChange::Pop { count, last, .. } => {
            format!("pop {count}{}", if last { " (last)" } else { "" })
        }
    }
}

fn yes_no(value: bool) -> &'static str
{
    if value {
        "yes"
    } else {
        "no"
    }
}

fn join(lines: Vec<String>) -> String
{
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::gcref::DeltaShortcuts;

    #[test]
    fn test_saved_regs_names()
    {
        let shortcuts = DeltaShortcuts([0; 16]);
        let dumper = GcInfoDumper::new(
            Architecture::Amd64,
            CallsiteTables {
                shortcuts: &shortcuts,
                strings: &[],
            },
        );
        let header = GcInfoHeader {
            saved_regs: 0x09,
            ..GcInfoHeader::new(Architecture::Amd64)
        };
        assert!(dumper.dump_header(&header).contains("saved regs      rbx rbp"));
    }

    #[test]
    fn test_stack_slot_description()
    {
        let shortcuts = DeltaShortcuts([0; 16]);
        let dumper = GcInfoDumper::new(
            Architecture::Amd64,
            CallsiteTables {
                shortcuts: &shortcuts,
                strings: &[],
            },
        );
        let descriptor = RootDescriptor::StackSlots {
            frame_relative: true,
            offset: -0x10,
            mask: 0,
            flags: GcSlotFlags::INTERIOR,
        };
        assert_eq!(dumper.describe(&descriptor), "[fp-0x10] (interior)");
    }
}
