//! Tests for the reference walking scenarios: one body unwind, one callsite
//! lookup, two root reports, one reverse-PInvoke frame and one EH clause.

use pretty_assertions::assert_eq;
use stackroots_core::codeman::{CodeManager, LegacyCodeManager, LegacyMethod, LegacyModuleWriter};
use stackroots_core::eh::{ClauseHandler, EhEnumState, TypeReference};
use stackroots_core::gcinfo::{Amd64SavedRegs, GcInfoHeader, ReturnKind};
use stackroots_core::gcref::{self, CallsiteEntry, DeltaShortcuts, GcRoot, GcSlotFlags, RootContext, RootDescriptor};
use stackroots_core::image::ModuleImage;
use stackroots_core::memory::SnapshotMemory;
use stackroots_core::regdisplay::regs::amd64;
use stackroots_core::regdisplay::RegDisplay;
use stackroots_core::{Address, Architecture};

const BASE: Address = Address::new(0x40_0000);

/// Build a one-method legacy module and return its manager and method start.
fn legacy_module(method: LegacyMethod) -> (LegacyCodeManager, Address)
{
    let mut writer = LegacyModuleWriter::new(Architecture::Amd64, DeltaShortcuts::default());
    writer.add_strings(&[0x21]);
    let offset = writer.add_method(method);
    let image = writer.build(BASE).unwrap();
    let manager = LegacyCodeManager::new(image, Vec::new()).unwrap();
    let start = BASE + u64::from(LegacyModuleWriter::TEXT_RVA) + u64::from(offset);
    (manager, start)
}

fn framed_header() -> GcInfoHeader
{
    GcInfoHeader {
        prolog_size: 8,
        frame_size: 0x20,
        saved_regs: (Amd64SavedRegs::RBX | Amd64SavedRegs::RBP).bits(),
        has_frame_pointer: true,
        x64_frame_ptr_offset: 5,
        return_kind: ReturnKind::Object,
        ..GcInfoHeader::new(Architecture::Amd64)
    }
}

#[test]
fn test_body_unwind_restores_saved_registers()
{
    let mut method = LegacyMethod::new(framed_header(), vec![0x90; 0x20]);
    method.callsites.push(CallsiteEntry {
        code_offset: 0x12,
        string_offset: 0,
    });
    let (manager, start) = legacy_module(method);

    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7ffc_0028), 0x7ffc_0040);
    memory.write_pointer(Architecture::Amd64, Address::new(0x7ffc_0030), 0x40_5678);

    let mut display = RegDisplay::new(Architecture::Amd64);
    display.sp = Address::new(0x7ffc_0000);
    display.ip = start + 0x12;
    display.set_slot(amd64::RBP, Some(Address::new(0x7ffc_0028)));
    display.spill(&mut memory, Address::new(0x1000_0000), amd64::RBX, 0x2000_0000);

    let info = manager.find_method_info(display.ip).unwrap();
    assert_eq!(info.code_offset, 0x12);
    assert_eq!(info.header.return_kind, ReturnKind::Object);

    let mut roots = Vec::new();
    manager
        .enum_gc_refs(&info, display.ip, &display, &memory, &mut |root| roots.push(root))
        .unwrap();
    assert_eq!(
        roots,
        vec![GcRoot {
            slot: Address::new(0x1000_0000 + 3 * 8),
            flags: GcSlotFlags::empty(),
        }]
    );

    let outcome = manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(outcome.prev_transition_frame, None);
    assert_eq!(display.sp, Address::new(0x7ffc_0038));
    assert_eq!(display.ip, Address::new(0x40_5678));
    assert_eq!(display.p_ip, Some(Address::new(0x7ffc_0030)));
    assert_eq!(display.slot(amd64::RBX), Some(Address::new(0x7ffc_0020)));
    assert_eq!(display.slot(amd64::RBP), Some(Address::new(0x7ffc_0028)));
}

#[test]
fn test_forwarder_intermediate_offset_is_skipped()
{
    let mut table = [0u8; 16];
    table[1] = 8;
    let shortcuts = DeltaShortcuts(table);
    let map = [0x80, 0x40, 0x08, 0xff];

    assert_eq!(gcref::find_callsite(&map, &shortcuts, 64).unwrap(), None);
    assert_eq!(gcref::find_callsite(&map, &shortcuts, 72).unwrap(), Some(0));
}

fn report_all(header: &GcInfoHeader, display: &RegDisplay, memory: &SnapshotMemory, string: &[u8]) -> Vec<GcRoot>
{
    let ctx = RootContext {
        header,
        display,
        memory,
    };
    let mut roots = Vec::new();
    for descriptor in gcref::decode_string(string, 0).unwrap() {
        gcref::report_descriptor(&ctx, &descriptor, &mut |root| roots.push(root)).unwrap();
    }
    roots
}

#[test]
fn test_register_set_reports_slot_pointers()
{
    let mut memory = SnapshotMemory::new();
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.spill(&mut memory, Address::new(0x5000), amd64::RBX, 0x1111);
    display.spill(&mut memory, Address::new(0x5000), amd64::RSI, 0x2222);
    let header = GcInfoHeader::new(Architecture::Amd64);

    assert_eq!(gcref::decode_string(&[0x23], 0).unwrap(), vec![RootDescriptor::RegisterSet(0x03)]);
    let roots = report_all(&header, &display, &memory, &[0x23]);
    assert_eq!(
        roots,
        vec![
            GcRoot {
                slot: display.slot(amd64::RBX).unwrap(),
                flags: GcSlotFlags::empty(),
            },
            GcRoot {
                slot: display.slot(amd64::RSI).unwrap(),
                flags: GcSlotFlags::empty(),
            },
        ]
    );
}

#[test]
fn test_frame_relative_pinned_interior_slot()
{
    let mut memory = SnapshotMemory::new();
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.spill(&mut memory, Address::new(0x5000), amd64::RBP, 0x7ffc_0100);
    let header = GcInfoHeader {
        has_frame_pointer: true,
        ..GcInfoHeader::new(Architecture::Amd64)
    };

    let roots = report_all(&header, &display, &memory, &[0xfc, 0x10]);
    assert_eq!(
        roots,
        vec![GcRoot {
            slot: Address::new(0x7ffc_0110),
            flags: GcSlotFlags::INTERIOR | GcSlotFlags::PINNED,
        }]
    );
}

#[test]
fn test_reverse_pinvoke_returns_transition_frame()
{
    let header = GcInfoHeader {
        prolog_size: 4,
        frame_size: 0x40,
        return_kind: ReturnKind::ToNative,
        reverse_pinvoke_offset: -0x20,
        ..GcInfoHeader::new(Architecture::Amd64)
    };
    let (manager, start) = legacy_module(LegacyMethod::new(header, vec![0x90; 0x10]));

    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7ffc_00e0), 0x7ffd_0000);
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.spill(&mut memory, Address::new(0x5000), amd64::RBP, 0x7ffc_0100);
    display.sp = Address::new(0x7ffc_0080);
    display.ip = start + 8;

    let info = manager.find_method_info(display.ip).unwrap();
    assert!(info.is_reverse_pinvoke());

    let before = display.clone();
    let outcome = manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(outcome.prev_transition_frame, Some(Address::new(0x7ffd_0000)));
    assert_eq!(display, before);
}

#[test]
fn test_typed_clause_with_module_rva()
{
    let base = Address::new(0x1000_0000);
    let table = vec![0x01, 0x10, 0x80, 0x01, 0x40, 0x45, 0x23, 0x01, 0x00];
    let image = ModuleImage::new(Architecture::Amd64, base).with_section(".rdata", base + 0x3000, table);
    let method_start = base + 0x1200;

    let types = TypeReference::ModuleRva { module_base: base };
    let mut state = EhEnumState::new(&image, method_start, base + 0x3000, types).unwrap();
    assert_eq!(state.count(), 1);

    let clauses = state.collect_all(&image).unwrap();
    assert_eq!(clauses.len(), 1);
    assert_eq!(clauses[0].try_start_offset, 0x10);
    assert_eq!(clauses[0].try_end_offset, 0x30);
    assert_eq!(
        clauses[0].handler,
        ClauseHandler::Typed {
            handler_offset: 0x40,
            handler: method_start + 0x40,
            target_type: base + 0x12345,
        }
    );
}

#[test]
fn test_forwarder_is_not_a_preceding_callsite()
{
    let mut table = [0u8; 16];
    table[1] = 8;
    let shortcuts = DeltaShortcuts(table);
    let map = [0x80, 0x40, 0x08, 0xff];

    assert_eq!(gcref::find_callsite_at_or_before(&map, &shortcuts, 70).unwrap(), None);
    assert_eq!(gcref::find_callsite_at_or_before(&map, &shortcuts, 0x50).unwrap(), Some(0));
}
