//! Tests for ELF-style modules: CFI unwinding, LSDA blobs and funclets

use gimli::write::CallFrameInstruction;
use gimli::X86_64;
use pretty_assertions::assert_eq;
use stackroots_core::codeman::unix::DwarfModuleWriter;
use stackroots_core::codeman::{CodeManager, DwarfCodeManager, FuncletKind, MethodInfoBlob};
use stackroots_core::eh::{ClauseHandler, EhClause};
use stackroots_core::gcinfo::{GcInfoHeader, ReturnKind};
use stackroots_core::gcref::{callsite, CallsiteEntry, DeltaShortcuts, GcRoot, GcSlotFlags};
use stackroots_core::memory::SnapshotMemory;
use stackroots_core::regdisplay::regs::amd64;
use stackroots_core::regdisplay::RegDisplay;
use stackroots_core::varint::encode_unsigned;
use stackroots_core::{Address, Architecture, WalkError};

const BASE: Address = Address::new(0x7f00_0000_0000);
const ROOT: Address = Address::new(0x7f00_0000_1000);
const FUNCLET: Address = Address::new(0x7f00_0000_1020);

/// push rbp; mov rbp, rsp; push rbx; body
fn root_cfi() -> Vec<(u32, CallFrameInstruction)>
{
    vec![
        (1, CallFrameInstruction::CfaOffset(16)),
        (1, CallFrameInstruction::Offset(X86_64::RBP, -16)),
        (4, CallFrameInstruction::CfaRegister(X86_64::RBP)),
        (5, CallFrameInstruction::Offset(X86_64::RBX, -24)),
    ]
}

fn gc_info(header: &GcInfoHeader) -> Vec<u8>
{
    let mut bytes = Vec::new();
    header.encode(&mut bytes).unwrap();
    let entries = [CallsiteEntry {
        code_offset: 0x10,
        string_offset: 0,
    }];
    callsite::encode(&entries, &DeltaShortcuts::default(), &mut bytes);
    bytes
}

fn framed_header() -> GcInfoHeader
{
    GcInfoHeader {
        prolog_size: 5,
        has_frame_pointer: true,
        ..GcInfoHeader::new(Architecture::Amd64)
    }
}

fn module(header: &GcInfoHeader, eh_table: Option<&[u8]>) -> DwarfCodeManager
{
    let mut writer = DwarfModuleWriter::new(Architecture::Amd64, 0x1000, 0x3000);
    let blob = MethodInfoBlob {
        eh_info_rva: eh_table.map(|table| writer.add_data(table)),
        ..MethodInfoBlob::root()
    };
    let root = writer.add_root(&[0x90; 0x20], root_cfi(), blob, &gc_info(header));
    writer.add_funclet(
        root,
        FuncletKind::Filter,
        &[0x90; 0x10],
        vec![(4, CallFrameInstruction::CfaOffset(0x30))],
    );
    let image = writer.build(BASE, &DeltaShortcuts::default(), &[0x21]).unwrap();
    DwarfCodeManager::new(image, Vec::new()).unwrap()
}

/// Display inside the root body with RBP = 0x7ff0 and RBX spilled at 0x9018
fn body_display(memory: &mut SnapshotMemory) -> RegDisplay
{
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.ip = ROOT + 0x10;
    display.sp = Address::new(0x7fc0);
    display.spill(memory, Address::new(0x9000), amd64::RBP, 0x7ff0);
    display.spill(memory, Address::new(0x9000), amd64::RBX, 0x5000);
    memory.write_pointer(Architecture::Amd64, Address::new(0x7ff8), 0x40_1234);
    display
}

#[test]
fn test_cfa_from_frame_pointer()
{
    let manager = module(&framed_header(), None);
    let mut memory = SnapshotMemory::new();
    let mut display = body_display(&mut memory);

    let info = manager.find_method_info(display.ip).unwrap();
    assert_eq!(info.method_start, ROOT);
    assert_eq!(info.code_offset, 0x10);
    assert_eq!(info.code_size, 0x20);

    let outcome = manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(outcome.prev_transition_frame, None);
    assert_eq!(display.sp, Address::new(0x8000));
    assert_eq!(display.ip, Address::new(0x40_1234));
    assert_eq!(display.p_ip, Some(Address::new(0x7ff8)));
    assert_eq!(display.slot(amd64::RBP), Some(Address::new(0x7ff0)));
    assert_eq!(display.slot(amd64::RBX), Some(Address::new(0x7fe8)));
}

#[test]
fn test_entry_uses_cie_rule()
{
    let manager = module(&framed_header(), None);
    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7ff8), 0x40_1234);

    let mut display = RegDisplay::new(Architecture::Amd64);
    display.ip = ROOT;
    display.sp = Address::new(0x7ff8);
    let info = manager.find_method_info(display.ip).unwrap();
    assert!(info.in_prolog());

    manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(display.sp, Address::new(0x8000));
    assert_eq!(display.ip, Address::new(0x40_1234));
    assert_eq!(display.slot(amd64::RBX), None);
}

#[test]
fn test_zero_return_address_ends_the_stack()
{
    let manager = module(&framed_header(), None);
    let mut memory = SnapshotMemory::new();
    let mut display = body_display(&mut memory);
    memory.write_pointer(Architecture::Amd64, Address::new(0x7ff8), 0);

    let info = manager.find_method_info(display.ip).unwrap();
    manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert!(display.ip.is_null());
    assert_eq!(display.p_ip, None);
}

#[test]
fn test_roots_and_hijack_slot()
{
    let manager = module(&framed_header(), None);
    let mut memory = SnapshotMemory::new();
    let display = body_display(&mut memory);
    let info = manager.find_method_info(display.ip).unwrap();

    let mut roots = Vec::new();
    manager
        .enum_gc_refs(&info, display.ip, &display, &memory, &mut |root| roots.push(root))
        .unwrap();
    assert_eq!(
        roots,
        vec![GcRoot {
            slot: Address::new(0x9000 + 3 * 8),
            flags: GcSlotFlags::empty(),
        }]
    );

    let hijack = manager
        .get_return_address_hijack_info(&info, &display, &memory)
        .unwrap()
        .unwrap();
    assert_eq!(hijack.return_address_slot, Address::new(0x7ff8));
    assert_eq!(display.ip, ROOT + 0x10);
}

#[test]
fn test_filter_funclet_resolves_through_lsda()
{
    let manager = module(&framed_header(), None);
    let info = manager.find_method_info(FUNCLET + 8).unwrap();
    assert_eq!(info.kind, FuncletKind::Filter);
    assert!(manager.is_filter(&info));
    assert_eq!(info.method_start, ROOT);
    assert_eq!(info.body_start, FUNCLET);
    assert_eq!(info.code_offset, 0x28);
    assert_eq!(info.code_size, 0x20);

    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x6028), (ROOT + 0x10).value());
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.ip = FUNCLET + 8;
    display.sp = Address::new(0x6000);
    assert_eq!(manager.get_return_address_hijack_info(&info, &display, &memory).unwrap(), None);

    manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(display.sp, Address::new(0x6030));
    assert_eq!(display.ip, ROOT + 0x10);
}

#[test]
fn test_reverse_pinvoke_frame_from_frame_pointer()
{
    let header = GcInfoHeader {
        return_kind: ReturnKind::ToNative,
        reverse_pinvoke_offset: -0x10,
        ..framed_header()
    };
    let manager = module(&header, None);
    let mut memory = SnapshotMemory::new();
    let mut display = body_display(&mut memory);
    memory.write_pointer(Architecture::Amd64, Address::new(0x7fe0), 0x7_0000);

    let info = manager.find_method_info(display.ip).unwrap();
    let before = display.clone();
    let outcome = manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(outcome.prev_transition_frame, Some(Address::new(0x7_0000)));
    assert_eq!(display, before);
}

#[test]
fn test_clause_table_from_root_blob()
{
    let mut table = Vec::new();
    encode_unsigned(2, &mut table);
    let fault = EhClause {
        try_start_offset: 4,
        try_end_offset: 0x18,
        handler: ClauseHandler::Fault {
            handler_offset: 0x20,
            handler: Address::ZERO,
        },
    };
    let filter = EhClause {
        try_start_offset: 8,
        try_end_offset: 0x10,
        handler: ClauseHandler::Filter {
            handler_offset: 0x20,
            handler: Address::ZERO,
            filter_offset: 0x20,
            filter: Address::ZERO,
        },
    };
    stackroots_core::eh::encode_clause(&fault, &[], &mut table);
    stackroots_core::eh::encode_clause(&filter, &[], &mut table);

    let manager = module(&framed_header(), Some(&table));
    // Clauses belong to the root method, also when asked from a funclet.
    let info = manager.find_method_info(FUNCLET + 8).unwrap();
    let mut state = manager.eh_enum_init(&info).unwrap().unwrap();
    assert_eq!(state.count(), 2);

    let clauses = state.collect_all(manager.image()).unwrap();
    assert_eq!(
        clauses[0].handler,
        ClauseHandler::Fault {
            handler_offset: 0x20,
            handler: FUNCLET,
        }
    );
    assert_eq!(clauses[1].filter_offset(), Some(0x20));
    assert!(clauses[1].contains(0xc));
    assert!(!clauses[1].contains(0x10));
}

#[test]
fn test_ip_outside_text_is_not_found()
{
    let manager = module(&framed_header(), None);
    let err = manager.find_method_info(BASE + 0x2000).unwrap_err();
    assert!(matches!(err, WalkError::MethodNotFound { .. }));
}
