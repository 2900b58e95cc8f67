//! Tests for PE modules: x64 unwind data, funclet blobs and reverse-PInvoke roots

use pretty_assertions::assert_eq;
use stackroots_core::codeman::coff::Win64ModuleWriter;
use stackroots_core::codeman::{CodeManager, FuncletKind, MethodFlags, MethodInfoBlob, Win64CodeManager};
use stackroots_core::eh::{ClauseHandler, EhClause};
use stackroots_core::gcinfo::{GcInfoHeader, ReturnKind};
use stackroots_core::gcref::{callsite, CallsiteEntry, DeltaShortcuts, GcRoot, GcSlotFlags};
use stackroots_core::memory::SnapshotMemory;
use stackroots_core::regdisplay::regs::amd64;
use stackroots_core::regdisplay::RegDisplay;
use stackroots_core::unwind::{UnwindCode, UnwindInfo, UnwindOp};
use stackroots_core::varint::encode_unsigned;
use stackroots_core::{Address, Architecture};

const BASE: Address = Address::new(0x1_4000_0000);
const ROOT: Address = Address::new(0x1_4000_1000);

/// push rbx; sub rsp, 0x20; body; add rsp, 0x20; pop rbx; ret
const ROOT_CODE: [u8; 16] = [
    0x53, 0x48, 0x83, 0xec, 0x20, 0x90, 0x90, 0x90, 0x90, 0x90, 0x48, 0x83, 0xc4, 0x20, 0x5b, 0xc3,
];

/// sub rsp, 0x28; body; add rsp, 0x28; ret
const FUNCLET_CODE: [u8; 10] = [0x48, 0x83, 0xec, 0x28, 0x90, 0x48, 0x83, 0xc4, 0x28, 0xc3];

fn root_unwind() -> UnwindInfo
{
    UnwindInfo::new(
        5,
        vec![
            UnwindCode {
                prolog_offset: 5,
                op: UnwindOp::Alloc { size: 0x20 },
            },
            UnwindCode {
                prolog_offset: 1,
                op: UnwindOp::PushNonvol { reg: amd64::RBX },
            },
        ],
    )
}

fn root_gc_info(header: &GcInfoHeader) -> Vec<u8>
{
    let mut gc_info = Vec::new();
    header.encode(&mut gc_info).unwrap();
    let entries = [CallsiteEntry {
        code_offset: 7,
        string_offset: 0,
    }];
    callsite::encode(&entries, &DeltaShortcuts::default(), &mut gc_info);
    gc_info
}

fn module(root_blob: MethodInfoBlob, header: &GcInfoHeader, eh_table: Option<&[u8]>) -> Win64CodeManager
{
    let mut writer = Win64ModuleWriter::new(0x1000, 0x4000);
    let root_blob = MethodInfoBlob {
        eh_info_rva: eh_table.map(|table| writer.add_data(table)),
        ..root_blob
    };
    let root = writer.add_root(&ROOT_CODE, &root_unwind(), root_blob, &root_gc_info(header));
    let funclet_unwind = UnwindInfo::new(
        4,
        vec![UnwindCode {
            prolog_offset: 4,
            op: UnwindOp::Alloc { size: 0x28 },
        }],
    );
    writer.add_funclet(root, FuncletKind::Handler, &FUNCLET_CODE, &funclet_unwind);

    let image = writer.build(BASE, &DeltaShortcuts::default(), &[0x21]);
    Win64CodeManager::new(image, Vec::new()).unwrap()
}

fn plain_module() -> Win64CodeManager
{
    let header = GcInfoHeader {
        prolog_size: 5,
        ..GcInfoHeader::new(Architecture::Amd64)
    };
    module(MethodInfoBlob::root(), &header, None)
}

fn display_at(ip: Address, sp: u64) -> RegDisplay
{
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.ip = ip;
    display.sp = Address::new(sp);
    display
}

#[test]
fn test_body_unwind_replays_all_codes()
{
    let manager = plain_module();
    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7028), 0x1_4000_2000);

    let mut display = display_at(ROOT + 7, 0x7000);
    let info = manager.find_method_info(display.ip).unwrap();
    assert_eq!(info.method_start, ROOT);
    assert_eq!(info.kind, FuncletKind::Root);

    manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(display.slot(amd64::RBX), Some(Address::new(0x7020)));
    assert_eq!(display.ip, Address::new(0x1_4000_2000));
    assert_eq!(display.p_ip, Some(Address::new(0x7028)));
    assert_eq!(display.sp, Address::new(0x7030));
}

#[test]
fn test_mid_prolog_replays_only_executed_codes()
{
    let manager = plain_module();
    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7028), 0x1_4000_2000);

    // push rbx has run, sub rsp has not
    let mut display = display_at(ROOT + 1, 0x7020);
    let info = manager.find_method_info(display.ip).unwrap();
    manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(display.slot(amd64::RBX), Some(Address::new(0x7020)));
    assert_eq!(display.sp, Address::new(0x7030));

    // nothing has run yet
    let mut display = display_at(ROOT, 0x7028);
    let info = manager.find_method_info(display.ip).unwrap();
    manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(display.slot(amd64::RBX), None);
    assert_eq!(display.sp, Address::new(0x7030));
}

#[test]
fn test_epilog_is_executed_forward()
{
    let manager = plain_module();
    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7028), 0x1_4000_2000);

    for (offset, sp) in [(10u64, 0x7000u64), (14, 0x7020), (15, 0x7028)] {
        let mut display = display_at(ROOT + offset, sp);
        let info = manager.find_method_info(display.ip).unwrap();
        manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
        assert_eq!(display.sp, Address::new(0x7030), "offset {offset}");
        assert_eq!(display.ip, Address::new(0x1_4000_2000), "offset {offset}");
        if offset < 15 {
            assert_eq!(display.slot(amd64::RBX), Some(Address::new(0x7020)));
        }
    }
}

#[test]
fn test_funclet_resolves_to_root_blob()
{
    let manager = plain_module();
    let funclet_start = ROOT + ROOT_CODE.len() as u64;
    let info = manager.find_method_info(funclet_start + 4).unwrap();

    assert_eq!(info.kind, FuncletKind::Handler);
    assert!(info.is_funclet());
    assert_eq!(info.method_start, ROOT);
    assert_eq!(info.body_start, funclet_start);
    assert_eq!(info.code_offset, ROOT_CODE.len() as u32 + 4);

    // One step from the funclet blob reaches a root blob.
    let parent = info.parent_blob.unwrap();
    let (root, _) = MethodInfoBlob::decode(manager.image(), parent).unwrap();
    assert_eq!(root.kind(), FuncletKind::Root);
    let root_info = manager.find_method_info(ROOT + 7).unwrap();
    assert_eq!(root_info.blob, Some(parent));
    assert_eq!(root_info.parent_blob, None);
}

#[test]
fn test_funclet_unwind_and_no_hijack()
{
    let manager = plain_module();
    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x6028), 0x1_4000_1007);

    let funclet_start = ROOT + ROOT_CODE.len() as u64;
    let mut display = display_at(funclet_start + 4, 0x6000);
    let info = manager.find_method_info(display.ip).unwrap();
    assert_eq!(manager.get_return_address_hijack_info(&info, &display, &memory).unwrap(), None);

    manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(display.sp, Address::new(0x6030));
    assert_eq!(display.ip, ROOT + 7);
}

#[test]
fn test_hijack_slot_is_below_caller_sp()
{
    let manager = plain_module();
    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7028), 0x1_4000_2000);

    let display = display_at(ROOT + 7, 0x7000);
    let info = manager.find_method_info(display.ip).unwrap();
    let hijack = manager
        .get_return_address_hijack_info(&info, &display, &memory)
        .unwrap()
        .unwrap();
    assert_eq!(hijack.return_address_slot, Address::new(0x7028));
    assert_eq!(display.sp, Address::new(0x7000));
}

#[test]
fn test_roots_from_module_strings()
{
    let manager = plain_module();
    let mut memory = SnapshotMemory::new();
    let mut display = display_at(ROOT + 7, 0x7000);
    display.spill(&mut memory, Address::new(0x9000), amd64::RBX, 0x5000);

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
}

#[test]
fn test_reverse_pinvoke_flag_returns_transition_frame()
{
    let header = GcInfoHeader {
        prolog_size: 5,
        return_kind: ReturnKind::ToNative,
        reverse_pinvoke_offset: 0x18,
        ..GcInfoHeader::new(Architecture::Amd64)
    };
    let blob = MethodInfoBlob {
        flags: MethodFlags::REVERSE_PINVOKE,
        ..MethodInfoBlob::root()
    };
    let manager = module(blob, &header, None);

    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::Amd64, Address::new(0x7018), 0x7_0000);
    let mut display = display_at(ROOT + 7, 0x7000);
    let info = manager.find_method_info(display.ip).unwrap();
    assert!(info.is_reverse_pinvoke());

    let outcome = manager.unwind_stack_frame(&info, &mut display, &memory).unwrap();
    assert_eq!(outcome.prev_transition_frame, Some(Address::new(0x7_0000)));
    assert_eq!(display.sp, Address::new(0x7000));
}

#[test]
fn test_eh_clauses_use_module_rvas()
{
    let funclet_offset = ROOT_CODE.len() as u32;
    let mut table = Vec::new();
    encode_unsigned(1, &mut table);
    let clause = EhClause {
        try_start_offset: 5,
        try_end_offset: 10,
        handler: ClauseHandler::Typed {
            handler_offset: funclet_offset,
            handler: Address::ZERO,
            target_type: Address::ZERO,
        },
    };
    stackroots_core::eh::encode_clause(&clause, &0x8000_u32.to_le_bytes(), &mut table);

    let header = GcInfoHeader {
        prolog_size: 5,
        ..GcInfoHeader::new(Architecture::Amd64)
    };
    let manager = module(MethodInfoBlob::root(), &header, Some(&table));

    let info = manager.find_method_info(ROOT + 7).unwrap();
    assert!(info.flags.contains(MethodFlags::HAS_EHINFO));
    let mut state = manager.eh_enum_init(&info).unwrap().unwrap();
    let clauses = state.collect_all(manager.image()).unwrap();
    assert_eq!(
        clauses,
        vec![EhClause {
            try_start_offset: 5,
            try_end_offset: 10,
            handler: ClauseHandler::Typed {
                handler_offset: funclet_offset,
                handler: ROOT + u64::from(funclet_offset),
                target_type: BASE + 0x8000,
            },
        }]
    );
}
