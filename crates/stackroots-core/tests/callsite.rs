//! Tests for resolving callsite strings into reported root slots

use pretty_assertions::assert_eq;
use stackroots_core::gcinfo::{Amd64SavedRegs, GcInfoHeader};
use stackroots_core::gcref::descriptor::encode_string;
use stackroots_core::gcref::{
    callsite, enum_gc_refs, CallsiteEntry, CallsiteTables, DeltaShortcuts, GcEnumFlags, GcRoot, GcSlotFlags,
    RootContext, RootDescriptor,
};
use stackroots_core::memory::SnapshotMemory;
use stackroots_core::regdisplay::regs::amd64;
use stackroots_core::regdisplay::RegDisplay;
use stackroots_core::{Address, Architecture};

const FP: u64 = 0x7000;

struct Method
{
    map: Vec<u8>,
    strings: Vec<u8>,
}

/// Callsites at 0x10 (registers and a pinned frame slot), 0x20 (two locals)
/// and 0x30 (scratch RAX as interior)
fn method() -> Method
{
    let mut strings = Vec::new();
    encode_string(
        &[
            RootDescriptor::RegisterSet(0b101),
            RootDescriptor::StackSlots {
                frame_relative: true,
                offset: -0x10,
                mask: 0,
                flags: GcSlotFlags::PINNED,
            },
        ],
        &mut strings,
    );
    let locals = strings.len() as u32;
    encode_string(&[RootDescriptor::LocalSlotSet(0b11)], &mut strings);
    let scratch = strings.len() as u32;
    encode_string(
        &[RootDescriptor::ScratchRegisters {
            regs: 0b1,
            interior: 0b1,
            pinned: 0,
        }],
        &mut strings,
    );

    let entries = [
        CallsiteEntry {
            code_offset: 0x10,
            string_offset: 0,
        },
        CallsiteEntry {
            code_offset: 0x20,
            string_offset: locals,
        },
        CallsiteEntry {
            code_offset: 0x30,
            string_offset: scratch,
        },
    ];
    let mut map = Vec::new();
    callsite::encode(&entries, &DeltaShortcuts::default(), &mut map);
    Method { map, strings }
}

fn header() -> GcInfoHeader
{
    GcInfoHeader {
        has_frame_pointer: true,
        frame_size: 0x20,
        saved_regs: (Amd64SavedRegs::RBX | Amd64SavedRegs::RBP).bits(),
        ..GcInfoHeader::new(Architecture::Amd64)
    }
}

fn display(memory: &mut SnapshotMemory) -> RegDisplay
{
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.spill(memory, Address::new(0x9000), amd64::RBX, 0x1111);
    display.spill(memory, Address::new(0x9000), amd64::RDI, 0x2222);
    display.spill(memory, Address::new(0x9000), amd64::RBP, FP);
    display.sp = Address::new(0x6f00);
    display
}

fn roots_at(method: &Method, display: &RegDisplay, memory: &SnapshotMemory, offset: u32, flags: GcEnumFlags) -> Vec<GcRoot>
{
    let header = header();
    let shortcuts = DeltaShortcuts::default();
    let ctx = RootContext {
        header: &header,
        display,
        memory,
    };
    let tables = CallsiteTables {
        shortcuts: &shortcuts,
        strings: &method.strings,
    };
    let mut roots = Vec::new();
    enum_gc_refs(&ctx, &method.map, tables, offset, flags, &mut |root| roots.push(root)).unwrap();
    roots
}

fn root(slot: Address, flags: GcSlotFlags) -> GcRoot
{
    GcRoot { slot, flags }
}

#[test]
fn test_registers_and_frame_slot()
{
    let method = method();
    let mut memory = SnapshotMemory::new();
    let display = display(&mut memory);

    let roots = roots_at(&method, &display, &memory, 0x10, GcEnumFlags::empty());
    assert_eq!(
        roots,
        vec![
            root(display.slot(amd64::RBX).unwrap(), GcSlotFlags::empty()),
            root(display.slot(amd64::RDI).unwrap(), GcSlotFlags::empty()),
            root(Address::new(FP - 0x10), GcSlotFlags::PINNED),
        ]
    );
}

#[test]
fn test_filter_skips_frame_slots()
{
    let method = method();
    let mut memory = SnapshotMemory::new();
    let display = display(&mut memory);

    let roots = roots_at(&method, &display, &memory, 0x10, GcEnumFlags::NO_REPORT_UNTRACKED);
    assert_eq!(roots.len(), 2);
    assert!(roots.iter().all(|root| root.slot.value() >= 0x9000));
    assert!(roots_at(&method, &display, &memory, 0x20, GcEnumFlags::NO_REPORT_UNTRACKED).is_empty());
}

#[test]
fn test_locals_below_saved_registers()
{
    let method = method();
    let mut memory = SnapshotMemory::new();
    let display = display(&mut memory);

    // Two pushed registers sit between the frame pointer and local slot 0.
    let roots = roots_at(&method, &display, &memory, 0x20, GcEnumFlags::empty());
    assert_eq!(
        roots,
        vec![
            root(Address::new(FP - 0x10), GcSlotFlags::empty()),
            root(Address::new(FP - 0x18), GcSlotFlags::empty()),
        ]
    );
}

#[test]
fn test_scratch_register_needs_a_slot()
{
    let method = method();
    let mut memory = SnapshotMemory::new();
    let mut display = display(&mut memory);
    assert!(roots_at(&method, &display, &memory, 0x30, GcEnumFlags::EXECUTION_ABORTED).is_empty());

    display.spill(&mut memory, Address::new(0x9000), amd64::RAX, 0x3333);
    let roots = roots_at(&method, &display, &memory, 0x30, GcEnumFlags::EXECUTION_ABORTED);
    assert_eq!(roots, vec![root(Address::new(0x9000), GcSlotFlags::INTERIOR)]);
}

#[test]
fn test_offset_without_callsite_reports_nothing()
{
    let method = method();
    let mut memory = SnapshotMemory::new();
    let display = display(&mut memory);
    for offset in [0, 0x8, 0x18, 0x40] {
        assert!(roots_at(&method, &display, &memory, offset, GcEnumFlags::empty()).is_empty(), "{offset:#x}");
    }
}

#[test]
fn test_aborted_frame_uses_preceding_callsite()
{
    let method = method();
    let mut memory = SnapshotMemory::new();
    let display = display(&mut memory);

    assert!(roots_at(&method, &display, &memory, 0x18, GcEnumFlags::empty()).is_empty());
    let aborted = roots_at(&method, &display, &memory, 0x18, GcEnumFlags::EXECUTION_ABORTED);
    assert!(!aborted.is_empty());
    assert_eq!(aborted, roots_at(&method, &display, &memory, 0x10, GcEnumFlags::empty()));

    assert_eq!(
        roots_at(&method, &display, &memory, 0x28, GcEnumFlags::EXECUTION_ABORTED),
        roots_at(&method, &display, &memory, 0x20, GcEnumFlags::empty())
    );
    assert!(roots_at(&method, &display, &memory, 0x8, GcEnumFlags::EXECUTION_ABORTED).is_empty());
}
