//! Tests for header-driven unwinding of legacy ARM, x86 and ARM64 frames

use pretty_assertions::assert_eq;
use stackroots_core::codeman::{CodeManager, LegacyCodeManager, LegacyMethod, LegacyModuleWriter};
use stackroots_core::gcinfo::{Amd64SavedRegs, ArmSavedRegs, GcInfoHeader};
use stackroots_core::gcref::DeltaShortcuts;
use stackroots_core::memory::SnapshotMemory;
use stackroots_core::regdisplay::regs::{arm, x86};
use stackroots_core::regdisplay::RegDisplay;
use stackroots_core::{Address, Architecture, WalkError};

const BASE: Address = Address::new(0x40_0000);
const TEXT: Address = Address::new(0x40_1000);

fn single_method(header: GcInfoHeader) -> LegacyCodeManager
{
    let arch = header.arch;
    let mut writer = LegacyModuleWriter::new(arch, DeltaShortcuts::default());
    writer.add_method(LegacyMethod::new(header, vec![0; 0x20]));
    LegacyCodeManager::new(writer.build(BASE).unwrap(), Vec::new()).unwrap()
}

fn unwind_at(manager: &LegacyCodeManager, display: &mut RegDisplay, memory: &SnapshotMemory) -> Result<(), WalkError>
{
    let info = manager.find_method_info(display.ip)?;
    manager.unwind_stack_frame(&info, display, memory).map(|_| ())
}

#[test]
fn test_arm_body_with_vfp_and_pushed_arguments()
{
    // push {r0, r1}; push {r4, r5, lr}; vpush {d8}; sub sp, #8
    let manager = single_method(GcInfoHeader {
        prolog_size: 8,
        frame_size: 8,
        saved_regs: (ArmSavedRegs::R4 | ArmSavedRegs::R5 | ArmSavedRegs::LR).bits(),
        vfp_first_pushed: 8,
        vfp_pushed_count: 1,
        parm_regs_pushed: 0b0011,
        ..GcInfoHeader::new(Architecture::Arm)
    });

    let mut memory = SnapshotMemory::new();
    memory.write_bytes(Address::new(0x4008), &0x1122_3344_5566_7788_u64.to_le_bytes());
    memory.write_pointer(Architecture::Arm, Address::new(0x4018), 0x40_2000);

    let mut display = RegDisplay::new(Architecture::Arm);
    display.sp = Address::new(0x4000);
    display.ip = TEXT + 0x10;
    unwind_at(&manager, &mut display, &memory).unwrap();

    assert_eq!(display.d[0], 0x1122_3344_5566_7788);
    assert_eq!(display.slot(arm::R4), Some(Address::new(0x4010)));
    assert_eq!(display.slot(arm::R5), Some(Address::new(0x4014)));
    assert_eq!(display.ip, Address::new(0x40_2000));
    assert_eq!(display.p_ip, Some(Address::new(0x4018)));
    // return address plus the two pushed argument registers
    assert_eq!(display.sp, Address::new(0x4024));
}

#[test]
fn test_arm_leaf_returns_through_lr()
{
    let manager = single_method(GcInfoHeader {
        prolog_size: 2,
        saved_regs: ArmSavedRegs::R4.bits(),
        ..GcInfoHeader::new(Architecture::Arm)
    });

    let mut memory = SnapshotMemory::new();
    let mut display = RegDisplay::new(Architecture::Arm);
    display.sp = Address::new(0x4000);
    display.ip = TEXT + 0x8;
    let err = unwind_at(&manager, &mut display, &memory).unwrap_err();
    assert!(matches!(err, WalkError::UnwindStepFailed(_)));
    assert!(err.is_end_of_walk());

    display.spill(&mut memory, Address::new(0x9000), arm::LR, 0x40_3000);
    unwind_at(&manager, &mut display, &memory).unwrap();
    assert_eq!(display.ip, Address::new(0x40_3000));
    assert_eq!(display.p_ip, display.slot(arm::LR));
    assert_eq!(display.slot(arm::R4), Some(Address::new(0x4000)));
    assert_eq!(display.sp, Address::new(0x4004));
}

#[test]
fn test_x86_frameless_pops_arguments()
{
    let manager = single_method(GcInfoHeader {
        prolog_size: 2,
        frame_size: 8,
        saved_regs: (Amd64SavedRegs::RBX | Amd64SavedRegs::RDI).bits(),
        return_pop_size: 0xc,
        ..GcInfoHeader::new(Architecture::X86)
    });

    let mut memory = SnapshotMemory::new();
    memory.write_pointer(Architecture::X86, Address::new(0x6010), 0x40_4000);
    let mut display = RegDisplay::new(Architecture::X86);
    display.sp = Address::new(0x6000);
    display.ip = TEXT + 0x8;
    unwind_at(&manager, &mut display, &memory).unwrap();

    assert_eq!(display.slot(x86::EBX), Some(Address::new(0x6008)));
    assert_eq!(display.slot(x86::EDI), Some(Address::new(0x600c)));
    assert_eq!(display.slot(x86::ESI), None);
    assert_eq!(display.ip, Address::new(0x40_4000));
    assert_eq!(display.sp, Address::new(0x6014 + 0xc));
}

#[test]
fn test_prolog_cannot_be_unwound()
{
    let manager = single_method(GcInfoHeader {
        prolog_size: 6,
        frame_size: 0x10,
        ..GcInfoHeader::new(Architecture::Amd64)
    });
    let memory = SnapshotMemory::new();
    let mut display = RegDisplay::new(Architecture::Amd64);
    display.sp = Address::new(0x6000);
    display.ip = TEXT + 5;

    let err = unwind_at(&manager, &mut display, &memory).unwrap_err();
    assert!(matches!(err, WalkError::PrologSuspension { offset: 5 }));
    assert!(err.is_fatal());
    assert_eq!(display.sp, Address::new(0x6000));
}

#[test]
fn test_arm64_legacy_frames_rejected()
{
    let manager = single_method(GcInfoHeader {
        prolog_size: 8,
        ..GcInfoHeader::new(Architecture::Arm64)
    });
    let memory = SnapshotMemory::new();
    let mut display = RegDisplay::new(Architecture::Arm64);
    display.ip = TEXT + 0x10;
    let err = unwind_at(&manager, &mut display, &memory).unwrap_err();
    assert!(matches!(err, WalkError::InvalidArgument(_)));
}
