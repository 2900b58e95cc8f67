//! Callee-saved register masks as stored in the GC-info header.
//!
//! The raw `saved_regs` field of [`GcInfoHeader`](super::GcInfoHeader) is
//! interpreted through one of these types depending on the architecture. Bit
//! order also fixes the order registers are pushed by the prolog.

use bitflags::bitflags;

bitflags! {
    /// x86 and x64 callee-saved registers
    ///
    /// x86 only encodes the low four bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Amd64SavedRegs: u16 {
        const RBX = 0x0001;
        const RSI = 0x0002;
        const RDI = 0x0004;
        const RBP = 0x0008;
        const R12 = 0x0010;
        const R13 = 0x0020;
        const R14 = 0x0040;
        const R15 = 0x0080;
    }
}

bitflags! {
    /// ARM callee-saved registers, r4..r11 and LR
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArmSavedRegs: u16 {
        const R4 = 0x0001;
        const R5 = 0x0002;
        const R6 = 0x0004;
        const R7 = 0x0008;
        const R8 = 0x0010;
        const R9 = 0x0020;
        const R10 = 0x0040;
        const R11 = 0x0080;
        const LR = 0x0100;
    }
}

bitflags! {
    /// ARM64 callee-saved registers, LR, x19..x28 and FP
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Arm64SavedRegs: u16 {
        const LR = 0x0001;
        const X19 = 0x0002;
        const X20 = 0x0004;
        const X21 = 0x0008;
        const X22 = 0x0010;
        const X23 = 0x0020;
        const X24 = 0x0040;
        const X25 = 0x0080;
        const X26 = 0x0100;
        const X27 = 0x0200;
        const X28 = 0x0400;
        const FP = 0x0800;
    }
}

bitflags! {
    /// Scratch registers a callsite may report live on x64
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Amd64ScratchRegs: u8 {
        const RAX = 0x01;
        const RCX = 0x02;
        const RDX = 0x04;
        const R8 = 0x08;
        const R9 = 0x10;
        const R10 = 0x20;
        const R11 = 0x40;
    }
}

bitflags! {
    /// Scratch registers a callsite may report live on ARM
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArmScratchRegs: u8 {
        const R0 = 0x01;
        const R1 = 0x02;
        const R2 = 0x04;
        const R3 = 0x08;
        const R12 = 0x10;
        const LR = 0x20;
    }
}

/// Register numbers (in [`crate::regdisplay::regs`] numbering) of the
/// callee-saved registers for each bit of the `saved_regs` mask.
pub mod order
{
    use crate::regdisplay::regs::{amd64, arm, arm64};

    pub const AMD64: [u8; 8] = [
        amd64::RBX,
        amd64::RSI,
        amd64::RDI,
        amd64::RBP,
        amd64::R12,
        amd64::R13,
        amd64::R14,
        amd64::R15,
    ];

    pub const ARM: [u8; 9] = [arm::R4, arm::R5, arm::R6, arm::R7, arm::R8, arm::R9, arm::R10, arm::R11, arm::LR];

    pub const ARM64: [u8; 12] = [
        arm64::LR,
        arm64::X19,
        arm64::X20,
        arm64::X21,
        arm64::X22,
        arm64::X23,
        arm64::X24,
        arm64::X25,
        arm64::X26,
        arm64::X27,
        arm64::X28,
        arm64::FP,
    ];

    pub const AMD64_SCRATCH: [u8; 7] =
        [amd64::RAX, amd64::RCX, amd64::RDX, amd64::R8, amd64::R9, amd64::R10, amd64::R11];

    pub const ARM_SCRATCH: [u8; 6] = [arm::R0, arm::R1, arm::R2, arm::R3, arm::R12, arm::LR];

    pub const ARM64_SCRATCH: [u8; 7] =
        [arm64::X0, arm64::X1, arm64::X2, arm64::X3, arm64::X4, arm64::X5, arm64::X6];
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_arm64_fp_is_top_bit()
    {
        let all = Arm64SavedRegs::all();
        assert_eq!(all.bits(), 0x0fff);
        assert_eq!(all.bits().count_ones() as usize, order::ARM64.len());
    }

    #[test]
    fn test_x86_subset()
    {
        let regs = Amd64SavedRegs::from_bits_truncate(0x0b);
        assert!(regs.contains(Amd64SavedRegs::RBX | Amd64SavedRegs::RSI | Amd64SavedRegs::RBP));
        assert!(!regs.contains(Amd64SavedRegs::RDI));
    }
}
