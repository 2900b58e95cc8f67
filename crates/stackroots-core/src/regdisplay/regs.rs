//! Register numbering used by the register display.
//!
//! Numbers follow each architecture's machine encoding, so the GC-info and
//! callsite decoders can index the display directly with the register field
//! of an encoded descriptor.

use crate::types::Architecture;

/// 32-bit x86 general purpose registers
pub mod x86
{
    pub const EAX: u8 = 0;
    pub const ECX: u8 = 1;
    pub const EDX: u8 = 2;
    pub const EBX: u8 = 3;
    pub const ESP: u8 = 4;
    pub const EBP: u8 = 5;
    pub const ESI: u8 = 6;
    pub const EDI: u8 = 7;
}

/// x86-64 general purpose registers
pub mod amd64
{
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R8: u8 = 8;
    pub const R9: u8 = 9;
    pub const R10: u8 = 10;
    pub const R11: u8 = 11;
    pub const R12: u8 = 12;
    pub const R13: u8 = 13;
    pub const R14: u8 = 14;
    pub const R15: u8 = 15;
}

/// ARM (Thumb-2) core registers
pub mod arm
{
    pub const R0: u8 = 0;
    pub const R1: u8 = 1;
    pub const R2: u8 = 2;
    pub const R3: u8 = 3;
    pub const R4: u8 = 4;
    pub const R5: u8 = 5;
    pub const R6: u8 = 6;
    pub const R7: u8 = 7;
    pub const R8: u8 = 8;
    pub const R9: u8 = 9;
    pub const R10: u8 = 10;
    pub const R11: u8 = 11;
    pub const R12: u8 = 12;
    pub const SP: u8 = 13;
    pub const LR: u8 = 14;
    pub const PC: u8 = 15;
}

/// ARM64 general purpose registers
pub mod arm64
{
    pub const X0: u8 = 0;
    pub const X1: u8 = 1;
    pub const X2: u8 = 2;
    pub const X3: u8 = 3;
    pub const X4: u8 = 4;
    pub const X5: u8 = 5;
    pub const X6: u8 = 6;
    pub const X7: u8 = 7;
    pub const X19: u8 = 19;
    pub const X20: u8 = 20;
    pub const X21: u8 = 21;
    pub const X22: u8 = 22;
    pub const X23: u8 = 23;
    pub const X24: u8 = 24;
    pub const X25: u8 = 25;
    pub const X26: u8 = 26;
    pub const X27: u8 = 27;
    pub const X28: u8 = 28;
    pub const FP: u8 = 29;
    pub const LR: u8 = 30;
    pub const SP: u8 = 31;
}

/// Register that holds the frame pointer when a method has one
pub const fn frame_register(arch: Architecture) -> u8
{
    match arch {
        Architecture::X86 => x86::EBP,
        Architecture::Amd64 => amd64::RBP,
        Architecture::Arm => arm::R7,
        Architecture::Arm64 => arm64::FP,
    }
}

/// Number of general purpose register slots the display tracks for `arch`
pub const fn slot_count(arch: Architecture) -> usize
{
    match arch {
        Architecture::X86 => 8,
        Architecture::Amd64 => 16,
        Architecture::Arm => 15,
        Architecture::Arm64 => 31,
    }
}

/// Assembly name of register `reg`
pub fn name(arch: Architecture, reg: u8) -> &'static str
{
    const X86: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
    const AMD64: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
    ];
    const ARM: [&str; 16] = [
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr", "pc",
    ];
    const ARM64: [&str; 32] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14", "x15", "x16",
        "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "fp", "lr", "sp",
    ];

    let table: &[&'static str] = match arch {
        Architecture::X86 => &X86,
        Architecture::Amd64 => &AMD64,
        Architecture::Arm => &ARM,
        Architecture::Arm64 => &ARM64,
    };
    table.get(usize::from(reg)).copied().unwrap_or("?")
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_names()
    {
        assert_eq!(name(Architecture::Amd64, amd64::R12), "r12");
        assert_eq!(name(Architecture::X86, x86::EBX), "ebx");
        assert_eq!(name(Architecture::Arm, arm::LR), "lr");
        assert_eq!(name(Architecture::Arm64, arm64::FP), "fp");
        assert_eq!(name(Architecture::X86, 9), "?");
    }
}
