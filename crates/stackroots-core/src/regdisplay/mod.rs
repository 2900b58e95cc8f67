//! # Register Display
//!
//! The running context of one frame: where each callee-saved register of the
//! frame's caller-visible state currently lives, plus SP and IP by value.
//!
//! A general purpose register is described by a *slot pointer*, the address of
//! the memory cell holding its value. For a frame the walk started at, slots
//! point into a spilled copy of the hardware register file; after an unwind
//! they point at the save locations on the stack. Unwinders only ever move slot
//! pointers, they never copy values, so the GC can update a root held in a
//! callee-saved register by writing through the slot.
//!
//! SP and IP are held by value. The IP also keeps the slot it was loaded from
//! (the return-address cell), which is what hijacking patches.
//!
//! Nonvolatile floating point registers (x64 XMM6..XMM15, ARM/ARM64 D8..D15)
//! are carried by value: they never hold GC references.

pub mod regs;

use crate::error::{Result, WalkError};
use crate::memory::{MemoryAccess, SnapshotMemory};
use crate::types::{Address, Architecture};

/// Largest general purpose register count across supported architectures
pub const MAX_SLOTS: usize = 32;

/// Register display for one frame
///
/// ## Example
///
/// ```rust
/// use stackroots_core::memory::{MemoryAccess, SnapshotMemory};
/// use stackroots_core::regdisplay::{regs::amd64, RegDisplay};
/// use stackroots_core::types::{Address, Architecture};
///
/// let mut memory = SnapshotMemory::new();
/// let mut display = RegDisplay::new(Architecture::Amd64);
/// display.spill(&mut memory, Address::new(0x1000), amd64::RBP, 0x7ffc_0040);
///
/// assert_eq!(display.slot(amd64::RBP), Some(Address::new(0x1000 + 5 * 8)));
/// assert_eq!(display.read_reg(&memory, amd64::RBP)?, 0x7ffc_0040);
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegDisplay
{
    arch: Architecture,
    slots: [Option<Address>; MAX_SLOTS],
    pub sp: Address,
    pub ip: Address,
    /// Cell the current IP was loaded from, if it came from the stack
    pub p_ip: Option<Address>,
    /// x64 XMM6..XMM15 by value
    pub xmm: [u128; 10],
    /// ARM and ARM64 D8..D15 by value
    pub d: [u64; 8],
}

impl RegDisplay
{
    /// Empty display: no slots, zero SP and IP.
    pub const fn new(arch: Architecture) -> Self
    {
        Self {
            arch,
            slots: [None; MAX_SLOTS],
            sp: Address::ZERO,
            ip: Address::ZERO,
            p_ip: None,
            xmm: [0; 10],
            d: [0; 8],
        }
    }

    pub const fn arch(&self) -> Architecture
    {
        self.arch
    }

    /// Slot pointer of register `reg`
    pub fn slot(&self, reg: u8) -> Option<Address>
    {
        self.slots.get(usize::from(reg)).copied().flatten()
    }

    /// Point register `reg` at `slot`; `None` marks it unknown.
    pub fn set_slot(&mut self, reg: u8, slot: Option<Address>)
    {
        if usize::from(reg) < regs::slot_count(self.arch) {
            self.slots[usize::from(reg)] = slot;
        }
    }

    /// Iterate over `(register, slot)` for every known slot.
    pub fn slots(&self) -> impl Iterator<Item = (u8, Address)> + '_
    {
        self.slots
            .iter()
            .take(regs::slot_count(self.arch))
            .enumerate()
            .filter_map(|(reg, slot)| slot.map(|slot| (reg as u8, slot)))
    }

    /// Current value of `reg`, read through its slot.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if the display has no slot for `reg`.
    pub fn read_reg(&self, memory: &dyn MemoryAccess, reg: u8) -> Result<u64>
    {
        let slot = self
            .slot(reg)
            .ok_or_else(|| WalkError::InvalidArgument(format!("no slot for {}", regs::name(self.arch, reg))))?;
        memory.read_pointer(self.arch, slot)
    }

    /// Slot of the frame pointer register
    pub fn frame_pointer_slot(&self) -> Option<Address>
    {
        self.slot(regs::frame_register(self.arch))
    }

    /// Value of the frame pointer register
    pub fn frame_pointer(&self, memory: &dyn MemoryAccess) -> Result<Address>
    {
        self.read_reg(memory, regs::frame_register(self.arch)).map(Address::new)
    }

    /// Load the IP from the return-address cell at `slot`.
    pub fn set_ip_from_slot(&mut self, memory: &dyn MemoryAccess, slot: Address) -> Result<()>
    {
        self.ip = memory.read_address(self.arch, slot)?;
        self.p_ip = Some(slot);
        Ok(())
    }

    /// Write `value` into a register-file spill area and point `reg` at it.
    ///
    /// Register `n` lives at `area + n * pointer size`, which mirrors how a
    /// suspended thread's context is captured.
    pub fn spill(&mut self, memory: &mut SnapshotMemory, area: Address, reg: u8, value: u64)
    {
        let slot = area.saturating_add(u64::from(reg) * self.arch.pointer_size());
        memory.write_pointer(self.arch, slot, value);
        self.set_slot(reg, Some(slot));
    }

    /// XMM register `n` (6..=15) by value
    pub fn xmm_reg(&self, n: usize) -> Option<u128>
    {
        n.checked_sub(6).and_then(|index| self.xmm.get(index)).copied()
    }

    /// D register `n` (8..=15) by value
    pub fn d_reg(&self, n: usize) -> Option<u64>
    {
        n.checked_sub(8).and_then(|index| self.d.get(index)).copied()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_slots_limited_to_arch()
    {
        let mut display = RegDisplay::new(Architecture::X86);
        display.set_slot(regs::amd64::R12, Some(Address::new(0x10)));
        assert_eq!(display.slot(regs::amd64::R12), None);
        display.set_slot(regs::x86::EBX, Some(Address::new(0x10)));
        assert_eq!(display.slots().collect::<Vec<_>>(), vec![(regs::x86::EBX, Address::new(0x10))]);
    }

    #[test]
    fn test_ip_from_slot()
    {
        let mut memory = SnapshotMemory::new();
        memory.write_pointer(Architecture::Arm, Address::new(0x200), 0x8001);
        let mut display = RegDisplay::new(Architecture::Arm);
        display.set_ip_from_slot(&memory, Address::new(0x200)).unwrap();
        assert_eq!(display.ip, Address::new(0x8001));
        assert_eq!(display.p_ip, Some(Address::new(0x200)));
    }

    #[test]
    fn test_missing_slot_is_error()
    {
        let memory = SnapshotMemory::new();
        let display = RegDisplay::new(Architecture::Arm64);
        assert!(display.frame_pointer(&memory).is_err());
    }

    #[test]
    fn test_fp_registers()
    {
        let mut display = RegDisplay::new(Architecture::Amd64);
        display.xmm[0] = 7;
        assert_eq!(display.xmm_reg(6), Some(7));
        assert_eq!(display.xmm_reg(5), None);
        assert_eq!(display.d_reg(16), None);
    }
}
