//! # Target Memory
//!
//! Read access to the memory of a suspended thread.
//!
//! The walker never dereferences host pointers. Every stack slot, saved
//! register and image byte is fetched through [`MemoryAccess`], so the same
//! code runs against a live process, a captured snapshot, or a hand-built test
//! fixture.
//!
//! ## Implementations
//!
//! - [`SnapshotMemory`]: sparse byte regions keyed by start address
//! - [`crate::image::ModuleImage`]: the sections of a loaded module
//! - `&T` for any `T: MemoryAccess`

use std::collections::BTreeMap;

use crate::error::{Result, WalkError};
use crate::types::{Address, Architecture};

/// Read-only view of target memory
///
/// Implementors only provide [`read_bytes`](MemoryAccess::read_bytes); the
/// typed readers are built on it. All multi-byte values are little-endian.
pub trait MemoryAccess
{
    /// Fill `dst` with the bytes starting at `address`.
    ///
    /// ## Errors
    ///
    /// `WalkError::MemoryRead` if any byte of the range is not mapped.
    fn read_bytes(&self, address: Address, dst: &mut [u8]) -> Result<()>;

    /// Read `len` bytes into a new vector.
    fn read_vec(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let mut buf = vec![0u8; len];
        self.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, address: Address) -> Result<u8>
    {
        let mut buf = [0u8; 1];
        self.read_bytes(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, address: Address) -> Result<u16>
    {
        let mut buf = [0u8; 2];
        self.read_bytes(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: Address) -> Result<u32>
    {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&self, address: Address) -> Result<i32>
    {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: Address) -> Result<u64>
    {
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a pointer-sized value for `arch`, zero-extended to 64 bits.
    fn read_pointer(&self, arch: Architecture, address: Address) -> Result<u64>
    {
        if arch.pointer_size() == 4 {
            self.read_u32(address).map(u64::from)
        } else {
            self.read_u64(address)
        }
    }

    /// Read a pointer-sized value and wrap it as an [`Address`].
    fn read_address(&self, arch: Architecture, address: Address) -> Result<Address>
    {
        self.read_pointer(arch, address).map(Address::new)
    }
}

impl<T: MemoryAccess + ?Sized> MemoryAccess for &T
{
    fn read_bytes(&self, address: Address, dst: &mut [u8]) -> Result<()>
    {
        (**self).read_bytes(address, dst)
    }
}

/// Sparse in-memory address space
///
/// Stores non-overlapping byte regions in a `BTreeMap` keyed by start address.
/// Writes that touch or overlap existing regions merge them, so a fixture can
/// be built one slot at a time.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::memory::{MemoryAccess, SnapshotMemory};
/// use stackroots_core::types::{Address, Architecture};
///
/// let mut memory = SnapshotMemory::new();
/// memory.write_pointer(Architecture::Amd64, Address::new(0x7ffc_0030), 0x40_1000);
/// let value = memory.read_pointer(Architecture::Amd64, Address::new(0x7ffc_0030))?;
/// assert_eq!(value, 0x40_1000);
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct SnapshotMemory
{
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SnapshotMemory
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Copy `data` into the address space at `address`, merging neighbours.
    pub fn write_bytes(&mut self, address: Address, data: &[u8])
    {
        if data.is_empty() {
            return;
        }

        let mut start = address.value();
        let mut end = start.saturating_add(data.len() as u64);

        // Collect every region that overlaps or touches [start, end).
        let touching: Vec<u64> = self
            .regions
            .range(..=end)
            .filter(|(base, bytes)| base.saturating_add(bytes.len() as u64) >= start)
            .map(|(base, _)| *base)
            .collect();

        for base in &touching {
            if let Some(bytes) = self.regions.get(base) {
                start = start.min(*base);
                end = end.max(base.saturating_add(bytes.len() as u64));
            }
        }

        let mut merged = vec![0u8; (end - start) as usize];
        for base in touching {
            if let Some(bytes) = self.regions.remove(&base) {
                let at = (base - start) as usize;
                merged[at..at + bytes.len()].copy_from_slice(&bytes);
            }
        }

        let at = (address.value() - start) as usize;
        merged[at..at + data.len()].copy_from_slice(data);
        self.regions.insert(start, merged);
    }

    /// Write a pointer-sized little-endian value for `arch`.
    pub fn write_pointer(&mut self, arch: Architecture, address: Address, value: u64)
    {
        if arch.pointer_size() == 4 {
            self.write_bytes(address, &(value as u32).to_le_bytes());
        } else {
            self.write_bytes(address, &value.to_le_bytes());
        }
    }

    pub fn write_u32(&mut self, address: Address, value: u32)
    {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Number of disjoint regions currently stored
    pub fn region_count(&self) -> usize
    {
        self.regions.len()
    }

    /// Iterate over `(start, bytes)` of every stored region in address order.
    pub fn regions(&self) -> impl Iterator<Item = (Address, &[u8])>
    {
        self.regions.iter().map(|(base, bytes)| (Address::new(*base), bytes.as_slice()))
    }
}

impl MemoryAccess for SnapshotMemory
{
    fn read_bytes(&self, address: Address, dst: &mut [u8]) -> Result<()>
    {
        if dst.is_empty() {
            return Ok(());
        }

        let start = address.value();
        let (base, bytes) = self
            .regions
            .range(..=start)
            .next_back()
            .ok_or(WalkError::MemoryRead { address })?;

        let offset = (start - base) as usize;
        let end = offset.checked_add(dst.len()).ok_or(WalkError::MemoryRead { address })?;
        if end > bytes.len() {
            return Err(WalkError::MemoryRead { address });
        }

        dst.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_adjacent_writes_merge()
    {
        let mut memory = SnapshotMemory::new();
        memory.write_u32(Address::new(0x1000), 0x1111_1111);
        memory.write_u32(Address::new(0x1004), 0x2222_2222);
        assert_eq!(memory.region_count(), 1);
        assert_eq!(memory.read_u64(Address::new(0x1000)).unwrap(), 0x2222_2222_1111_1111);
    }

    #[test]
    fn test_overlapping_write_bridges_regions()
    {
        let mut memory = SnapshotMemory::new();
        memory.write_bytes(Address::new(0x10), &[1, 2]);
        memory.write_bytes(Address::new(0x20), &[3, 4]);
        assert_eq!(memory.region_count(), 2);
        memory.write_bytes(Address::new(0x11), &[9; 16]);
        assert_eq!(memory.region_count(), 1);
        assert_eq!(memory.read_u8(Address::new(0x10)).unwrap(), 1);
        assert_eq!(memory.read_u8(Address::new(0x20)).unwrap(), 9);
        assert_eq!(memory.read_u8(Address::new(0x21)).unwrap(), 4);
    }

    #[test]
    fn test_read_past_region_fails()
    {
        let mut memory = SnapshotMemory::new();
        memory.write_u32(Address::new(0x1000), 7);
        let err = memory.read_u64(Address::new(0x1000)).unwrap_err();
        assert!(matches!(err, WalkError::MemoryRead { .. }));
        assert!(memory.read_u8(Address::new(0xfff)).is_err());
    }

    #[test]
    fn test_pointer_width_follows_arch()
    {
        let mut memory = SnapshotMemory::new();
        memory.write_pointer(Architecture::X86, Address::new(0x100), 0xdead_beef_cafe);
        assert_eq!(memory.read_pointer(Architecture::X86, Address::new(0x100)).unwrap(), 0xbeef_cafe);
        assert!(memory.read_pointer(Architecture::Amd64, Address::new(0x100)).is_err());
    }
}
