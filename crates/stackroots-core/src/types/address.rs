//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed target address
///
/// Every instruction pointer, stack slot and image location the walker
/// touches is an `Address`. Stack snapshots of 32-bit targets (x86, ARM)
/// still use this 64-bit type; values are zero-extended when read and
/// truncated by [`crate::memory::MemoryAccess::read_pointer`] rules.
///
/// Arithmetic wraps, matching how the target CPU computes `base + offset`.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// let next_addr = addr + 0x100; // Add offset
/// assert_eq!(next_addr.value(), 0x1100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    ///
    /// This is typically an invalid address on most systems, but can be used
    /// as a sentinel value or for initialization.
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// This is equivalent to `Address::from(value)` but can be used in const contexts.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use stackroots_core::types::Address;
    ///
    /// const STACK_BASE: Address = Address::new(0x7ffc_0000);
    /// ```
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    ///
    /// This returns the underlying address value. Use this when you need to pass
    /// the address to platform-specific APIs that expect a `u64`.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use stackroots_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.value(), 0x1000);
    /// ```
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// Returns `Some(new_address)` if the addition doesn't overflow, or `None` if it does.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use stackroots_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None); // Overflow
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    ///
    /// Returns `Some(new_address)` if the subtraction doesn't underflow, or `None` if it does.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use stackroots_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_sub(0x100), Some(Address::from(0xf00)));
    /// assert_eq!(addr.checked_sub(u64::MAX), None); // Underflow
    /// ```
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Add an offset to this address, saturating at the maximum value
    ///
    /// If the addition would overflow, returns `Address::new(u64::MAX)` instead.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use stackroots_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.saturating_add(0x100), Address::from(0x1100));
    /// assert_eq!(addr.saturating_add(u64::MAX), Address::new(u64::MAX)); // Saturates
    /// ```
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }

    /// Apply a signed displacement, wrapping like the target CPU does
    ///
    /// Frame-pointer and stack-slot offsets in GC info are signed.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use stackroots_core::types::Address;
    ///
    /// let fp = Address::new(0x7ffc_0100);
    /// assert_eq!(fp.offset(-0x20), Address::new(0x7ffc_00e0));
    /// assert_eq!(fp.offset(0x10), Address::new(0x7ffc_0110));
    /// ```
    #[must_use]
    pub const fn offset(self, delta: i64) -> Self
    {
        Address(self.0.wrapping_add_signed(delta))
    }

    /// Round down to a power-of-two alignment
    #[must_use]
    pub const fn align_down(self, alignment: u64) -> Self
    {
        Address(self.0 & !(alignment - 1))
    }

    /// Returns `true` for the null address
    #[must_use]
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Signed distance from `base` to this address
    #[must_use]
    pub const fn distance_from(self, base: Address) -> i64
    {
        self.0.wrapping_sub(base.0) as i64
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
