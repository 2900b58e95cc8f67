//! Target architecture description.

use std::fmt;
use std::str::FromStr;

use crate::error::WalkError;

/// Instruction-set family of the code being walked
///
/// The walker does not assume the host architecture: a snapshot captured on an
/// ARM device can be walked on an x86-64 workstation. Every decoder that depends
/// on register numbering or pointer size takes an `Architecture`.
///
/// ## Example
///
/// ```rust
/// use stackroots_core::types::Architecture;
///
/// let arch: Architecture = "arm".parse()?;
/// assert_eq!(arch.pointer_size(), 4);
/// assert!(arch.has_thumb_bit());
/// # Ok::<(), stackroots_core::WalkError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 32-bit x86
    X86,
    /// x86-64
    Amd64,
    /// 32-bit ARM, Thumb-2 code
    Arm,
    /// 64-bit ARM
    Arm64,
}

impl Architecture
{
    /// Architecture of the running binary, if it is one the walker knows
    pub const fn current() -> Option<Self>
    {
        #[cfg(target_arch = "x86")]
        {
            Some(Architecture::X86)
        }

        #[cfg(target_arch = "x86_64")]
        {
            Some(Architecture::Amd64)
        }

        #[cfg(target_arch = "arm")]
        {
            Some(Architecture::Arm)
        }

        #[cfg(target_arch = "aarch64")]
        {
            Some(Architecture::Arm64)
        }

        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "arm", target_arch = "aarch64")))]
        {
            None
        }
    }

    /// Size of a pointer in bytes for this architecture.
    #[must_use]
    pub const fn pointer_size(self) -> u64
    {
        match self {
            Architecture::X86 | Architecture::Arm => 4,
            Architecture::Amd64 | Architecture::Arm64 => 8,
        }
    }

    /// Whether code addresses carry the Thumb bit (bit 0)
    #[must_use]
    pub const fn has_thumb_bit(self) -> bool
    {
        matches!(self, Architecture::Arm)
    }

    /// Number of callee-saved registers covered by the GC-info saved-register mask
    #[must_use]
    pub const fn preserved_reg_count(self) -> u32
    {
        match self {
            Architecture::X86 => 4,
            Architecture::Amd64 => 8,
            Architecture::Arm => 9,
            Architecture::Arm64 => 12,
        }
    }

    /// Strip the Thumb bit from a code address
    #[must_use]
    pub const fn code_address(self, value: u64) -> u64
    {
        if self.has_thumb_bit() {
            value & !1
        } else {
            value
        }
    }

    /// Canonical lowercase name, as accepted by [`FromStr`]
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self {
            Architecture::X86 => "x86",
            Architecture::Amd64 => "x64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture
{
    type Err = WalkError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "i386" | "i686" => Ok(Architecture::X86),
            "x64" | "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm" | "arm32" | "thumb" | "thumbv7" => Ok(Architecture::Arm),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => Err(WalkError::InvalidArgument(format!("unknown architecture '{other}'"))),
        }
    }
}
