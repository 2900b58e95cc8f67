//! # Error Types
//!
//! Error handling for stack walking, unwinding and GC root reporting.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

use crate::types::Address;

/// Main error type for walker operations
///
/// Every failure inside the core is surfaced as one of these values; nothing
/// panics and nothing is retried. The caller decides whether a failure ends the
/// walk quietly or fails the process.
///
/// ## Error Categories
///
/// 1. **End of managed region**: `MethodNotFound`, `UnwindStepFailed`
/// 2. **Fatal walker state**: `PrologSuspension`, `UnknownEpilogOpcode`, `MalformedGcInfo`
/// 3. **Input errors**: `DecodeTruncated`, `MemoryRead`, `InvalidArgument`
/// 4. **Image/IO errors**: `Object`, `Io`
#[derive(Error, Debug)]
pub enum WalkError
{
    /// The instruction pointer is not inside any registered managed code range
    ///
    /// This is the normal way a walk ends when it reaches native code. The
    /// caller treats the frame as unmanaged and stops.
    #[error("No managed method contains IP {ip}")]
    MethodNotFound
    {
        /// The unmanaged instruction pointer.
        ip: Address,
    },

    /// The thread was suspended inside a method prolog
    ///
    /// Prologs carry no GC information and cannot be unwound by the legacy
    /// encoding. Callers arrange never to suspend here.
    #[error("Cannot walk from prolog offset 0x{offset:x}")]
    PrologSuspension
    {
        /// Code offset within the method.
        offset: u32,
    },

    /// The epilog matcher found an instruction it does not recognize
    #[error("Unknown epilog opcode 0x{byte:02x} at epilog offset 0x{offset:x}")]
    UnknownEpilogOpcode
    {
        /// Offset of the unexpected byte from the epilog start.
        offset: u32,
        /// The byte (or low byte of the Thumb halfword) found there.
        byte: u8,
    },

    /// The platform unwinder could not produce a caller frame
    ///
    /// Walkers treat this as end-of-stack.
    #[error("Unwind step failed: {0}")]
    UnwindStepFailed(String),

    /// GC info violates an invariant that AOT validation guarantees
    #[error("Malformed GC info: {0}")]
    MalformedGcInfo(String),

    /// A var-int or fixed-width field ran past the end of its buffer
    #[error("Encoded data truncated at offset {offset}")]
    DecodeTruncated
    {
        /// Position in the buffer where the read started.
        offset: usize,
    },

    /// A read from stack or image memory fell outside mapped memory
    #[error("Memory read failed at {address}")]
    MemoryRead
    {
        /// First address of the failed read.
        address: Address,
    },

    /// Invalid argument passed to a walker function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The module image could not be parsed
    #[error("Object file error: {0}")]
    Object(String),

    /// I/O error (reading images or snapshots from disk)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WalkError
{
    /// Returns `true` if a walker should stop quietly rather than fail
    ///
    /// Leaving managed code and a failed platform unwind both mean "end of
    /// managed region".
    #[must_use]
    pub const fn is_end_of_walk(&self) -> bool
    {
        matches!(self, WalkError::MethodNotFound { .. } | WalkError::UnwindStepFailed(_))
    }

    /// Returns `true` if the containing runtime should fail fast
    #[must_use]
    pub const fn is_fatal(&self) -> bool
    {
        matches!(
            self,
            WalkError::PrologSuspension { .. } | WalkError::UnknownEpilogOpcode { .. } | WalkError::MalformedGcInfo(_)
        )
    }

    /// Apply the build profile's policy for epilog code the matcher cannot
    /// follow.
    ///
    /// Debug builds keep `UnknownEpilogOpcode`, which is fatal. Release builds
    /// turn it into `UnwindStepFailed`, which ends the walk. Other errors pass
    /// through unchanged.
    #[must_use]
    pub fn for_build_profile(self) -> Self
    {
        match self {
            WalkError::UnknownEpilogOpcode { offset, byte } if !cfg!(debug_assertions) => WalkError::UnwindStepFailed(
                format!("unknown epilog opcode 0x{byte:02x} at epilog offset 0x{offset:x}"),
            ),
            other => other,
        }
    }
}

impl From<gimli::Error> for WalkError
{
    fn from(err: gimli::Error) -> Self
    {
        WalkError::UnwindStepFailed(err.to_string())
    }
}

impl From<object::read::Error> for WalkError
{
    fn from(err: object::read::Error) -> Self
    {
        WalkError::Object(err.to_string())
    }
}

/// Convenience type alias for `Result<T, WalkError>`
///
/// ```rust
/// use stackroots_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, WalkError>;
