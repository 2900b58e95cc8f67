//! # Unwinding
//!
//! Platform unwind adapters. Each one moves a [`RegDisplay`](crate::regdisplay::RegDisplay)
//! from a frame to its caller:
//!
//! - [`legacy`]: frames compiled with the runtime's own GC encoding, unwound
//!   from the GC-info header with epilog matching ([`epilog`]).
//! - [`win64`]: PE modules, interpreting `UNWIND_INFO`.
//! - [`dwarf`]: ELF and Mach-O modules, evaluating `.eh_frame` CFI.
//! - [`arm64`]: ARM64 methods whose method info carries a custom unwind blob.
//!
//! All of them share one contract: on success the display describes the
//! immediate caller, its `p_ip` points at the return address cell, and an IP
//! of zero means the walk ran off the end of the stack.

pub mod arm64;
pub mod dwarf;
pub mod epilog;
pub mod legacy;
pub mod win64;

pub use dwarf::FdeInfo;
pub use epilog::{verify_epilog_bytes, verify_method_epilogs, EpilogExit, EpilogOp, EpilogProgram};
pub use win64::{RuntimeFunction, UnwindCode, UnwindFlags, UnwindInfo, UnwindOp};
