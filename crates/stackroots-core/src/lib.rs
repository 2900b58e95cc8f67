//! # stackroots-core
//!
//! Stack walking and GC root reporting for ahead-of-time compiled managed
//! code.
//!
//! A garbage collector needs to find every object reference held by a
//! suspended thread. This crate answers that question one frame at a time:
//!
//! - [`registry`] maps an instruction pointer to the module that owns it.
//! - [`codeman`] resolves the method (and funclet) containing the IP and
//!   decodes its [`gcinfo`] header.
//! - [`unwind`] moves a [`regdisplay::RegDisplay`] to the caller, using the
//!   runtime's own encoding, Windows x64 unwind data or DWARF CFI.
//! - [`gcref`] reports the live roots at a safe point.
//! - [`eh`], [`hijack`] and [`fault`] serve the exception dispatcher and the
//!   thread suspension logic.
//! - [`walker`] drives all of them over a whole thread.
//!
//! ## Architectures
//!
//! x86, x64, ARM (Thumb-2) and ARM64 are all handled at run time; the
//! [`types::Architecture`] of a module or register display selects pointer
//! size and register numbering. Target memory is only read through
//! [`memory::MemoryAccess`], so walks run equally against a live thread or
//! a captured snapshot.

pub mod codeman;
pub mod dump;
pub mod eh;
pub mod error;
pub mod fault;
pub mod gcinfo;
pub mod gcref;
pub mod hijack;
pub mod image;
pub mod memory;
pub mod prelude;
pub mod regdisplay;
pub mod registry;
pub mod types;
pub mod unwind;
pub mod varint;
pub mod walker;

pub use error::{Result, WalkError};
pub use registry::Registry;
pub use types::{Address, Architecture};
pub use walker::{StackWalker, WalkerConfig};

/// Compiler version recorded by the build script, if it could be queried
pub const RUSTC_VERSION: Option<&str> = option_env!("STACKROOTS_RUSTC_VERSION");
