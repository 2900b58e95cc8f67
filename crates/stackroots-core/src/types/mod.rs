//! # Types
//!
//! Architecture-neutral types used throughout the walker.
//!
//! Addresses are always 64-bit values; the [`Architecture`] decides pointer
//! width and register numbering when target memory is interpreted.

pub mod address;
pub mod arch;

// Re-export all public types
pub use address::Address;
pub use arch::Architecture;
