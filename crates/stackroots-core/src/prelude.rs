//! Common module for library exports

pub use crate::codeman::{ClasslibFunctionId, CodeManager, CodeManagerKind, FuncletKind, MethodInfo};
pub use crate::error::{Result, WalkError};
pub use crate::gcinfo::{GcInfoHeader, ReturnKind};
pub use crate::gcref::{GcRoot, GcSlotFlags};
pub use crate::image::{ImageFormat, ModuleImage};
pub use crate::memory::{MemoryAccess, SnapshotMemory};
pub use crate::regdisplay::RegDisplay;
pub use crate::registry::Registry;
pub use crate::types::{Address, Architecture};
pub use crate::walker::{FrameRecord, StackWalker, WalkEnd, WalkSummary, WalkerConfig};
