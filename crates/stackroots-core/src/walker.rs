//! # Frame Walker
//!
//! Drives the registry, the code managers and the root enumerator over a
//! whole thread. Starting from the register display of a suspended thread,
//! every managed frame is resolved, its roots are reported and the display
//! is unwound to the caller, until the walk leaves managed code.
//!
//! ## Example
//!
//! ```rust
//! use stackroots_core::memory::SnapshotMemory;
//! use stackroots_core::regdisplay::RegDisplay;
//! use stackroots_core::registry::Registry;
//! use stackroots_core::types::{Address, Architecture};
//! use stackroots_core::walker::{StackWalker, WalkEnd, WalkerConfig};
//!
//! let registry = Registry::new();
//! let memory = SnapshotMemory::new();
//! let mut display = RegDisplay::new(Architecture::Amd64);
//! display.ip = Address::new(0x40_1000);
//!
//! let walker = StackWalker::new(&registry, &memory, WalkerConfig::default());
//! let summary = walker.walk(display)?;
//! assert!(summary.frames.is_empty());
//! assert_eq!(summary.end, WalkEnd::UnmanagedCode { ip: Address::new(0x40_1000) });
//! # Ok::<(), stackroots_core::WalkError>(())
//! ```

use std::fmt;

use stackroots_utils::config::{self, RuntimeConfig};
use tracing::{debug, info, trace, warn};

use crate::codeman::{CodeManager, CodeManagerKind, FuncletKind, MethodInfo};
use crate::error::{Result, WalkError};
use crate::gcref::GcRoot;
use crate::hijack::HijackInfo;
use crate::memory::MemoryAccess;
use crate::regdisplay::regs::{arm, arm64};
use crate::regdisplay::RegDisplay;
use crate::registry::Registry;
use crate::types::{Address, Architecture};
use crate::unwind::verify_method_epilogs;

/// Frame limit used when none is configured
pub const DEFAULT_MAX_FRAMES: usize = 1024;

/// Walker settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerConfig
{
    pub max_frames: usize,
    /// Validate every epilog of a legacy method before unwinding it
    pub verify_epilogs: bool,
    /// Log frames that land in unboxing stubs at `info`
    pub report_unboxing_stubs: bool,
}

impl Default for WalkerConfig
{
    fn default() -> Self
    {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            verify_epilogs: false,
            report_unboxing_stubs: false,
        }
    }
}

impl WalkerConfig
{
    /// Settings from the process configuration
    pub fn from_runtime_config() -> Self
    {
        Self::from_config(RuntimeConfig::global())
    }

    pub fn from_config(runtime: &RuntimeConfig) -> Self
    {
        let max_frames = match runtime.get(config::MAX_FRAMES) {
            0 => DEFAULT_MAX_FRAMES,
            n => n as usize,
        };
        Self {
            max_frames,
            verify_epilogs: runtime.get_bool(config::VERIFY_EPILOGS),
            report_unboxing_stubs: runtime.get_bool(config::REPORT_UNBOXING_STUBS),
        }
    }
}

/// Why a walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd
{
    /// The unwinder produced a zero return address
    EndOfStack,
    /// The IP is outside every registered module
    UnmanagedCode
    {
        ip: Address,
    },
    /// A reverse-PInvoke method returned to native code; the walk continues
    /// from this transition frame
    TransitionFrame
    {
        frame: Address,
    },
    /// The platform unwinder could not produce a caller
    UnwindFailed,
    /// `max_frames` frames were visited
    FrameLimit,
}

impl fmt::Display for WalkEnd
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            WalkEnd::EndOfStack => f.write_str("end of stack"),
            WalkEnd::UnmanagedCode { ip } => write!(f, "unmanaged code at {ip}"),
            WalkEnd::TransitionFrame { frame } => write!(f, "transition frame {frame}"),
            WalkEnd::UnwindFailed => f.write_str("unwind failed"),
            WalkEnd::FrameLimit => f.write_str("frame limit"),
        }
    }
}

/// One visited frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord
{
    pub ip: Address,
    pub sp: Address,
    /// Root method start; `None` for unboxing stubs
    pub method_start: Option<Address>,
    pub funclet_kind: Option<FuncletKind>,
    /// Frame pointer of frames with EH or of funclets
    pub frame_pointer: Option<Address>,
    /// Roots in report order
    pub roots: Vec<GcRoot>,
    pub unboxing_stub: bool,
}

/// Every frame of a walk and the reason it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkSummary
{
    pub frames: Vec<FrameRecord>,
    pub end: WalkEnd,
}

impl WalkSummary
{
    /// Total roots across frames
    pub fn root_count(&self) -> usize
    {
        self.frames.iter().map(|frame| frame.roots.len()).sum()
    }
}

/// Walks the managed frames of one suspended thread
pub struct StackWalker<'a>
{
    registry: &'a Registry,
    memory: &'a dyn MemoryAccess,
    config: WalkerConfig,
}

impl<'a> StackWalker<'a>
{
    pub fn new(registry: &'a Registry, memory: &'a dyn MemoryAccess, config: WalkerConfig) -> Self
    {
        Self {
            registry,
            memory,
            config,
        }
    }

    pub fn config(&self) -> &WalkerConfig
    {
        &self.config
    }

    /// Walk from a thread stopped at a safe point.
    ///
    /// ## Errors
    ///
    /// Fatal walker errors and memory errors while reporting roots. Leaving
    /// managed code ends the walk with a [`WalkEnd`] instead.
    pub fn walk(&self, display: RegDisplay) -> Result<WalkSummary>
    {
        self.walk_inner(display, false)
    }

    /// Walk from a thread stopped at a hardware fault in managed code.
    ///
    /// The first frame is marked as aborted so its roots are reported for
    /// the faulting instruction.
    pub fn walk_from_fault(&self, display: RegDisplay) -> Result<WalkSummary>
    {
        self.walk_inner(display, true)
    }

    /// Hijack info of the innermost frame; `None` when `display` is not in
    /// managed code or the frame refuses hijacking.
    pub fn return_address_hijack_info(&self, display: &RegDisplay) -> Result<Option<HijackInfo>>
    {
        match self.registry.find_method_info(display.ip) {
            Ok((manager, info)) => manager.get_return_address_hijack_info(&info, display, self.memory),
            Err(err) if err.is_end_of_walk() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn walk_inner(&self, mut display: RegDisplay, from_fault: bool) -> Result<WalkSummary>
    {
        let mut frames = Vec::new();

        let end = loop {
            if frames.len() >= self.config.max_frames {
                warn!(limit = self.config.max_frames, "frame limit reached");
                break WalkEnd::FrameLimit;
            }
            if display.ip.is_null() {
                break WalkEnd::EndOfStack;
            }

            if self.registry.is_unboxing_stub(display.ip) {
                frames.push(self.stub_frame(&display));
                self.step_out_of_stub(&mut display)?;
                continue;
            }

            let (manager, mut info) = match self.registry.find_method_info(display.ip) {
                Ok(found) => found,
                Err(err) if err.is_end_of_walk() => {
                    let ip = display.ip;
                    debug!(ip = %ip, "walk left managed code");
                    break WalkEnd::UnmanagedCode { ip };
                }
                Err(err) => return Err(err),
            };

            let safe_point = if from_fault && frames.is_empty() {
                manager.remap_hardware_fault_to_gc_safe_point(&mut info, display.ip)
            } else {
                display.ip
            };

            match self.visit_frame(manager.as_ref(), &info, safe_point, &display) {
                Ok(frame) => frames.push(frame),
                Err(err) if err.is_end_of_walk() => {
                    warn!(ip = %safe_point, error = %err, "abandoning walk");
                    break WalkEnd::UnwindFailed;
                }
                Err(err) => return Err(err),
            }

            match manager.unwind_stack_frame(&info, &mut display, self.memory) {
                Ok(outcome) => {
                    if let Some(frame) = outcome.prev_transition_frame {
                        debug!(frame = %frame, "reverse PInvoke transition");
                        break WalkEnd::TransitionFrame { frame };
                    }
                }
                Err(err) if err.is_end_of_walk() => {
                    warn!(ip = %safe_point, error = %err, "abandoning walk");
                    break WalkEnd::UnwindFailed;
                }
                Err(err) => return Err(err),
            }
        };

        debug!(frames = frames.len(), end = %end, "walk finished");
        Ok(WalkSummary { frames, end })
    }

    fn visit_frame(
        &self,
        manager: &dyn CodeManager,
        info: &MethodInfo,
        safe_point: Address,
        display: &RegDisplay,
    ) -> Result<FrameRecord>
    {
        if self.config.verify_epilogs && manager.kind() == CodeManagerKind::Legacy {
            verify_method_epilogs(manager.image(), info).map_err(WalkError::for_build_profile)?;
        }

        let mut roots = Vec::new();
        manager.enum_gc_refs(info, safe_point, display, self.memory, &mut |root| roots.push(root))?;
        let ip = display.ip;
        trace!(ip = %ip, method = %info.method_start, roots = roots.len(), kind = info.kind.name(), "frame");

        Ok(FrameRecord {
            ip: display.ip,
            sp: display.sp,
            method_start: Some(manager.get_method_start_address(info)),
            funclet_kind: Some(info.kind),
            frame_pointer: manager.get_frame_pointer(info, display, self.memory),
            roots,
            unboxing_stub: false,
        })
    }

    fn stub_frame(&self, display: &RegDisplay) -> FrameRecord
    {
        if self.config.report_unboxing_stubs {
            let (ip, sp) = (display.ip, display.sp);
            info!(ip = %ip, sp = %sp, "frame in unboxing stub");
        }
        FrameRecord {
            ip: display.ip,
            sp: display.sp,
            method_start: None,
            funclet_kind: None,
            frame_pointer: None,
            roots: Vec::new(),
            unboxing_stub: true,
        }
    }

    /// Return through an unboxing stub. Stubs have no frame: the return
    /// address is at SP on x86 and x64, and in LR on ARM and ARM64.
    fn step_out_of_stub(&self, display: &mut RegDisplay) -> Result<()>
    {
        let arch = display.arch();
        match arch {
            Architecture::X86 | Architecture::Amd64 => {
                let slot = display.sp;
                display.set_ip_from_slot(self.memory, slot)?;
                display.sp = slot.saturating_add(arch.pointer_size());
            }
            Architecture::Arm | Architecture::Arm64 => {
                let lr = if arch == Architecture::Arm { arm::LR } else { arm64::LR };
                let slot = display
                    .slot(lr)
                    .ok_or_else(|| WalkError::UnwindStepFailed("unboxing stub without LR".to_string()))?;
                display.set_ip_from_slot(self.memory, slot)?;
                display.ip = Address::new(arch.code_address(display.ip.value()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory::SnapshotMemory;

    #[test]
    fn test_config_zero_frames_means_default()
    {
        let runtime = RuntimeConfig::from_ini_str("MAX_FRAMES=0\nREPORT_UNBOXING_STUBS=1\n");
        let config = WalkerConfig::from_config(&runtime);
        assert_eq!(config.max_frames, DEFAULT_MAX_FRAMES);
        assert!(config.report_unboxing_stubs);
        assert!(!config.verify_epilogs);
    }

    #[test]
    fn test_config_frame_limit_is_hex()
    {
        let runtime = RuntimeConfig::from_ini_str("MAX_FRAMES=10\n");
        assert_eq!(WalkerConfig::from_config(&runtime).max_frames, 16);
    }

    #[test]
    fn test_null_ip_ends_walk()
    {
        let registry = Registry::new();
        let memory = SnapshotMemory::new();
        let walker = StackWalker::new(&registry, &memory, WalkerConfig::default());
        let summary = walker.walk(RegDisplay::new(Architecture::Arm64)).unwrap();
        assert_eq!(summary.end, WalkEnd::EndOfStack);
        assert_eq!(summary.root_count(), 0);
    }

    #[test]
    fn test_stub_returns_through_stack_slot()
    {
        let registry = Registry::new();
        assert!(registry.register_unboxing_stubs(Address::new(0x5000), 0x100));

        let mut memory = SnapshotMemory::new();
        memory.write_pointer(Architecture::Amd64, Address::new(0x7000), 0x9000);
        let mut display = RegDisplay::new(Architecture::Amd64);
        display.ip = Address::new(0x5010);
        display.sp = Address::new(0x7000);

        let walker = StackWalker::new(&registry, &memory, WalkerConfig::default());
        let summary = walker.walk(display).unwrap();
        assert_eq!(summary.frames.len(), 1);
        assert!(summary.frames[0].unboxing_stub);
        assert_eq!(summary.end, WalkEnd::UnmanagedCode { ip: Address::new(0x9000) });
    }

    #[test]
    fn test_frame_limit()
    {
        let registry = Registry::new();
        assert!(registry.register_unboxing_stubs(Address::new(0x5000), 0x100));

        // The stub returns into itself forever
        let mut memory = SnapshotMemory::new();
        for i in 0..8u64 {
            memory.write_pointer(Architecture::Amd64, Address::new(0x7000 + i * 8), 0x5010);
        }
        let mut display = RegDisplay::new(Architecture::Amd64);
        display.ip = Address::new(0x5010);
        display.sp = Address::new(0x7000);

        let config = WalkerConfig {
            max_frames: 3,
            ..WalkerConfig::default()
        };
        let summary = StackWalker::new(&registry, &memory, config).walk(display).unwrap();
        assert_eq!(summary.frames.len(), 3);
        assert_eq!(summary.end, WalkEnd::FrameLimit);
    }
}
