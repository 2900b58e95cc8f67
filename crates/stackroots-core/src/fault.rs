//! # Hardware Faults
//!
//! A managed instruction that faults (a null dereference, an access violation
//! in a write barrier) leaves its thread at an IP that is not a call site. The
//! faulting IP is still used as the frame's safe point: methods that can
//! fault inside a protected region are fully interruptible, so GC info exists
//! for every instruction. The frame is marked as aborted so the root lookup
//! uses the last callsite at or before the faulting offset instead of
//! requiring an exact return-address match.

use tracing::debug;

use crate::codeman::{CodeManager, CodeManagerKind, MethodInfo};
use crate::eh::remap_fault_to_handler;
use crate::error::Result;
use crate::types::Address;

/// Mark `info` as stopped at a fault; the faulting IP is the safe point.
pub fn mark_execution_aborted(info: &mut MethodInfo, ip: Address) -> Address
{
    info.execution_aborted = true;
    debug!(ip = %ip, method = %info.method_start, "frame execution aborted by hardware fault");
    ip
}

/// A faulting frame resolved for the GC and the exception dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultSite
{
    /// Method info of the faulting frame, marked as aborted
    pub info: MethodInfo,
    /// IP to report roots at
    pub safe_point: Address,
    /// Legacy modules: code offset of the first instruction after the
    /// prolog of the handler that catches the fault
    pub handler_offset: Option<u32>,
}

/// Resolve the frame that faulted at `ip`.
///
/// ## Errors
///
/// `MethodNotFound` when `ip` is outside the manager's code, and clause
/// decode errors while locating the handler of a legacy method.
pub fn handle_hardware_fault(manager: &dyn CodeManager, ip: Address) -> Result<FaultSite>
{
    let mut info = manager.find_method_info(ip)?;
    let safe_point = manager.remap_hardware_fault_to_gc_safe_point(&mut info, ip);

    let handler_offset = if manager.kind() == CodeManagerKind::Legacy {
        remap_fault_to_handler(manager, &info)?
    } else {
        None
    };

    Ok(FaultSite {
        info,
        safe_point,
        handler_offset,
    })
}
