//! Demand-zero paging over the same upcall seam.
//!
//! The fault upcall is not specific to copy-on-write; any policy that
//! can be phrased as "fix the mapping, then retry" fits. This handler
//! backs a faulting page with fresh zero-filled memory on first touch,
//! so an environment can treat the whole region below its stack as
//! allocate-on-use.

use log::{debug, warn};
use uvm::{
    Fault, FaultCode, Kernel, SysError, layout::USTACK_TOP, page_table::PteFlags,
};

/// Resolves a fault on an unmapped page by mapping a zero-filled
/// `{U, P, W}` page at its page base.
///
/// Only non-present faults below [`USTACK_TOP`] qualify. A fault on a
/// *present* entry is a protection violation, not a missing page, and
/// is refused so the environment dies rather than having its
/// permissions silently papered over.
pub fn resolve_zero_fill(k: &mut Kernel, fault: &Fault) -> Result<(), SysError> {
    if fault.code.contains(FaultCode::PRESENT) {
        warn!("protection fault at {} reached the zero-fill resolver", fault.va);
        return Err(SysError::InvalidAccess);
    }
    let page = fault.va.page_down();
    if page >= USTACK_TOP {
        warn!("zero-fill refused above the stack boundary at {}", fault.va);
        return Err(SysError::InvalidAccess);
    }
    let me = k.getenvid();
    k.page_alloc(me, page, PteFlags::U | PteFlags::P | PteFlags::W)?;
    debug!("zero-filled {} for {:?}", page, me);
    Ok(())
}
