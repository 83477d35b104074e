//! The copy-on-write fault resolver.
//!
//! A write to a page whose entry carries the `COW` marker traps into
//! the registered upcall. The resolver's job is to replace the shared,
//! fault-protected view of that page with a private writable copy and
//! let the store resume — touching only the faulting environment's own
//! entry, so the other environment sharing the frame needs no
//! coordination whatsoever.
//!
//! Everything else that can arrive here is a genuine memory-protection
//! violation: a fault that is not a write, or a write fault on a page
//! that is not marked copy-on-write, is not this mechanism's to fix.
//! The resolver refuses, and the kernel terminates the environment.
//! The same goes for any failure while materializing the copy — a
//! half-resolved page cannot be retried or continued from.

use alloc::vec;
use log::{debug, warn};
use uvm::{
    Fault, FaultCode, FaultHandler, Kernel, SysError,
    addressing::PAGE_SIZE,
    layout::{self, COW_SCRATCH},
    page_table::PteFlags,
};

/// Registers `handler` as the calling environment's fault upcall.
///
/// The first registration also provides the private exception stack
/// the upcall runs on, at the fixed page below
/// [`layout::UXSTACK_TOP`]; later registrations just replace the
/// entry point. Callable before any copy-on-write mapping exists — and
/// it must be, since an environment holding `COW` mappings without a
/// registered resolver would die on its first write.
pub fn register(k: &mut Kernel, handler: FaultHandler) -> Result<(), SysError> {
    let me = k.getenvid();
    let uxstack = layout::uxstack_page();
    if k.mappings(me)?.pte(uxstack).is_none() {
        k.page_alloc(me, uxstack, PteFlags::U | PteFlags::P | PteFlags::W)?;
    }
    k.set_fault_upcall(me, handler)
}

/// Resolves a write fault on a copy-on-write page by giving the
/// faulting environment a private writable copy.
///
/// The copy is staged through [`COW_SCRATCH`], a virtual page reserved
/// for exactly this: copying "in place" is impossible, because the
/// faulting address still translates to the shared frame until the
/// final remap. The sequence is:
///
/// 1. allocate a fresh frame, mapped `{U, P, W}` at the scratch
///    address;
/// 2. copy the faulting page's contents (rounded down to its page
///    base) into it;
/// 3. remap the scratch frame at the faulting page's own address with
///    `{U, P, W}` — no marker, this environment now owns the copy;
/// 4. unmap the scratch address, leaving the frame mapped only at its
///    final home.
///
/// The environment that still references the original frame keeps its
/// own `COW` entry untouched and sees none of this.
pub fn resolve_cow(k: &mut Kernel, fault: &Fault) -> Result<(), SysError> {
    if !fault.code.contains(FaultCode::WRITE) {
        warn!("non-write fault at {} reached the copy-on-write resolver", fault.va);
        return Err(SysError::InvalidAccess);
    }
    let me = k.getenvid();
    let page = fault.va.page_down();
    let marked = k
        .mappings(me)?
        .pte(page)
        .map(|pte| pte.flags().contains(PteFlags::COW))
        .unwrap_or(false);
    if !marked {
        warn!("write fault at {} on a page not marked copy-on-write", fault.va);
        return Err(SysError::InvalidAccess);
    }

    let writable = PteFlags::U | PteFlags::P | PteFlags::W;
    k.page_alloc(me, COW_SCRATCH, writable)?;
    let mut contents = vec![0u8; PAGE_SIZE];
    k.read(page, &mut contents)?;
    k.write(COW_SCRATCH, &contents)?;
    k.page_map(me, COW_SCRATCH, me, page, writable)?;
    k.page_unmap(me, COW_SCRATCH)?;
    debug!("privatized copy-on-write page {} for {:?}", page, me);
    Ok(())
}
