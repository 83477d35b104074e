//! The per-page duplication policy.

use log::warn;
use uvm::{
    EnvId, Kernel, SysError,
    addressing::Va,
    page_table::{Pte, PteFlags},
};

/// Installs the caller's page at `va` into `child` at the same virtual
/// address, establishing the sharing discipline for it.
///
/// A page that is writable, or already marked copy-on-write, becomes
/// copy-on-write in *both* environments: it is mapped into the child
/// with `{U, P, COW}`, and then the caller's own entry is remapped with
/// the same set. The self-remap is mandatory even when the caller's
/// entry already carries the marker — the mapping call is the only way
/// to guarantee the permission bits end up exactly `{U, P, COW}` with
/// no stray write bit, and a leftover write bit would let one side keep
/// storing into a frame the other side believes is fault-protected the
/// next time this page is shared with a third environment.
///
/// A page that is neither writable nor copy-on-write is shared with
/// `{U, P}` only. Two read-only views of one frame are safe without the
/// marker, and leaving it off means a fault can never be provoked on a
/// page that could never legitimately be written.
///
/// Any mapping failure is propagated immediately; nothing done so far
/// is rolled back, and the caller treats the failure as fatal to the
/// whole duplication.
pub fn dup_page(k: &mut Kernel, child: EnvId, va: Va, pte: Pte) -> Result<(), SysError> {
    let me = k.getenvid();
    if pte.flags().intersects(PteFlags::W | PteFlags::COW) {
        let perm = PteFlags::U | PteFlags::P | PteFlags::COW;
        k.page_map(me, va, child, va, perm)
            .inspect_err(|e| warn!("mapping {} copy-on-write into {:?} failed: {:?}", va, child, e))?;
        k.page_map(me, va, me, va, perm)
            .inspect_err(|e| warn!("re-marking {} copy-on-write failed: {:?}", va, e))?;
    } else {
        k.page_map(me, va, child, va, PteFlags::U | PteFlags::P)
            .inspect_err(|e| warn!("sharing read-only {} into {:?} failed: {:?}", va, child, e))?;
    }
    Ok(())
}
