//! The fixed layout of a user address space.
//!
//! ```text
//!  USER_LIMIT, UXSTACK_TOP -> +--------------------------+ 0xf0000000
//!                             |   exception stack (1pg)  |
//!                             +--------------------------+ 0xeffff000
//!                             |    gap, never mapped     |
//!              USTACK_TOP -> +--------------------------+ 0xefffe000
//!                             |    normal user stack     |
//!                             :                          :
//!                             |  program text/data/heap  |
//!                             +--------------------------+
//!                             |  COW_SCRATCH (transient) |
//!                             +--------------------------+ 0x003ff000
//!                             :                          :
//!                             +--------------------------+ 0x00000000
//! ```
//!
//! Everything an environment maps lives below [`USER_LIMIT`]. The single
//! page below [`UXSTACK_TOP`] is the exception stack the fault upcall
//! runs on; the page below that is a guard gap that is never mapped, so
//! a stack that grows past [`USTACK_TOP`] faults instead of silently
//! running into the exception stack.

use crate::addressing::{PAGE_SIZE, Va};

const fn va(addr: usize) -> Va {
    match Va::new(addr) {
        Some(va) => va,
        None => panic!("layout address outside the user address space"),
    }
}

/// Exclusive upper bound of the user-manageable address space. Page
/// allocation and mapping primitives refuse addresses at or above this.
pub const USER_LIMIT: Va = va(0xf000_0000);

/// Top of the per-environment exception stack. The stack occupies the
/// single page `[UXSTACK_TOP - PAGE_SIZE, UXSTACK_TOP)`.
pub const UXSTACK_TOP: Va = USER_LIMIT;

/// Exclusive upper bound for normal user stack growth, and therefore
/// the upper bound of address-space duplication. One unmapped guard
/// page separates it from the exception stack.
pub const USTACK_TOP: Va = va(0xf000_0000 - 2 * PAGE_SIZE);

/// The page an environment's fault resolver may use as transient
/// scratch space while materializing a private copy of a faulting page.
/// Reserved for that purpose; resolvers unmap it before returning.
pub const COW_SCRATCH: Va = va(0x003f_f000);

/// The page holding the exception stack.
#[inline]
pub const fn uxstack_page() -> Va {
    match Va::new(UXSTACK_TOP.into_usize() - PAGE_SIZE) {
        Some(va) => va,
        None => panic!("unreachable"),
    }
}
