//! Fault records and the user-level fault upcall.

use crate::{SysError, addressing::Va, kernel::Kernel};

bitflags::bitflags! {
    /// Error code describing the cause of a page fault.
    pub struct FaultCode: u32 {
        /// The faulting access hit a present entry; the fault is a
        /// protection violation rather than a missing mapping.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access came from user level.
        const USER = 1 << 2;
    }
}

/// A page-fault record, produced by the kernel and handed to the
/// registered upcall.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    /// The faulting virtual address, byte-precise.
    pub va: Va,
    /// Why the access faulted.
    pub code: FaultCode,
}

/// A user-level fault resolver.
///
/// The kernel transfers control here, on the environment's private
/// exception stack, when an access violates the environment's page
/// permissions. Returning `Ok(())` resumes the faulting access, which
/// is retried exactly once; returning an error terminates the
/// environment. The handler runs with full access to the system-call
/// surface and may remap the faulting environment's memory freely.
pub type FaultHandler = fn(&mut Kernel, &Fault) -> Result<(), SysError>;
