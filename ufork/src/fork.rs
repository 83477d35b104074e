//! The fork orchestrator.
//!
//! [`Process::fork`] duplicates the calling environment's entire
//! address space below the stack-growth boundary into a newly created
//! child and marks the child runnable. No page is copied: every
//! writable page becomes copy-on-write in both environments, every
//! read-only page is shared outright, and the first write to a shared
//! page — by either side, at any later time — is repaired privately by
//! the resolver in [`crate::pgfault`].
//!
//! Ordering inside the orchestrator is load-bearing:
//!
//! - The resolver is registered for the caller *before* the first
//!   copy-on-write mapping can come into existence; an environment
//!   holding such mappings without a resolver would die on its first
//!   write.
//! - The child's exception stack is a fresh private allocation made
//!   *before* the address space is duplicated, and it lives above the
//!   duplication boundary. It is never shared and never copy-on-write:
//!   the resolver itself runs on it, and a stack that faulted while a
//!   fault was already being handled would be unrecoverable.
//! - Failures after child creation abort the whole duplication with no
//!   rollback; a half-duplicated child is left for the caller to reap.

use crate::{dup, pgfault, scan::UserPages};
use alloc::vec::Vec;
use log::debug;
use uvm::{
    EnvId, EnvStatus, Kernel, Spawn, SysError,
    addressing::Va,
    layout::{self, USTACK_TOP},
    page_table::{Pte, PteFlags},
};

/// Which side of a completed fork the caller is on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ForkResult {
    /// The original environment; carries the child's identity.
    Parent(EnvId),
    /// The newly created environment.
    Child,
}

/// An environment's own notion of "who am I".
///
/// The identity is cached by value, which is exactly what makes it
/// subtle: across a fork the cached value is inherited into the child
/// along with everything else, where it is stale. The child branch of
/// [`Process::fork`] re-resolves the identity from the kernel and
/// refreshes the handle, which is the one piece of inherited state the
/// mechanism must repair by hand.
#[derive(Debug, Clone)]
pub struct Process {
    env: EnvId,
}

impl Process {
    /// The handle for the environment currently executing.
    pub fn current(k: &Kernel) -> Self {
        Self { env: k.getenvid() }
    }

    /// The cached identity.
    #[inline]
    pub fn id(&self) -> EnvId {
        self.env
    }

    /// Duplicates the calling environment's address space into a new
    /// child using copy-on-write, and marks the child runnable.
    ///
    /// Logically this returns twice. In the original environment it
    /// returns [`ForkResult::Parent`] with the child's identity. When
    /// the child itself first resumes this same call, the creation
    /// primitive reports [`Spawn::Child`]; the child branch then only
    /// refreshes this handle's cached identity and returns
    /// [`ForkResult::Child`] — everything else below runs in the
    /// parent alone.
    ///
    /// # Returns
    /// - `Ok(ForkResult::Parent(child))` in the parent.
    /// - `Ok(ForkResult::Child)` in the child.
    /// - `Err(SysError)` if creation, the child's exception stack, any
    ///   per-page remap, or the final status change fails. No cleanup
    ///   of a partially assembled child is attempted; see
    ///   [`SysError::into_isize`] for the numeric form of the failure.
    pub fn fork(&mut self, k: &mut Kernel) -> Result<ForkResult, SysError> {
        // Must precede the first COW mapping this call creates.
        pgfault::register(k, pgfault::resolve_cow)?;

        let child = match k.fork_env()? {
            Spawn::Child => {
                // Running in the child: the inherited identity is the
                // parent's. Re-resolve and cache our own.
                self.env = k.getenvid();
                return Ok(ForkResult::Child);
            }
            Spawn::Parent { child } => child,
        };
        let me = k.getenvid();

        // The child's exception stack is a distinct allocation, never
        // run through the duplication policy.
        k.page_alloc(
            child,
            layout::uxstack_page(),
            PteFlags::U | PteFlags::P | PteFlags::W,
        )?;
        k.set_fault_upcall(child, pgfault::resolve_cow)?;

        let pages: Vec<(Va, Pte)> =
            UserPages::new(k.mappings(me)?, USTACK_TOP).collect();
        for (va, pte) in pages {
            dup::dup_page(k, child, va, pte)?;
        }

        k.set_status(child, EnvStatus::Runnable)?;
        debug!("{:?} forked {:?}", me, child);
        Ok(ForkResult::Parent(child))
    }

    /// Shared-everything fork: both environments would keep writing the
    /// same pages, sharing the address space rather than copying it.
    ///
    /// Deliberately unimplemented.
    pub fn fork_shared(&mut self, _k: &mut Kernel) -> Result<ForkResult, SysError> {
        Err(SysError::NotSupported)
    }
}
