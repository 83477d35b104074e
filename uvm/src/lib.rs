//! # uvm: a minimal page-mapping kernel for user-level memory management.
//!
//! This crate provides the substrate that user-level virtual memory
//! mechanisms are built on: physical frames, two-level page tables,
//! environments (processes), and a deliberately small system-call surface
//! that only knows how to allocate, map and unmap single pages, create a
//! blank environment, flip its run status, and register a page-fault
//! upcall. Every policy decision — what to map where, how to react to a
//! fault — is left to user-level code such as the `ufork` crate.
//!
//! The kernel here is an emulation: environments do not execute
//! instructions, they are driven explicitly through [`Kernel`] by a test
//! or a host program. Memory accesses go through [`Kernel::read`] and
//! [`Kernel::write`], which perform the same permission checks an MMU
//! would and deliver a synchronous fault upcall on a violation, on the
//! environment's private exception stack. This keeps the semantics of
//! the real machine — including the awkward parts, like a fault arriving
//! in the middle of a store — while staying runnable anywhere.
//!
//! ## Module map
//!
//! - [`addressing`]: virtual and physical address newtypes and page
//!   arithmetic.
//! - [`layout`]: the fixed user address-space layout.
//! - [`page_table`]: page-directory and page-table entries, and the
//!   read-only [`AddressSpace`] introspection view.
//! - [`frame`]: the physical frame store with per-frame reference counts.
//! - [`env`]: the environment table.
//! - [`fault`]: fault records and the upcall type.
//! - [`kernel`]: the system-call surface itself.
//!
//! [`Kernel`]: kernel::Kernel
//! [`AddressSpace`]: page_table::AddressSpace

#![cfg_attr(not(test), no_std)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod addressing;
pub mod env;
pub mod fault;
pub mod frame;
pub mod kernel;
pub mod layout;
pub mod page_table;

pub use env::{EnvId, EnvStatus};
pub use fault::{Fault, FaultCode, FaultHandler};
pub use kernel::{Kernel, Spawn};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of failure that a
/// primitive of the system-call surface can report. The numeric values
/// follow the usual errno conventions so that a raw `isize` boundary
/// (the "negative return value" of a syscall) can be crossed in either
/// direction with [`SysError::into_isize`] and `TryFrom<isize>`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(isize)]
pub enum SysError {
    /// No mapping exists at the given address. (ENOENT)
    NotMapped = -2,
    /// The environment id does not name a live environment the caller
    /// may act on. (ESRCH)
    BadEnvironment = -3,
    /// Ran out of free environment slots. (EAGAIN)
    NoFreeEnvironment = -11,
    /// The physical frame store is exhausted. (ENOMEM)
    NoMemory = -12,
    /// Unrecoverable memory-protection violation; the faulting
    /// environment has been terminated. (EACCES)
    InvalidAccess = -13,
    /// An address lies outside the user-manageable region. (EFAULT)
    BadAddress = -14,
    /// Misaligned address, malformed permission bits, or an otherwise
    /// nonsensical argument. (EINVAL)
    InvalidArgument = -22,
    /// The operation is recognized but intentionally not provided. (EOPNOTSUPP)
    NotSupported = -95,
}

impl SysError {
    /// Converts the [`SysError`] into its raw negative error code, for
    /// use at a numeric syscall-return boundary.
    #[inline]
    pub fn into_isize(self) -> isize {
        self.into()
    }
}
