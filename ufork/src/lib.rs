//! # ufork: user-level `fork` with copy-on-write.
//!
//! This crate duplicates a running environment's entire address space
//! without copying a single page up front, using nothing but the
//! primitive page-mapping system calls and the page-fault upcall that
//! the [`uvm`] kernel exposes. The kernel never hears about
//! copy-on-write at all: the sharing discipline is a pure user-level
//! protocol built out of one software permission bit and a fault
//! handler.
//!
//! The mechanism has four parts:
//!
//! - [`scan`]: walks the calling environment's two-level page tables
//!   through the read-only introspection view and enumerates every
//!   present, user-accessible page below the stack-growth boundary.
//! - [`dup`]: the per-page policy. A writable (or already
//!   copy-on-write) page is mapped into the child *and* remapped in the
//!   parent with the `COW` marker and without the write bit; a genuinely
//!   read-only page is shared as-is.
//! - [`pgfault`]: the copy-on-write fault resolver. On the first write
//!   to a marked page, in whichever environment, it materializes a
//!   private writable copy through a reserved scratch mapping and
//!   resumes the faulting store.
//! - [`fork`]: the orchestrator tying the above together around the
//!   kernel's blank-child primitive, plus the [`Process`] handle that
//!   models the cached "who am I" an environment inherits across the
//!   duplication point.
//!
//! [`demand`] is a second, independent user of the same upcall seam: a
//! handler that backs faulting pages with fresh zero-filled memory on
//! first touch.
//!
//! ## What this crate never does
//!
//! It never copies eagerly, never shares a writable page without the
//! `COW` marker, and never creates the child environment itself — the
//! kernel's creation primitive returns a blank child, and everything
//! else is assembled from user level. A shared-everything variant
//! ([`Process::fork_shared`]) is deliberately left unimplemented.

#![cfg_attr(not(test), no_std)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod demand;
pub mod dup;
pub mod fork;
pub mod pgfault;
pub mod scan;

pub use fork::{ForkResult, Process};
