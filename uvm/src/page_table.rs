//! Entries of the two-level page table and their permissions.
//!
//! An environment's address space is described by a page directory of
//! 1024 [`Pde`] entries, each of which may point to a page table of 1024
//! [`Pte`] entries. Both kinds of table occupy exactly one physical
//! frame and are stored in the frame store like any other page; an entry
//! is a 32-bit word holding a frame's physical address in its high bits
//! and permission flags in its low twelve bits.
//!
//! The permission bits visible to user-level code are [`PteFlags::P`]
//! (present), [`PteFlags::W`] (writable), [`PteFlags::U`]
//! (user-accessible) and [`PteFlags::COW`]. The `COW` marker lives in a
//! bit the hardware ignores: it has no effect on address translation and
//! exists purely as a software convention, marking an entry whose frame
//! is shared and must be copied before the first write. Keeping the
//! convention honest is the job of user-level policy, not of this crate.
//!
//! [`AddressSpace`] is the read-only introspection view over a page
//! directory, the equivalent of a kernel exposing the live tables to the
//! owning environment through a stable read-only mapping. User-level
//! fault handlers and address-space scanners are built on it.

use crate::{
    SysError,
    addressing::{ENTRIES_PER_TABLE, PAGE_MASK, Pa, Va},
    frame::FrameStore,
};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

bitflags::bitflags! {
    /// Flags of a page-table entry.
    pub struct PteFlags: u32 {
        /// Present; must be 1 for the entry to map a page.
        const P = 1 << 0;
        /// Writable; if 0, stores to the page fault.
        const W = 1 << 1;
        /// User-accessible; if 0, the page cannot be touched from user level.
        const U = 1 << 2;
        /// Copy-on-write marker, carried in a software-available bit.
        ///
        /// An entry with `COW` set references a frame that may be shared
        /// with another environment; the entry must never also carry
        /// [`PteFlags::W`].
        const COW = 1 << 11;

        /// Every bit a mapping primitive accepts from its caller.
        const MAPPABLE = Self::P.bits | Self::W.bits | Self::U.bits | Self::COW.bits;
    }
}

bitflags::bitflags! {
    /// Flags of a page-directory entry.
    pub struct PdeFlags: u32 {
        /// Present; must be 1 to reference a page table.
        const P = 1 << 0;
        /// Writable; directory entries are always created writable,
        /// leaf entries decide the effective permission.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
    }
}

/// Page Table Entry (PTE).
///
/// A [`Pte`] is the leaf-level entry mapping one virtual page to one
/// physical frame plus its permission bits. Entries are read and written
/// in place inside page-table frames, so the type is a transparent
/// 32-bit word that can be reinterpreted from raw frame bytes.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, FromZeroes, FromBytes, AsBytes)]
pub struct Pte(u32);

impl Pte {
    /// An entry that maps nothing.
    pub const EMPTY: Self = Self(0);

    /// Composes an entry from a frame address and permission flags.
    ///
    /// # Returns
    /// - `Ok(Pte)` for a page-aligned `pa` and flags within
    ///   [`PteFlags::MAPPABLE`].
    /// - `Err(SysError::InvalidArgument)` otherwise.
    #[inline]
    pub fn new(pa: Pa, flags: PteFlags) -> Result<Self, SysError> {
        if pa.offset() != 0 || !PteFlags::MAPPABLE.contains(flags) {
            Err(SysError::InvalidArgument)
        } else {
            Ok(Self(pa.into_usize() as u32 | flags.bits()))
        }
    }

    /// Get the physical address of the frame this entry maps.
    ///
    /// # Returns
    /// - `Some(Pa)` if the entry is present.
    /// - `None` if the entry is not present.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new((self.0 as usize) & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

/// Page Directory Entry (PDE).
///
/// A [`Pde`] is the first-level entry referencing the frame that holds a
/// page table for one 4 MiB span of virtual addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, FromZeroes, FromBytes, AsBytes)]
pub struct Pde(u32);

impl Pde {
    /// An entry that references no page table.
    pub const EMPTY: Self = Self(0);

    /// Composes an entry from a page-table frame address and flags.
    #[inline]
    pub(crate) fn new(pa: Pa, flags: PdeFlags) -> Self {
        debug_assert_eq!(pa.offset(), 0);
        Self(pa.into_usize() as u32 | flags.bits())
    }

    /// Get the physical address of the page table this entry references.
    ///
    /// # Returns
    /// - `Some(Pa)` if the entry is present.
    /// - `None` if the entry is not present.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PdeFlags::P) {
            Pa::new((self.0 as usize) & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PdeFlags {
        PdeFlags::from_bits_truncate(self.0)
    }
}

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pde({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

/// View a frame's bytes as a page directory.
pub(crate) fn dir_of(frames: &FrameStore, pgdir: Pa) -> &[Pde] {
    Pde::slice_from(&frames.bytes(pgdir)[..]).expect("a frame is exactly one directory")
}

/// View a frame's bytes as a mutable page directory.
pub(crate) fn dir_of_mut(frames: &mut FrameStore, pgdir: Pa) -> &mut [Pde] {
    Pde::mut_slice_from(&mut frames.bytes_mut(pgdir)[..]).expect("a frame is exactly one directory")
}

/// View a frame's bytes as a page table.
pub(crate) fn table_of(frames: &FrameStore, table: Pa) -> &[Pte] {
    Pte::slice_from(&frames.bytes(table)[..]).expect("a frame is exactly one table")
}

/// View a frame's bytes as a mutable page table.
pub(crate) fn table_of_mut(frames: &mut FrameStore, table: Pa) -> &mut [Pte] {
    Pte::mut_slice_from(&mut frames.bytes_mut(table)[..]).expect("a frame is exactly one table")
}

/// A read-only view of one environment's page-table structure.
///
/// The kernel exposes the live page directory and page tables of an
/// environment through this view, the moral equivalent of mapping the
/// tables read-only into the environment's own address space. It is
/// always available to an environment for itself, which is what lets
/// user-level code classify its own mappings and verify a faulting
/// entry without any further kernel help.
pub struct AddressSpace<'a> {
    frames: &'a FrameStore,
    pgdir: Pa,
}

impl<'a> AddressSpace<'a> {
    pub(crate) fn new(frames: &'a FrameStore, pgdir: Pa) -> Self {
        Self { frames, pgdir }
    }

    /// The directory entry for directory index `dirx`.
    ///
    /// Indices at or beyond [`ENTRIES_PER_TABLE`] read as empty.
    #[inline]
    pub fn pde(&self, dirx: usize) -> Pde {
        if dirx < ENTRIES_PER_TABLE {
            dir_of(self.frames, self.pgdir)[dirx]
        } else {
            Pde::EMPTY
        }
    }

    /// The page table referenced by directory entry `dirx`, if present.
    #[inline]
    pub fn table(&self, dirx: usize) -> Option<&'a [Pte]> {
        self.pde(dirx).pa().map(|pa| table_of(self.frames, pa))
    }

    /// Walks both levels and returns the present leaf entry mapping
    /// `va`, or `None` if no table exists for the span or the entry is
    /// not present.
    #[inline]
    pub fn pte(&self, va: Va) -> Option<Pte> {
        let entry = self.table(va.dir_index())?[va.table_index()];
        entry.pa().map(|_| entry)
    }
}
