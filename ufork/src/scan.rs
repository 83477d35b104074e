//! Address-space scanning.
//!
//! Duplication needs to visit every page an environment has mapped
//! below the stack-growth boundary. The page tables are sparse: most of
//! the 1024 directory entries reference no page table at all, and
//! walking into them would mean inspecting 1024 empty leaf entries
//! each. [`UserPages`] therefore iterates the two levels directly,
//! advancing a whole 4 MiB span in one step whenever the directory
//! entry is empty. That skip is an optimization, not a correctness
//! requirement: an empty span simply yields no pages either way.
//!
//! The iterator is deliberately decoupled from any per-page decision —
//! it yields `(Va, Pte)` pairs and nothing else — so the duplication
//! policy in [`crate::dup`] stays a pure function of one page.

use uvm::{
    addressing::{ENTRIES_PER_TABLE, Va},
    page_table::{AddressSpace, Pte, PteFlags},
};

/// Iterator over the present, user-accessible leaf entries of an
/// address space, from virtual address zero up to (but not including)
/// `limit`.
pub struct UserPages<'a> {
    space: AddressSpace<'a>,
    limit: Va,
    dirx: usize,
    tablex: usize,
}

impl<'a> UserPages<'a> {
    /// Creates a scanner over `space`, bounded by `limit` (rounded down
    /// to a page boundary).
    pub fn new(space: AddressSpace<'a>, limit: Va) -> Self {
        Self {
            space,
            limit: limit.page_down(),
            dirx: 0,
            tablex: 0,
        }
    }
}

impl Iterator for UserPages<'_> {
    type Item = (Va, Pte);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.dirx >= ENTRIES_PER_TABLE {
                return None;
            }
            let va = Va::from_indices(self.dirx, self.tablex, 0)?;
            if va >= self.limit {
                return None;
            }
            let Some(table) = self.space.table(self.dirx) else {
                // No second-level table for this span: skip it whole.
                self.dirx += 1;
                self.tablex = 0;
                continue;
            };
            let pte = table[self.tablex];
            self.tablex += 1;
            if self.tablex == ENTRIES_PER_TABLE {
                self.tablex = 0;
                self.dirx += 1;
            }
            if pte.pa().is_some() && pte.flags().contains(PteFlags::U) {
                return Some((va, pte));
            }
        }
    }
}
