//! The environment table.
//!
//! An environment is the unit of protection: one address space, one
//! fault upcall, one run status. The table has a fixed number of slots;
//! identifiers encode a slot index plus a generation, so an id that
//! survives its environment's death can never be mistaken for the
//! slot's next occupant.

use crate::{SysError, addressing::Pa, fault::FaultHandler};
use arrayvec::ArrayVec;

/// Maximum number of simultaneously live environments.
pub const NENV: usize = 64;

/// An opaque environment identifier.
///
/// The low bits select a table slot, the high bits are the slot's
/// generation. An id is never zero.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// The raw identifier value.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0
    }

    #[inline]
    const fn slot(self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId({})", self.0)
    }
}

/// Run status of an environment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EnvStatus {
    /// Exists but must not be scheduled.
    NotRunnable,
    /// Eligible to run.
    Runnable,
    /// The environment currently driving the kernel.
    Running,
    /// Terminated; the slot may be recycled.
    Dead,
}

#[derive(Debug)]
pub(crate) struct Env {
    pub id: EnvId,
    pub status: EnvStatus,
    pub pgdir: Pa,
    pub parent: Option<EnvId>,
    pub upcall: Option<FaultHandler>,
    /// Set on a freshly created environment until it observes its own
    /// creation; this is what makes the creation primitive "return
    /// twice".
    pub nascent: bool,
    /// Nonzero while a fault upcall is executing for this environment.
    pub fault_depth: u8,
}

pub(crate) struct EnvTable {
    slots: ArrayVec<Env, NENV>,
}

impl EnvTable {
    pub fn new() -> Self {
        Self {
            slots: ArrayVec::new(),
        }
    }

    /// Creates a new environment, reusing the slot of a dead one when
    /// the table is full.
    pub fn create(
        &mut self,
        pgdir: Pa,
        parent: Option<EnvId>,
        status: EnvStatus,
    ) -> Result<EnvId, SysError> {
        let slot = if self.slots.is_full() {
            self.slots
                .iter()
                .position(|env| env.status == EnvStatus::Dead)
                .ok_or(SysError::NoFreeEnvironment)?
        } else {
            self.slots.push(Env {
                // Placeholder id; fixed up below like any recycled slot.
                id: EnvId(0),
                status: EnvStatus::Dead,
                pgdir,
                parent,
                upcall: None,
                nascent: false,
                fault_depth: 0,
            });
            self.slots.len() - 1
        };
        let generation = (self.slots[slot].id.0 as usize / NENV) + 1;
        let id = EnvId((generation * NENV + slot) as u32);
        self.slots[slot] = Env {
            id,
            status,
            pgdir,
            parent,
            upcall: None,
            nascent: false,
            fault_depth: 0,
        };
        Ok(id)
    }

    /// Looks up a live environment.
    pub fn get(&self, id: EnvId) -> Result<&Env, SysError> {
        self.peek(id)
            .filter(|env| env.status != EnvStatus::Dead)
            .ok_or(SysError::BadEnvironment)
    }

    /// Looks up a live environment, mutably.
    pub fn get_mut(&mut self, id: EnvId) -> Result<&mut Env, SysError> {
        self.slots
            .get_mut(id.slot())
            .filter(|env| env.id == id && env.status != EnvStatus::Dead)
            .ok_or(SysError::BadEnvironment)
    }

    /// Looks up an environment by id even after its death, as long as
    /// the slot has not been recycled.
    pub fn peek(&self, id: EnvId) -> Option<&Env> {
        self.slots.get(id.slot()).filter(|env| env.id == id)
    }
}
