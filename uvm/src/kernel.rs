//! The system-call surface.
//!
//! [`Kernel`] exposes the handful of primitives user-level memory
//! management is built from. The design point is minimality: the kernel
//! will allocate a frame, map a frame, unmap a frame, create a blank
//! environment, flip its run status, and register a fault upcall — and
//! that is all. It never decides *what* to map; address-space policy
//! (including all of copy-on-write) lives entirely above this surface.
//!
//! ## Acting on another environment
//!
//! Primitives that take a target [`EnvId`] require the target to be the
//! calling environment itself or one of its immediate children. That is
//! exactly the authority a parent needs to assemble a child's address
//! space before marking it runnable, and nothing more.
//!
//! ## Memory access and fault delivery
//!
//! [`Kernel::read`] and [`Kernel::write`] are the emulation's MMU: they
//! translate through the current environment's page tables with the
//! same permission rules the hardware applies. A violating access
//! synchronously transfers control to the environment's registered
//! upcall — after checking that the private exception stack the upcall
//! runs on is present, writable, and not itself copy-on-write — and
//! retries the access exactly once when the upcall returns success.
//! A missing upcall, a broken exception stack, a nested fault, or an
//! upcall that reports an error all terminate the environment.

use crate::{
    SysError,
    addressing::{ENTRIES_PER_TABLE, PAGE_SIZE, Pa, Va},
    env::{Env, EnvId, EnvStatus, EnvTable},
    fault::{Fault, FaultCode, FaultHandler},
    frame::FrameStore,
    layout::{self, USER_LIMIT},
    page_table::{self, AddressSpace, Pde, PdeFlags, Pte, PteFlags},
};
use log::{debug, warn};

/// Default number of physical frames backing a [`Kernel`].
pub const DEFAULT_FRAME_CAPACITY: usize = 1024;

/// Result of the blank-child creation primitive.
///
/// Creation logically returns twice: once in the creator, naming the
/// new environment, and once in the new environment itself the first
/// time it runs the same call. The two returns are distinguished by the
/// variants here rather than by a sentinel value.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Spawn {
    /// Returned in the creating environment.
    Parent {
        /// The new environment's identity.
        child: EnvId,
    },
    /// Returned in the created environment's own execution.
    Child,
}

/// A builder for the kernel's fixed resource limits.
pub struct KernelBuilder {
    frame_capacity: usize,
}

impl KernelBuilder {
    /// Sets the number of physical frames available.
    pub fn frame_capacity(mut self, frames: usize) -> Self {
        self.frame_capacity = frames;
        self
    }

    /// Builds the kernel with one initial environment, which is current
    /// and running.
    pub fn build(self) -> Kernel {
        let mut frames = FrameStore::new(self.frame_capacity);
        let pgdir = frames
            .alloc()
            .expect("frame capacity cannot hold the initial environment");
        frames.incref(pgdir);
        let mut envs = EnvTable::new();
        let cur = envs
            .create(pgdir, None, EnvStatus::Running)
            .expect("the empty table has a free slot");
        Kernel { frames, envs, cur }
    }
}

/// The minimal page-mapping kernel.
pub struct Kernel {
    frames: FrameStore,
    envs: EnvTable,
    cur: EnvId,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// A kernel with the default resource limits.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a kernel.
    pub fn builder() -> KernelBuilder {
        KernelBuilder {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
        }
    }

    /// Returns the calling environment's own identity. Never fails.
    #[inline]
    pub fn getenvid(&self) -> EnvId {
        self.cur
    }

    /// Run status of `env`, observable even after its death while the
    /// table slot survives.
    pub fn status(&self, env: EnvId) -> Option<EnvStatus> {
        self.envs.peek(env).map(|e| e.status)
    }

    /// Number of live physical frames.
    #[inline]
    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    /// Total physical frame capacity.
    #[inline]
    pub fn frame_capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// Reference count of the frame at `pa`, or `None` if nothing is
    /// allocated there.
    pub fn frame_refs(&self, pa: Pa) -> Option<u32> {
        self.frames.refs(pa)
    }

    /// Read-only view of `env`'s page-table structure.
    ///
    /// Always available to the calling environment for itself; views of
    /// other live environments are permitted as well, since the view
    /// cannot mutate anything.
    pub fn mappings(&self, env: EnvId) -> Result<AddressSpace<'_>, SysError> {
        let e = self.envs.get(env)?;
        Ok(AddressSpace::new(&self.frames, e.pgdir))
    }

    /// Creates a new blank environment.
    ///
    /// The child starts with an empty address space, no registered
    /// upcall, and status [`EnvStatus::NotRunnable`]. See [`Spawn`] for
    /// the two-sided return contract: the first time the new
    /// environment itself invokes this primitive it observes
    /// [`Spawn::Child`] instead of creating a grandchild.
    ///
    /// # Returns
    /// - `Ok(Spawn::Parent { child })` in the creator.
    /// - `Ok(Spawn::Child)` in the created environment.
    /// - `Err(SysError::NoMemory)` or `Err(SysError::NoFreeEnvironment)`
    ///   when the respective table is exhausted.
    pub fn fork_env(&mut self) -> Result<Spawn, SysError> {
        let me = self.envs.get_mut(self.cur)?;
        if me.nascent {
            me.nascent = false;
            debug!("environment {:?} observed its own creation", me.id);
            return Ok(Spawn::Child);
        }
        let pgdir = self.frames.alloc()?;
        self.frames.incref(pgdir);
        match self.envs.create(pgdir, Some(self.cur), EnvStatus::NotRunnable) {
            Ok(child) => {
                self.envs
                    .get_mut(child)
                    .expect("the environment was just created")
                    .nascent = true;
                debug!("environment {:?} spawned blank child {:?}", self.cur, child);
                Ok(Spawn::Parent { child })
            }
            Err(e) => {
                self.frames.decref(pgdir);
                Err(e)
            }
        }
    }

    /// Allocates a zero-filled page and maps it at `va` in `env` with
    /// permissions `perm`.
    ///
    /// Any page previously mapped at `va` is silently replaced.
    ///
    /// # Returns
    /// - `Err(SysError::BadEnvironment)` if `env` is not the caller or
    ///   one of its children.
    /// - `Err(SysError::InvalidArgument)` if `va` is misaligned or
    ///   `perm` is not a user-settable permission set including
    ///   user-accessible and present.
    /// - `Err(SysError::BadAddress)` if `va` is outside the user region.
    /// - `Err(SysError::NoMemory)` if the frame store is exhausted.
    pub fn page_alloc(&mut self, env: EnvId, va: Va, perm: PteFlags) -> Result<(), SysError> {
        let pgdir = self.checked_env(env)?.pgdir;
        check_user_va(va)?;
        check_perm(perm)?;
        let pa = self.frames.alloc()?;
        if let Err(e) = self.install(pgdir, va, pa, perm) {
            self.frames.free(pa);
            return Err(e);
        }
        Ok(())
    }

    /// Maps the page at `src_va` in `src_env` into `dst_env` at
    /// `dst_va` with permissions `perm`. Both environments reference
    /// the same physical frame afterwards, each through its own entry.
    ///
    /// Requesting [`PteFlags::W`] when the source mapping is itself not
    /// writable is refused: a mapping must not be used to escalate a
    /// read-only view into a writable one.
    ///
    /// # Returns
    /// - `Err(SysError::NotMapped)` if nothing is mapped at `src_va`.
    /// - Environment, alignment, permission and memory errors as for
    ///   [`Kernel::page_alloc`].
    pub fn page_map(
        &mut self,
        src_env: EnvId,
        src_va: Va,
        dst_env: EnvId,
        dst_va: Va,
        perm: PteFlags,
    ) -> Result<(), SysError> {
        let src_pgdir = self.checked_env(src_env)?.pgdir;
        let dst_pgdir = self.checked_env(dst_env)?.pgdir;
        check_user_va(src_va)?;
        check_user_va(dst_va)?;
        check_perm(perm)?;
        let src_pte = AddressSpace::new(&self.frames, src_pgdir)
            .pte(src_va)
            .ok_or(SysError::NotMapped)?;
        if perm.contains(PteFlags::W) && !src_pte.flags().contains(PteFlags::W) {
            return Err(SysError::InvalidArgument);
        }
        let pa = src_pte.pa().expect("a looked-up entry is present");
        self.install(dst_pgdir, dst_va, pa, perm)
    }

    /// Removes the mapping at `va` in `env`, releasing the frame
    /// reference it held.
    ///
    /// # Returns
    /// - `Err(SysError::NotMapped)` if nothing is mapped at `va`.
    pub fn page_unmap(&mut self, env: EnvId, va: Va) -> Result<(), SysError> {
        let pgdir = self.checked_env(env)?.pgdir;
        check_user_va(va)?;
        let table = page_table::dir_of(&self.frames, pgdir)[va.dir_index()]
            .pa()
            .ok_or(SysError::NotMapped)?;
        let entries = page_table::table_of_mut(&mut self.frames, table);
        let old = entries[va.table_index()];
        let pa = old.pa().ok_or(SysError::NotMapped)?;
        entries[va.table_index()] = Pte::EMPTY;
        self.frames.decref(pa);
        Ok(())
    }

    /// Sets `env`'s run status.
    ///
    /// Only [`EnvStatus::Runnable`] and [`EnvStatus::NotRunnable`] may
    /// be set this way; the other states are the kernel's own.
    pub fn set_status(&mut self, env: EnvId, status: EnvStatus) -> Result<(), SysError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(SysError::InvalidArgument);
        }
        self.checked_env(env)?;
        self.envs
            .get_mut(env)
            .expect("the environment was just checked")
            .status = status;
        Ok(())
    }

    /// Registers `env`'s page-fault upcall entry point. The exception
    /// stack the upcall runs on is the fixed page below
    /// [`layout::UXSTACK_TOP`]; providing it is the caller's business.
    pub fn set_fault_upcall(&mut self, env: EnvId, handler: FaultHandler) -> Result<(), SysError> {
        self.checked_env(env)?;
        self.envs
            .get_mut(env)
            .expect("the environment was just checked")
            .upcall = Some(handler);
        Ok(())
    }

    /// Transfers the execution context to `env`, which must be
    /// runnable. The previously running environment becomes runnable.
    pub fn switch_to(&mut self, env: EnvId) -> Result<(), SysError> {
        if env == self.cur {
            return Ok(());
        }
        let next = self.envs.get(env)?;
        if next.status != EnvStatus::Runnable {
            return Err(SysError::BadEnvironment);
        }
        if let Ok(prev) = self.envs.get_mut(self.cur) {
            if prev.status == EnvStatus::Running {
                prev.status = EnvStatus::Runnable;
            }
        }
        self.envs
            .get_mut(env)
            .expect("the environment was just checked")
            .status = EnvStatus::Running;
        self.cur = env;
        Ok(())
    }

    /// Tears down `env`, releasing every frame its address space
    /// references. The target must be the caller or one of its
    /// children.
    pub fn destroy(&mut self, env: EnvId) -> Result<(), SysError> {
        self.checked_env(env)?;
        self.teardown(env);
        Ok(())
    }

    /// Reads `buf.len()` bytes of the current environment's memory
    /// starting at `va`, faulting like a user-level load would.
    pub fn read(&mut self, va: Va, buf: &mut [u8]) -> Result<(), SysError> {
        let mut va = va;
        let mut done = 0;
        while done < buf.len() {
            let off = va.offset();
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            let pa = self.access(va, false)?;
            buf[done..done + n].copy_from_slice(&self.frames.bytes(pa)[off..off + n]);
            done += n;
            va = va.page_down() + PAGE_SIZE;
        }
        Ok(())
    }

    /// Writes `bytes` into the current environment's memory starting at
    /// `va`, faulting like a user-level store would.
    pub fn write(&mut self, va: Va, bytes: &[u8]) -> Result<(), SysError> {
        let mut va = va;
        let mut done = 0;
        while done < bytes.len() {
            let off = va.offset();
            let n = (PAGE_SIZE - off).min(bytes.len() - done);
            let pa = self.access(va, true)?;
            self.frames.bytes_mut(pa)[off..off + n].copy_from_slice(&bytes[done..done + n]);
            done += n;
            va = va.page_down() + PAGE_SIZE;
        }
        Ok(())
    }

    /// Translates `va` for an access by the current environment,
    /// delivering a fault upcall on violation and retrying once.
    fn access(&mut self, va: Va, write: bool) -> Result<Pa, SysError> {
        for attempt in 0..2 {
            let e = self.envs.get(self.cur)?;
            let pte = AddressSpace::new(&self.frames, e.pgdir).pte(va);
            if let Some(pte) = pte {
                let flags = pte.flags();
                if flags.contains(PteFlags::U) && (!write || flags.contains(PteFlags::W)) {
                    return Ok(pte.pa().expect("a looked-up entry is present"));
                }
            }
            if attempt > 0 {
                break;
            }
            let mut code = FaultCode::USER;
            if write {
                code |= FaultCode::WRITE;
            }
            if pte.is_some() {
                code |= FaultCode::PRESENT;
            }
            self.deliver_fault(Fault { va, code })?;
        }
        // The upcall claimed success but the access still violates.
        warn!("access at {} still faults after resolution", va);
        self.kill(self.cur);
        Err(SysError::InvalidAccess)
    }

    /// Transfers control to the current environment's fault upcall.
    fn deliver_fault(&mut self, fault: Fault) -> Result<(), SysError> {
        let env = self.cur;
        let (handler, depth) = {
            let e = self.envs.get(env)?;
            (e.upcall, e.fault_depth)
        };
        let Some(handler) = handler else {
            warn!("fault at {} in {:?} with no upcall registered", fault.va, env);
            self.kill(env);
            return Err(SysError::InvalidAccess);
        };
        if depth > 0 {
            warn!("nested fault at {} in {:?}", fault.va, env);
            self.kill(env);
            return Err(SysError::InvalidAccess);
        }
        if !self.uxstack_usable(env) {
            warn!("fault at {} in {:?} without a usable exception stack", fault.va, env);
            self.kill(env);
            return Err(SysError::InvalidAccess);
        }
        debug!("delivering fault {:?} to {:?}", fault, env);
        self.envs
            .get_mut(env)
            .expect("the environment was just checked")
            .fault_depth = 1;
        let result = handler(self, &fault);
        if let Ok(e) = self.envs.get_mut(env) {
            e.fault_depth = 0;
        }
        result.map_err(|err| {
            warn!("upcall for fault at {} in {:?} failed: {:?}", fault.va, env, err);
            self.kill(env);
            SysError::InvalidAccess
        })
    }

    /// The exception stack must be present, user-writable, and not
    /// copy-on-write: the upcall pushes state onto it, and a stack that
    /// itself faults would leave no way to recover.
    fn uxstack_usable(&self, env: EnvId) -> bool {
        let Ok(e) = self.envs.get(env) else {
            return false;
        };
        AddressSpace::new(&self.frames, e.pgdir)
            .pte(layout::uxstack_page())
            .map(|pte| {
                let flags = pte.flags();
                flags.contains(PteFlags::U | PteFlags::W) && !flags.contains(PteFlags::COW)
            })
            .unwrap_or(false)
    }

    fn kill(&mut self, env: EnvId) {
        warn!("terminating environment {:?}", env);
        self.teardown(env);
    }

    fn teardown(&mut self, env: EnvId) {
        let Ok(e) = self.envs.get(env) else {
            return;
        };
        let pgdir = e.pgdir;
        for dirx in 0..ENTRIES_PER_TABLE {
            let Some(table) = page_table::dir_of(&self.frames, pgdir)[dirx].pa() else {
                continue;
            };
            for tablex in 0..ENTRIES_PER_TABLE {
                if let Some(pa) = page_table::table_of(&self.frames, table)[tablex].pa() {
                    self.frames.decref(pa);
                }
            }
            self.frames.decref(table);
        }
        self.frames.decref(pgdir);
        let e = self
            .envs
            .get_mut(env)
            .expect("the environment was alive above");
        e.status = EnvStatus::Dead;
        e.upcall = None;
        debug!("environment {:?} torn down", env);
    }

    /// Resolves `env` if it is live and the caller has authority over
    /// it: itself, or one of its immediate children.
    fn checked_env(&self, env: EnvId) -> Result<&Env, SysError> {
        let e = self.envs.get(env)?;
        if env == self.cur || e.parent == Some(self.cur) {
            Ok(e)
        } else {
            Err(SysError::BadEnvironment)
        }
    }

    /// Writes the leaf entry mapping `va` to `pa` with `perm`, creating
    /// the page table for the span on demand and moving frame
    /// references from any entry being replaced.
    fn install(&mut self, pgdir: Pa, va: Va, pa: Pa, perm: PteFlags) -> Result<(), SysError> {
        let table = self.ensure_table(pgdir, va.dir_index())?;
        let new = Pte::new(pa, perm | PteFlags::P)?;
        let entries = page_table::table_of_mut(&mut self.frames, table);
        let old = entries[va.table_index()];
        entries[va.table_index()] = new;
        self.frames.incref(pa);
        if let Some(old_pa) = old.pa() {
            self.frames.decref(old_pa);
        }
        Ok(())
    }

    fn ensure_table(&mut self, pgdir: Pa, dirx: usize) -> Result<Pa, SysError> {
        if let Some(table) = page_table::dir_of(&self.frames, pgdir)[dirx].pa() {
            return Ok(table);
        }
        let table = self.frames.alloc()?;
        self.frames.incref(table);
        page_table::dir_of_mut(&mut self.frames, pgdir)[dirx] =
            Pde::new(table, PdeFlags::P | PdeFlags::W | PdeFlags::U);
        Ok(table)
    }
}

fn check_user_va(va: Va) -> Result<(), SysError> {
    if va.offset() != 0 {
        Err(SysError::InvalidArgument)
    } else if va >= USER_LIMIT {
        Err(SysError::BadAddress)
    } else {
        Ok(())
    }
}

fn check_perm(perm: PteFlags) -> Result<(), SysError> {
    if perm.contains(PteFlags::U | PteFlags::P) && PteFlags::MAPPABLE.contains(perm) {
        Ok(())
    } else {
        Err(SysError::InvalidArgument)
    }
}
