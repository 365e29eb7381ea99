// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment registry (records, id resolution, teardown)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (id uniqueness across reuse)
//! PUBLIC API: EnvTable (alloc/resolve/destroy/reap), Env, EnvStatus, IpcState, IpcDelivery
//! DEPENDS_ON: mm::AddressSpaceManager, trap::TrapFrame, types::{EnvId,UserVa}
//! INVARIANTS: Stale ids never resolve; FREE and DYING records never resolve; a record's address
//!             space is released before its slot is reused

#[cfg(test)]
mod tests_prop;

use alloc::vec::Vec;

use crate::{
    mm::{AddressSpaceManager, AsHandle, PageFlags},
    trap::TrapFrame,
    types::{EnvId, UserVa, NENV},
};

/// Scheduling status of an environment record. Discriminants are the ABI values accepted by
/// `env_set_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decodes a raw status word.
    pub fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }

    /// Only `Runnable` and `NotRunnable` records are live.
    #[inline]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Runnable | Self::NotRunnable)
    }
}

/// Registry errors.
#[must_use = "registry errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Id does not name a live record, or the caller has no authority over it.
    BadEnv,
    /// Every record is in use.
    NoFreeEnv,
    /// Address space could not be created.
    NoMem,
}

/// Per-environment rendezvous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcState {
    /// Waiting in `ipc_recv`.
    pub recving: bool,
    /// Where a granted page lands; `None` when the receiver declined pages.
    pub dst_addr: Option<UserVa>,
    pub from: EnvId,
    pub value: u32,
    /// Flags of the granted page, `None` if no page was transferred.
    pub perm: Option<PageFlags>,
    // Set on delivery, cleared when the resumed receiver collects it.
    delivered: bool,
}

impl IpcState {
    const fn idle() -> Self {
        Self {
            recving: false,
            dst_addr: None,
            from: EnvId::CURRENT,
            value: 0,
            perm: None,
            delivered: false,
        }
    }
}

/// Message handed to a receiver when it resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcDelivery {
    pub from: EnvId,
    pub value: u32,
    pub perm: Option<PageFlags>,
}

/// Environment record.
pub struct Env {
    id: EnvId,
    parent: EnvId,
    status: EnvStatus,
    space: Option<AsHandle>,
    /// Saved user register state.
    pub tf: TrapFrame,
    /// Entry point for user-level page-fault handling.
    pub pgfault_upcall: Option<usize>,
    pub ipc: IpcState,
}

impl Env {
    fn vacant() -> Self {
        Self {
            id: EnvId::CURRENT,
            parent: EnvId::CURRENT,
            status: EnvStatus::Free,
            space: None,
            tf: TrapFrame::default(),
            pgfault_upcall: None,
            ipc: IpcState::idle(),
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> EnvId {
        self.parent
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    /// Address space owned by this record; `None` once torn down.
    pub fn space(&self) -> Option<AsHandle> {
        self.space
    }

    /// Enters the receiving state and stops being runnable.
    pub(crate) fn block_on_recv(&mut self, dst: Option<UserVa>) {
        self.ipc.recving = true;
        self.ipc.dst_addr = dst;
        self.ipc.delivered = false;
        self.status = EnvStatus::NotRunnable;
    }

    /// Abandons a pending receive, leaving `ret` as the call's result.
    pub(crate) fn cancel_recv(&mut self, ret: isize) {
        if self.ipc.recving {
            self.ipc.recving = false;
            self.ipc.dst_addr = None;
            self.ipc.delivered = false;
            self.tf.set_return(ret);
        }
    }

    /// Records a completed rendezvous and makes the receiver runnable again.
    pub(crate) fn deliver(&mut self, from: EnvId, value: u32, perm: Option<PageFlags>) {
        self.ipc.recving = false;
        self.ipc.from = from;
        self.ipc.value = value;
        self.ipc.perm = perm;
        self.ipc.delivered = true;
        self.tf.set_return(0);
        self.status = EnvStatus::Runnable;
    }

    /// Hands out the last delivery exactly once.
    pub(crate) fn take_delivery(&mut self) -> Option<IpcDelivery> {
        if !core::mem::take(&mut self.ipc.delivered) {
            return None;
        }
        Some(IpcDelivery { from: self.ipc.from, value: self.ipc.value, perm: self.ipc.perm })
    }
}

/// Arena of environment records indexed by the low bits of [`EnvId`].
pub struct EnvTable {
    envs: Vec<Env>,
    // Free slots, next allocation on top.
    free: Vec<usize>,
}

impl EnvTable {
    /// Creates a table with `capacity` slots (clamped to the id index width).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, NENV);
        let mut envs = Vec::with_capacity(capacity);
        envs.resize_with(capacity, Env::vacant);
        Self { envs, free: (0..capacity).rev().collect() }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.envs.len()
    }

    /// Number of slots available for allocation.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocates a record with a fresh address space. The record starts `NotRunnable` with a
    /// user-mode register frame.
    pub fn alloc(
        &mut self,
        spaces: &mut AddressSpaceManager,
        parent: EnvId,
    ) -> Result<EnvId, EnvError> {
        let index = *self.free.last().ok_or(EnvError::NoFreeEnv)?;
        let id = EnvId::next_incarnation(self.envs[index].id, index);
        let space = spaces.create(id).map_err(|_| EnvError::NoMem)?;
        self.free.pop();
        let env = &mut self.envs[index];
        env.id = id;
        env.parent = parent;
        env.status = EnvStatus::NotRunnable;
        env.space = Some(space);
        env.tf = TrapFrame::new_user(0, 0);
        env.pgfault_upcall = None;
        env.ipc = IpcState::idle();
        log_debug!(target: "env", "alloc {} parent {}", id, parent);
        Ok(id)
    }

    /// Record named exactly by `id`, in any non-free status.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.envs
            .get(id.index())
            .filter(|env| env.id == id && env.status != EnvStatus::Free)
    }

    /// Mutable record named exactly by `id`, in any non-free status.
    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs
            .get_mut(id.index())
            .filter(|env| env.id == id && env.status != EnvStatus::Free)
    }

    fn live(&self, id: EnvId) -> Option<&Env> {
        self.get(id).filter(|env| env.status.is_live())
    }

    /// Translates a user-supplied id into a live record's id.
    ///
    /// `EnvId::CURRENT` names `caller`. With `check_perm`, the target must be the caller or one
    /// of its descendants.
    pub fn resolve(&self, id: EnvId, caller: EnvId, check_perm: bool) -> Result<EnvId, EnvError> {
        let id = if id.is_current_alias() { caller } else { id };
        let env = self.live(id).ok_or(EnvError::BadEnv)?;
        if check_perm && env.id != caller && !self.is_descendant(env.id, caller) {
            return Err(EnvError::BadEnv);
        }
        Ok(env.id)
    }

    /// Walks live parent links from `id` looking for `ancestor`.
    pub fn is_descendant(&self, id: EnvId, ancestor: EnvId) -> bool {
        let mut cursor = match self.get(id) {
            Some(env) => env.parent,
            None => return false,
        };
        // Ids are never reused, so the chain ends; the bound keeps a corrupted table from looping.
        for _ in 0..self.envs.len() {
            if cursor == ancestor {
                return true;
            }
            match self.live(cursor) {
                Some(env) => cursor = env.parent,
                None => return false,
            }
        }
        false
    }

    /// Sets a live record's status.
    pub fn set_status(&mut self, id: EnvId, status: EnvStatus) -> Result<(), EnvError> {
        let env = self.get_mut(id).filter(|env| env.status.is_live()).ok_or(EnvError::BadEnv)?;
        env.status = status;
        Ok(())
    }

    /// Tears down `id`'s address space. The record of the running environment (`current`)
    /// stays `Dying` until [`EnvTable::reap`]; any other record is scrubbed at once.
    ///
    /// Returns the status the record was left in.
    pub fn destroy(
        &mut self,
        spaces: &mut AddressSpaceManager,
        id: EnvId,
        current: Option<EnvId>,
    ) -> Result<EnvStatus, EnvError> {
        let env = self.get_mut(id).filter(|env| env.status.is_live()).ok_or(EnvError::BadEnv)?;
        if let Some(space) = env.space.take() {
            match spaces.destroy(space) {
                Ok(released) => log_debug!(target: "env", "{} released {} pages", id, released),
                Err(err) => log_error!(target: "env", "{} teardown failed: {:?}", id, err),
            }
        }
        env.ipc = IpcState::idle();
        env.status = EnvStatus::Dying;
        if current == Some(id) {
            return Ok(EnvStatus::Dying);
        }
        self.reap(id);
        Ok(EnvStatus::Free)
    }

    /// Returns a `Dying` record's slot to the free list.
    pub fn reap(&mut self, id: EnvId) -> bool {
        let index = id.index();
        match self.envs.get_mut(index) {
            Some(env) if env.id == id && env.status == EnvStatus::Dying => {
                env.status = EnvStatus::Free;
                env.space = None;
                env.pgfault_upcall = None;
                env.ipc = IpcState::idle();
                self.free.push(index);
                true
            }
            _ => false,
        }
    }

    /// Id and status of the record in slot `index`.
    pub fn slot(&self, index: usize) -> Option<(EnvId, EnvStatus)> {
        self.envs.get(index).map(|env| (env.id, env.status))
    }
}
