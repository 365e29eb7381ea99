// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous rendezvous IPC with optional page grant
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (arm/send/grant/rejections)
//! PUBLIC API: arm_recv(), try_send(), IpcError
//! DEPENDS_ON: env::EnvTable, mm::AddressSpaceManager
//! INVARIANTS: At most one pending message per receiver; no state changes before every check
//!             passes; granted pages never carry more rights than the sender's mapping

use crate::{
    env::{EnvError, EnvTable},
    mm::{AddressSpaceError, AddressSpaceManager, PageFlags, PermError, PAGE_SIZE, UTOP},
    types::{EnvId, UserVa},
};

/// IPC failures, in the order they are checked.
#[must_use = "IPC errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Target does not resolve.
    BadEnv,
    /// Target is not waiting in `recv`.
    NotRecv,
    /// Address below `UTOP` is not page aligned.
    Unaligned,
    /// `perm` is malformed or escalates the source mapping.
    Perm(PermError),
    /// Source address is not mapped in the sender.
    NotMapped,
    /// Receiver mapping could not be installed.
    NoMem,
}

impl From<EnvError> for IpcError {
    fn from(_: EnvError) -> Self {
        Self::BadEnv
    }
}

impl From<PermError> for IpcError {
    fn from(err: PermError) -> Self {
        Self::Perm(err)
    }
}

impl From<AddressSpaceError> for IpcError {
    fn from(err: AddressSpaceError) -> Self {
        match err {
            AddressSpaceError::InvalidHandle => Self::BadEnv,
            _ => Self::NoMem,
        }
    }
}

/// Puts `caller` into the receiving state and takes it off the run queue.
///
/// A `dst_addr` at or above `UTOP` means the caller does not want a page.
pub fn arm_recv(envs: &mut EnvTable, caller: EnvId, dst_addr: usize) -> Result<(), IpcError> {
    let dst = if dst_addr < UTOP {
        Some(UserVa::page(dst_addr).ok_or(IpcError::Unaligned)?)
    } else {
        None
    };
    envs.get_mut(caller).ok_or(IpcError::BadEnv)?.block_on_recv(dst);
    Ok(())
}

/// Delivers `value` (and the page at `src_addr` if it is below `UTOP`) to a waiting `target`.
///
/// Any environment may send to any other; the ownership rule is waived.
pub fn try_send(
    envs: &mut EnvTable,
    spaces: &mut AddressSpaceManager,
    sender: EnvId,
    target: EnvId,
    value: u32,
    src_addr: usize,
    perm: usize,
) -> Result<(), IpcError> {
    let target = envs.resolve(target, sender, false)?;
    let receiver = envs.get(target).ok_or(IpcError::BadEnv)?;
    if !receiver.ipc.recving {
        return Err(IpcError::NotRecv);
    }
    let dst = receiver.ipc.dst_addr;
    let dst_space = receiver.space().ok_or(IpcError::BadEnv)?;

    let mut granted = None;
    if src_addr < UTOP {
        if src_addr % PAGE_SIZE != 0 {
            return Err(IpcError::Unaligned);
        }
        let flags = PageFlags::from_syscall(perm)?;
        let src_space = envs.get(sender).and_then(|env| env.space()).ok_or(IpcError::BadEnv)?;
        let pte = spaces.lookup(src_space, src_addr)?.ok_or(IpcError::NotMapped)?;
        if flags.contains(PageFlags::WRITABLE) && !pte.flags.contains(PageFlags::WRITABLE) {
            return Err(IpcError::Perm(PermError::WriteEscalation));
        }
        if let Some(dst) = dst {
            spaces.map_frame(dst_space, dst, pte.frame, flags)?;
            granted = Some(flags);
        }
    }

    let receiver = envs.get_mut(target).ok_or(IpcError::BadEnv)?;
    receiver.deliver(sender, value, granted);
    log_debug!(target: "ipc", "{} -> {} value {:#x} page {:?}", sender, target, value, granted);
    Ok(())
}
