// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Access validator for kernel reads/writes of user memory
//! OWNERS: @kernel-mm-team
//! PUBLIC API: user_mem_check, user_mem_assert, copy_from_user, copy_to_user, AccessFault
//! DEPENDS_ON: env::EnvTable, mm::AddressSpaceManager
//! INVARIANTS: Every byte touched is checked first; nothing at or above ULIM is ever accessible;
//!             a failed assert destroys the environment it checked

use crate::{
    env::EnvTable,
    mm::{page_round_down, AddressSpaceManager, AsHandle, PageFlags, PAGE_SIZE, ULIM},
    types::EnvId,
};

/// First inaccessible address of a rejected range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFault {
    pub va: usize,
}

/// Checks that `[va, va + len)` is mapped in `space` with at least `perm | PRESENT` on every
/// page. An empty range is always accessible.
pub fn user_mem_check(
    spaces: &AddressSpaceManager,
    space: AsHandle,
    va: usize,
    len: usize,
    perm: PageFlags,
) -> Result<(), AccessFault> {
    if len == 0 {
        return Ok(());
    }
    let end = va.checked_add(len).ok_or(AccessFault { va })?;
    let need = perm | PageFlags::PRESENT;
    let mut page = page_round_down(va);
    while page < end {
        let fault = AccessFault { va: page.max(va) };
        if page >= ULIM {
            return Err(fault);
        }
        match spaces.lookup(space, page) {
            Ok(Some(pte)) if pte.flags.contains(need) => {}
            _ => return Err(fault),
        }
        page = match page.checked_add(PAGE_SIZE) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(())
}

fn space_of(envs: &EnvTable, id: EnvId) -> Option<AsHandle> {
    envs.get(id).and_then(|env| env.space())
}

/// Like [`user_mem_check`] against `id`'s own space, but a violation destroys `id`.
///
/// Only ever called on behalf of the running environment, so the record is left `Dying`.
pub fn user_mem_assert(
    envs: &mut EnvTable,
    spaces: &mut AddressSpaceManager,
    id: EnvId,
    va: usize,
    len: usize,
    perm: PageFlags,
) -> Result<(), AccessFault> {
    let checked = match space_of(envs, id) {
        Some(space) => user_mem_check(spaces, space, va, len, perm),
        None => Err(AccessFault { va }),
    };
    if let Err(fault) = checked {
        log_warn!(target: "uaccess", "[{}] user_mem_check assertion failure for va {:#x}", id, fault.va);
        let _ = envs.destroy(spaces, id, Some(id));
    }
    checked
}

/// Copies `buf.len()` bytes from user address `va` after checking them readable.
pub fn copy_from_user(
    spaces: &AddressSpaceManager,
    space: AsHandle,
    va: usize,
    buf: &mut [u8],
) -> Result<(), AccessFault> {
    user_mem_check(spaces, space, va, buf.len(), PageFlags::USER)?;
    spaces.read_bytes(space, va, buf).map_err(|_| AccessFault { va })
}

/// Copies `data` to user address `va` after checking it writable.
pub fn copy_to_user(
    spaces: &mut AddressSpaceManager,
    space: AsHandle,
    va: usize,
    data: &[u8],
) -> Result<(), AccessFault> {
    user_mem_check(spaces, space, va, data.len(), PageFlags::USER | PageFlags::WRITABLE)?;
    spaces.write_bytes(space, va, data).map_err(|_| AccessFault { va })
}
