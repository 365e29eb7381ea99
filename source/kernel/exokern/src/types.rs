// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes for safer syscall decoding
//! OWNERS: @kernel-team
//! PUBLIC API: EnvId, UserVa, NENV, LOG2NENV
//! DEPENDS_ON: mm::{PAGE_SIZE, UTOP}
//! INVARIANTS: EnvId raw values are positive as i32; UserVa is page aligned and below UTOP

use core::fmt;

use crate::mm::{PAGE_SIZE, UTOP};

/// Width of the registry index embedded in an [`EnvId`].
pub const LOG2NENV: u32 = 10;
/// Upper bound on environment records.
pub const NENV: usize = 1 << LOG2NENV;
/// Generation counter starts above the index bits so ids never collide across incarnations.
const ENVGENSHIFT: u32 = 12;

/// Environment identifier: a generation counter in the high bits, the registry index below.
///
/// **Ownership**: Only `EnvTable` mints ids.
/// **Invariant**: Raw value `0` never names a record; at the syscall boundary it means "caller".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Alias for the calling environment.
    pub const CURRENT: Self = Self(0);

    /// Creates an id from a raw value supplied by userspace.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the registry slot this id points at.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize & (NENV - 1)
    }

    /// Returns true for the "calling environment" alias.
    #[inline]
    pub const fn is_current_alias(self) -> bool {
        self.0 == 0
    }

    /// Mints the id for the next incarnation of slot `index`, given the slot's previous id.
    pub(crate) fn next_incarnation(previous: Self, index: usize) -> Self {
        let mut generation = previous.0.wrapping_add(1 << ENVGENSHIFT) & !(NENV as u32 - 1);
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        Self(generation | (index as u32 & (NENV as u32 - 1)))
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<EnvId> for usize {
    #[inline]
    fn from(id: EnvId) -> Self {
        id.0 as usize
    }
}

/// User virtual address of a page: aligned and strictly below `UTOP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct UserVa(usize);

impl UserVa {
    /// Accepts `addr` only when it is page aligned and below `UTOP`.
    #[inline]
    pub fn page(addr: usize) -> Option<Self> {
        if addr < UTOP && addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for UserVa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
