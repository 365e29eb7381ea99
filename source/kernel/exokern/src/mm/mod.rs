// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-Space Authority (frames, page tables, address-space arena)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageFlags, PermError, FrameAllocator, PageTable, AddressSpaceManager, AsHandle
//! DEPENDS_ON: bitflags, alloc
//! INVARIANTS: User mappings live strictly below UTOP; a frame is freed only when its last
//!             mapping goes away; address spaces are never shared between live environments

pub mod address_space;
pub mod frame;
pub mod page_table;

#[cfg(test)]
mod tests_prop;

use bitflags::bitflags;

pub use address_space::{AddressSpaceError, AddressSpaceManager, AsHandle};
pub use frame::{FrameAllocator, FrameNumber};
pub use page_table::{MapError, PageTable, Pte};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Bytes mapped by one page-directory entry (one page-table page).
pub const PT_SPAN: usize = PAGE_SIZE * 1024;
/// Top of user-mappable memory. Every address accepted from userspace is strictly below it.
pub const UTOP: usize = 0xeec0_0000;
/// Top of memory userspace may read. Kernel-only above.
pub const ULIM: usize = 0xef80_0000;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Flags stored in a page-table entry.
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LARGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const AVAIL0 = 1 << 9;
        const AVAIL1 = 1 << 10;
        const AVAIL2 = 1 << 11;
    }
}

impl PageFlags {
    /// Software-defined bits, ignored by the kernel.
    pub const AVAIL: Self = Self::AVAIL0.union(Self::AVAIL1).union(Self::AVAIL2);
    /// Bits userspace may pass in a `perm` argument.
    pub const SYSCALL: Self = Self::AVAIL.union(Self::PRESENT).union(Self::WRITABLE).union(Self::USER);
    /// Bits every user grant must carry.
    pub const REQUIRED: Self = Self::PRESENT.union(Self::USER);

    /// Validates a raw `perm` word from a syscall argument.
    ///
    /// `present` and `user` are mandatory, `writable` and the avail bits are optional, and
    /// anything outside [`PageFlags::SYSCALL`] is rejected. Missing bits are reported before
    /// extraneous ones.
    pub fn from_syscall(raw: usize) -> Result<Self, PermError> {
        let flags = Self::from_bits_truncate(raw as u32);
        if !flags.contains(Self::PRESENT) {
            return Err(PermError::MissingPresent);
        }
        if !flags.contains(Self::USER) {
            return Err(PermError::MissingUser);
        }
        let extraneous = raw & !(Self::SYSCALL.bits() as usize);
        if extraneous != 0 {
            return Err(PermError::Disallowed(extraneous));
        }
        Ok(flags)
    }
}

/// Reason a `perm` argument was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermError {
    /// `present` was not set.
    MissingPresent,
    /// `user` was not set.
    MissingUser,
    /// Bits outside the syscall-visible set (raw mask of the offending bits).
    Disallowed(usize),
    /// `writable` requested over a read-only source mapping.
    WriteEscalation,
}

#[inline]
pub(crate) const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}
