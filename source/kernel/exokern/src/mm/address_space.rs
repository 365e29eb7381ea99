// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address-space arena: one page table per environment, backed by a shared frame pool.

use alloc::vec::Vec;
use core::num::NonZeroU32;

use super::{
    frame::FrameAllocator,
    page_round_down,
    page_table::{MapError, PageTable, Pte},
    FrameNumber, PageFlags, PAGE_SIZE,
};
use crate::types::{EnvId, UserVa};

/// Handle referencing a tracked address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AsHandle(NonZeroU32);

impl AsHandle {
    fn from_index(index: usize) -> Option<Self> {
        NonZeroU32::new(index as u32 + 1).map(Self)
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Returns the raw representation of the handle.
    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Provided handle was not recognised.
    InvalidHandle,
    /// Underlying map operation failed.
    Mapping(MapError),
    /// A byte range touched an unmapped page (first faulting address).
    NotMapped(usize),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

/// A single environment's view of memory.
pub struct AddressSpace {
    page_table: PageTable,
    owner: EnvId,
}

impl AddressSpace {
    /// Environment this space was created for.
    pub fn owner(&self) -> EnvId {
        self.owner
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }
}

/// Owns physical-page allocation and every page-table edit.
pub struct AddressSpaceManager {
    frames: FrameAllocator,
    spaces: Vec<Option<AddressSpace>>,
}

impl AddressSpaceManager {
    /// Creates a manager over a pool of `phys_pages` frames.
    pub fn new(phys_pages: usize) -> Self {
        Self { frames: FrameAllocator::new(phys_pages), spaces: Vec::new() }
    }

    /// Allocates an empty address space for `owner`.
    pub fn create(&mut self, owner: EnvId) -> Result<AsHandle, AddressSpaceError> {
        let page_table = PageTable::new(&mut self.frames)?;
        let space = AddressSpace { page_table, owner };
        let index = match self.spaces.iter().position(Option::is_none) {
            Some(index) => {
                self.spaces[index] = Some(space);
                index
            }
            None => {
                self.spaces.push(Some(space));
                self.spaces.len() - 1
            }
        };
        AsHandle::from_index(index).ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Tears down an address space and reclaims its frames. Returns the number of user pages
    /// that were mapped.
    pub fn destroy(&mut self, handle: AsHandle) -> Result<usize, AddressSpaceError> {
        let space = self
            .spaces
            .get_mut(handle.index())
            .and_then(Option::take)
            .ok_or(AddressSpaceError::InvalidHandle)?;
        Ok(space.page_table.teardown(&mut self.frames))
    }

    /// Borrows an address space for inspection.
    pub fn get(&self, handle: AsHandle) -> Result<&AddressSpace, AddressSpaceError> {
        self.spaces
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Allocates a zeroed frame and maps it at `va`, replacing any prior mapping.
    pub fn page_alloc(
        &mut self,
        handle: AsHandle,
        va: UserVa,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        // Validate the handle before touching the pool.
        self.get(handle)?;
        let frame = self.frames.alloc_zeroed()?;
        if let Err(err) = self.map_frame(handle, va, frame, flags) {
            self.frames.release_if_unused(frame);
            return Err(err);
        }
        Ok(())
    }

    /// Maps an existing frame at `va`, sharing it with whoever else maps it.
    pub fn map_frame(
        &mut self,
        handle: AsHandle,
        va: UserVa,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        let Self { frames, spaces } = self;
        let space = spaces
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(AddressSpaceError::InvalidHandle)?;
        space.page_table.insert(frames, va.raw(), frame, flags)?;
        Ok(())
    }

    /// Looks up the mapping at `va`.
    pub fn lookup(&self, handle: AsHandle, va: usize) -> Result<Option<Pte>, AddressSpaceError> {
        Ok(self.get(handle)?.page_table.lookup(va))
    }

    /// Removes the mapping at `va`. Returns whether something was mapped.
    pub fn unmap(&mut self, handle: AsHandle, va: UserVa) -> Result<bool, AddressSpaceError> {
        let Self { frames, spaces } = self;
        let space = spaces
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(AddressSpaceError::InvalidHandle)?;
        Ok(space.page_table.remove(frames, va.raw()).is_some())
    }

    /// Copies bytes out of the space starting at `va`. Permission bits are not consulted.
    pub fn read_bytes(
        &self,
        handle: AsHandle,
        va: usize,
        buf: &mut [u8],
    ) -> Result<(), AddressSpaceError> {
        let space = self.get(handle)?;
        let mut done = 0;
        while done < buf.len() {
            let addr = va.checked_add(done).ok_or(AddressSpaceError::NotMapped(va))?;
            let page = page_round_down(addr);
            let offset = addr - page;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let bytes = space
                .page_table
                .lookup(page)
                .and_then(|pte| self.frames.bytes(pte.frame))
                .ok_or(AddressSpaceError::NotMapped(addr))?;
            buf[done..done + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies bytes into the space starting at `va`. Permission bits are not consulted.
    pub fn write_bytes(
        &mut self,
        handle: AsHandle,
        va: usize,
        data: &[u8],
    ) -> Result<(), AddressSpaceError> {
        let Self { frames, spaces } = self;
        let space = spaces
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or(AddressSpaceError::InvalidHandle)?;
        let mut done = 0;
        while done < data.len() {
            let addr = va.checked_add(done).ok_or(AddressSpaceError::NotMapped(va))?;
            let page = page_round_down(addr);
            let offset = addr - page;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let bytes = space
                .page_table
                .lookup(page)
                .and_then(|pte| frames.bytes_mut(pte.frame))
                .ok_or(AddressSpaceError::NotMapped(addr))?;
            bytes[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Borrows the frame pool.
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// Forces the next frame allocation to fail.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_frame_alloc(&mut self) {
        self.frames.fail_next_alloc();
    }
}
