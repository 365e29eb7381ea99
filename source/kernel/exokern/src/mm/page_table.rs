// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page table allocating page-table pages on demand.

use alloc::{boxed::Box, vec::Vec};

use super::{frame::FrameAllocator, FrameNumber, PageFlags, PAGE_SIZE, UTOP};

/// Number of entries per page-directory and page-table page.
const PT_ENTRIES: usize = 1024;
const PDX_SHIFT: usize = 22;
const PTX_SHIFT: usize = 12;

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned.
    Unaligned,
    /// Mapping lies at or above `UTOP`.
    OutOfRange,
    /// No frame left for the page or for a page-table page.
    OutOfMemory,
    /// Flags do not describe a valid user entry.
    InvalidFlags,
}

/// Leaf entry: the frame backing a page and the flags it is mapped with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameNumber,
    pub flags: PageFlags,
}

struct PageTablePage {
    // Frame charged for this page-table page.
    frame: FrameNumber,
    entries: Box<[Option<Pte>; PT_ENTRIES]>,
    live: usize,
}

/// Page directory plus the page-table pages hanging off it.
///
/// Every page-table page is charged one frame from the allocator, so installing the first
/// mapping in a fresh 4 MiB region can fail with [`MapError::OutOfMemory`].
pub struct PageTable {
    root: FrameNumber,
    dir: Vec<Option<PageTablePage>>,
}

#[inline]
const fn pdx(va: usize) -> usize {
    (va >> PDX_SHIFT) & (PT_ENTRIES - 1)
}

#[inline]
const fn ptx(va: usize) -> usize {
    (va >> PTX_SHIFT) & (PT_ENTRIES - 1)
}

fn check_va(va: usize) -> Result<(), MapError> {
    if va % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }
    if va >= UTOP {
        return Err(MapError::OutOfRange);
    }
    Ok(())
}

impl PageTable {
    /// Creates an empty table, charging one frame for the page directory.
    pub fn new(frames: &mut FrameAllocator) -> Result<Self, MapError> {
        let root = frames.alloc_zeroed()?;
        frames.incref(root);
        let mut dir = Vec::with_capacity(PT_ENTRIES);
        dir.resize_with(PT_ENTRIES, || None);
        Ok(Self { root, dir })
    }

    /// Frame holding the page directory.
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    /// Looks up the entry mapped at `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<Pte> {
        let table = self.dir.get(pdx(va))?.as_ref()?;
        table.entries[ptx(va)]
    }

    /// Maps `frame` at `va`, replacing whatever was mapped there before.
    ///
    /// The new frame gains a reference before the old one loses its own, so re-inserting the
    /// same frame at the same address is safe.
    pub fn insert(
        &mut self,
        frames: &mut FrameAllocator,
        va: usize,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        check_va(va)?;
        if !flags.contains(PageFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        let slot = &mut self.dir[pdx(va)];
        if slot.is_none() {
            let pt_frame = frames.alloc_zeroed()?;
            frames.incref(pt_frame);
            *slot = Some(PageTablePage {
                frame: pt_frame,
                entries: Box::new([None; PT_ENTRIES]),
                live: 0,
            });
        }
        let Some(table) = slot.as_mut() else {
            return Err(MapError::OutOfMemory);
        };
        frames.incref(frame);
        let entry = &mut table.entries[ptx(va)];
        match entry.replace(Pte { frame, flags }) {
            Some(old) => frames.decref(old.frame),
            None => table.live += 1,
        }
        Ok(())
    }

    /// Removes the mapping at `va`. Unmapped addresses are a silent no-op.
    pub fn remove(&mut self, frames: &mut FrameAllocator, va: usize) -> Option<Pte> {
        let table = self.dir.get_mut(pdx(va))?.as_mut()?;
        let old = table.entries[ptx(va)].take()?;
        table.live -= 1;
        frames.decref(old.frame);
        Some(old)
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.dir.iter().flatten().map(|table| table.live).sum()
    }

    /// Drops every mapping and returns all page-table frames to the allocator.
    /// Returns the number of user pages that were mapped.
    pub fn teardown(self, frames: &mut FrameAllocator) -> usize {
        let mut released = 0;
        for table in self.dir.into_iter().flatten() {
            for pte in table.entries.iter().flatten() {
                frames.decref(pte.frame);
                released += 1;
            }
            frames.decref(table.frame);
        }
        frames.decref(self.root);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_rw() -> PageFlags {
        PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE
    }

    #[test]
    fn first_mapping_charges_a_page_table_frame() {
        let mut frames = FrameAllocator::new(8);
        let mut pt = PageTable::new(&mut frames).unwrap();
        assert_eq!(frames.free_count(), 7);
        assert_eq!(frames.refs(pt.root()), 1);
        let page = frames.alloc_zeroed().unwrap();
        pt.insert(&mut frames, 0x40_0000, page, user_rw()).unwrap();
        // root + table page + data page
        assert_eq!(frames.free_count(), 5);
        assert_eq!(pt.lookup(0x40_0000), Some(Pte { frame: page, flags: user_rw() }));
    }

    #[test]
    fn insert_fails_when_no_frame_for_table_page() {
        let mut frames = FrameAllocator::new(2);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let page = frames.alloc_zeroed().unwrap();
        assert_eq!(pt.insert(&mut frames, 0x1000, page, user_rw()), Err(MapError::OutOfMemory));
        assert_eq!(frames.refs(page), 0);
        assert!(pt.lookup(0x1000).is_none());
    }

    #[test]
    fn reinserting_same_frame_keeps_it_alive() {
        let mut frames = FrameAllocator::new(4);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let page = frames.alloc_zeroed().unwrap();
        pt.insert(&mut frames, 0x1000, page, user_rw()).unwrap();
        pt.insert(&mut frames, 0x1000, page, PageFlags::REQUIRED).unwrap();
        assert_eq!(frames.refs(page), 1);
        assert_eq!(pt.lookup(0x1000).unwrap().flags, PageFlags::REQUIRED);
        assert_eq!(pt.mapped_pages(), 1);
    }

    #[test]
    fn replacing_frees_previous_frame() {
        let mut frames = FrameAllocator::new(5);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let a = frames.alloc_zeroed().unwrap();
        pt.insert(&mut frames, 0x1000, a, user_rw()).unwrap();
        let before = frames.free_count();
        let b = frames.alloc_zeroed().unwrap();
        pt.insert(&mut frames, 0x1000, b, user_rw()).unwrap();
        assert_eq!(frames.free_count(), before);
        assert_eq!(frames.refs(a), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut frames = FrameAllocator::new(4);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let page = frames.alloc_zeroed().unwrap();
        pt.insert(&mut frames, 0x3000, page, user_rw()).unwrap();
        assert!(pt.remove(&mut frames, 0x3000).is_some());
        assert!(pt.remove(&mut frames, 0x3000).is_none());
        assert!(pt.remove(&mut frames, 0x8000_0000).is_none());
    }

    #[test]
    fn rejects_kernel_and_misaligned_addresses() {
        let mut frames = FrameAllocator::new(4);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let page = frames.alloc_zeroed().unwrap();
        assert_eq!(pt.insert(&mut frames, UTOP, page, user_rw()), Err(MapError::OutOfRange));
        assert_eq!(pt.insert(&mut frames, 0x1001, page, user_rw()), Err(MapError::Unaligned));
    }

    #[test]
    fn teardown_returns_every_frame() {
        let mut frames = FrameAllocator::new(16);
        let mut pt = PageTable::new(&mut frames).unwrap();
        for va in [0x1000, 0x2000, 0x80_0000] {
            let page = frames.alloc_zeroed().unwrap();
            pt.insert(&mut frames, va, page, user_rw()).unwrap();
        }
        assert_eq!(pt.teardown(&mut frames), 3);
        assert_eq!(frames.free_count(), 16);
    }
}
