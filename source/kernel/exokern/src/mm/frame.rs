// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical page frames with reference counts.

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use super::{page_table::MapError, PAGE_SIZE};

/// Index of a physical page frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameNumber(u32);

impl FrameNumber {
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{}", self.0)
    }
}

struct Frame {
    // Backing storage is materialised on first allocation.
    data: Option<Box<[u8; PAGE_SIZE]>>,
    refs: u32,
    in_use: bool,
}

/// Pool of physical frames. Frames come out zeroed and go back once no mapping refers to them.
pub struct FrameAllocator {
    frames: Vec<Frame>,
    free: Vec<FrameNumber>,
    #[cfg(feature = "failpoints")]
    fail_next: bool,
}

impl FrameAllocator {
    /// Creates a pool of `count` frames.
    pub fn new(count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(Frame { data: None, refs: 0, in_use: false });
        }
        // Hand out low frames first.
        let free = (0..count as u32).rev().map(FrameNumber).collect();
        Self {
            frames,
            free,
            #[cfg(feature = "failpoints")]
            fail_next: false,
        }
    }

    /// Allocates a zero-filled frame with a reference count of zero.
    ///
    /// The caller either maps it (which takes a reference) or hands it back via
    /// [`FrameAllocator::release_if_unused`].
    pub fn alloc_zeroed(&mut self) -> Result<FrameNumber, MapError> {
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.fail_next) {
            return Err(MapError::OutOfMemory);
        }
        let pfn = self.free.pop().ok_or(MapError::OutOfMemory)?;
        let frame = &mut self.frames[pfn.as_index()];
        match frame.data.as_mut() {
            Some(data) => data.fill(0),
            None => frame.data = Some(Box::new([0u8; PAGE_SIZE])),
        }
        frame.in_use = true;
        frame.refs = 0;
        Ok(pfn)
    }

    /// Takes a reference on an allocated frame.
    pub fn incref(&mut self, pfn: FrameNumber) {
        if let Some(frame) = self.frames.get_mut(pfn.as_index()) {
            frame.refs += 1;
        }
    }

    /// Drops a reference, returning the frame to the pool when it was the last one.
    pub fn decref(&mut self, pfn: FrameNumber) {
        let Some(frame) = self.frames.get_mut(pfn.as_index()) else {
            return;
        };
        frame.refs = frame.refs.saturating_sub(1);
        if frame.refs == 0 {
            self.release(pfn);
        }
    }

    /// Returns a frame nobody mapped back to the pool.
    pub fn release_if_unused(&mut self, pfn: FrameNumber) {
        if self.refs(pfn) == 0 {
            self.release(pfn);
        }
    }

    fn release(&mut self, pfn: FrameNumber) {
        let frame = &mut self.frames[pfn.as_index()];
        if frame.in_use {
            frame.in_use = false;
            self.free.push(pfn);
        }
    }

    /// Current reference count of `pfn`.
    pub fn refs(&self, pfn: FrameNumber) -> u32 {
        self.frames.get(pfn.as_index()).map_or(0, |frame| frame.refs)
    }

    /// Number of frames still available.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Contents of an allocated frame.
    pub fn bytes(&self, pfn: FrameNumber) -> Option<&[u8; PAGE_SIZE]> {
        self.frames
            .get(pfn.as_index())
            .filter(|frame| frame.in_use)
            .and_then(|frame| frame.data.as_deref())
    }

    /// Mutable contents of an allocated frame.
    pub fn bytes_mut(&mut self, pfn: FrameNumber) -> Option<&mut [u8; PAGE_SIZE]> {
        self.frames
            .get_mut(pfn.as_index())
            .filter(|frame| frame.in_use)
            .and_then(|frame| frame.data.as_deref_mut())
    }

    /// Forces the next [`FrameAllocator::alloc_zeroed`] to report exhaustion.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_alloc(&mut self) {
        self.fail_next = true;
    }
}
