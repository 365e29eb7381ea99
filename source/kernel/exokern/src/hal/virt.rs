// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementations for hosted runs and the QEMU bring-up board.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{Rtc, Uart};

/// Wall clock that reports whatever the board code last programmed into it.
pub struct VirtRtc {
    seconds: AtomicU64,
}

impl VirtRtc {
    /// Creates a clock reading `seconds`.
    pub const fn new(seconds: u64) -> Self {
        Self { seconds: AtomicU64::new(seconds) }
    }

    /// Reprograms the clock.
    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }

    /// Advances the clock by `delta` seconds.
    pub fn tick(&self, delta: u64) {
        self.seconds.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Rtc for VirtRtc {
    fn unix_seconds(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }
}

/// UART that records every byte written to it.
pub struct CaptureUart {
    bytes: Mutex<Vec<u8>>,
}

impl CaptureUart {
    pub const fn new() -> Self {
        Self { bytes: Mutex::new(Vec::new()) }
    }

    /// Drains and returns everything written so far.
    pub fn take(&self) -> Vec<u8> {
        core::mem::take(&mut *self.bytes.lock())
    }
}

impl Default for CaptureUart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart for CaptureUart {
    fn write_byte(&self, byte: u8) {
        self.bytes.lock().push(byte);
    }
}
