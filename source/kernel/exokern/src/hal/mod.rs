// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod virt;

/// Battery-backed wall clock.
pub trait Rtc {
    /// Returns seconds elapsed since 1970-01-01 00:00:00 UTC.
    fn unix_seconds(&self) -> u64;
}

/// UART abstraction used for kernel logging.
pub trait Uart {
    /// Writes a single byte to the UART.
    fn write_byte(&self, byte: u8);
}
