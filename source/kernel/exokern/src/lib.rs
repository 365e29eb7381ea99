// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]
#![deny(clippy::all)]

//! CONTEXT: Privileged system-call core of the exokern teaching kernel
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, syscall::{Args, Error, SYSCALL_*}, EnvId, TrapFrame
//! DEPENDS_ON: alloc, bitflags, spin, static_assertions
//! INVARIANTS: Validate fully before mutating; caller identity comes from the Context,
//!             never from hidden globals; one dispatch at a time per kernel instance

extern crate alloc;

#[macro_use]
pub mod log;

pub mod config;
pub mod env;
pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod types;
pub mod uaccess;

pub use config::KernelConfig;
pub use env::{EnvStatus, IpcDelivery};
pub use kernel::Kernel;
pub use trap::TrapFrame;
pub use types::EnvId;
