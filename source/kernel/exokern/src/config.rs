// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time tunables handed to [`crate::Kernel::new`].

use crate::types::NENV;

/// Sizing of the kernel's fixed pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of environment records in the registry (clamped to `NENV`).
    pub max_envs: usize,
    /// Number of physical page frames managed by the frame allocator.
    pub phys_pages: usize,
    /// Capacity of the kernel working-directory buffer, in bytes.
    pub cwd_capacity: usize,
}

impl KernelConfig {
    pub const DEFAULT_MAX_ENVS: usize = 64;
    pub const DEFAULT_PHYS_PAGES: usize = 1024;
    pub const DEFAULT_CWD_CAPACITY: usize = 256;

    /// Returns a copy with `max_envs` clamped to the id index width and at least one record.
    pub fn normalized(self) -> Self {
        Self { max_envs: self.max_envs.clamp(1, NENV), ..self }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_envs: Self::DEFAULT_MAX_ENVS,
            phys_pages: Self::DEFAULT_PHYS_PAGES,
            cwd_capacity: Self::DEFAULT_CWD_CAPACITY,
        }
    }
}
