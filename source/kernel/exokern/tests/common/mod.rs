// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use exokern::{
    hal::virt::VirtRtc,
    syscall::{SYSCALL_ENV_SET_STATUS, SYSCALL_EXOFORK},
    EnvId, EnvStatus, Kernel, KernelConfig,
};

pub static RTC: VirtRtc = VirtRtc::new(1_700_000_000);

pub const P_U: usize = 0x5;
pub const P_U_W: usize = 0x7;

pub fn boot() -> (Kernel<'static>, EnvId) {
    let config = KernelConfig { max_envs: 8, phys_pages: 256, cwd_capacity: 64 };
    let kernel = Kernel::new(config, &RTC);
    let root = kernel.spawn_initial().expect("initial env");
    (kernel, root)
}

/// Rotates the scheduler until `id` is the running environment.
pub fn run_as(kernel: &Kernel<'_>, id: EnvId) {
    for _ in 0..=kernel.config().max_envs {
        if kernel.current() == Some(id) {
            return;
        }
        kernel.run_next();
    }
    panic!("{id} never became current (status {:?})", kernel.status(id));
}

/// Forks a child of the running environment and makes it runnable.
pub fn spawn_child(kernel: &Kernel<'_>) -> EnvId {
    let raw = kernel.syscall(SYSCALL_EXOFORK, [0; 5]).expect("exofork returns in-line");
    assert!(raw > 0, "exofork failed with {raw}");
    let child = EnvId::from_raw(raw as u32);
    assert_eq!(kernel.syscall(SYSCALL_ENV_SET_STATUS, [raw as usize, 2, 0, 0, 0]), Some(0));
    assert_eq!(kernel.status(child), Some(EnvStatus::Runnable));
    child
}

pub fn raw(id: EnvId) -> usize {
    usize::from(id)
}
