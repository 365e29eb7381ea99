// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel aggregate owning every subsystem behind one dispatch lock
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/spawn_initial/syscall/trap_syscall/run_next/current + inspection)
//! DEPENDS_ON: env, mm, sched, syscall, uaccess, hal::Rtc, spin::Mutex
//! INVARIANTS: One handler runs at a time; result words are written into the caller's saved
//!             frame only for calls that return in-line

use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    config::KernelConfig,
    env::{EnvError, EnvStatus, EnvTable, IpcDelivery},
    hal::Rtc,
    mm::{AddressSpaceManager, AsHandle, PageFlags, Pte},
    sched::Scheduler,
    syscall::{
        api::{self, Context, Globals},
        Args, SyscallTable,
    },
    trap::TrapFrame,
    types::EnvId,
    uaccess::{self, AccessFault},
};

/// Aggregated kernel state guarded by the dispatch lock.
struct KernelState {
    envs: EnvTable,
    address_spaces: AddressSpaceManager,
    scheduler: Scheduler,
    globals: Globals,
    syscalls: SyscallTable,
}

impl KernelState {
    fn new(config: KernelConfig) -> Self {
        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);
        Self {
            envs: EnvTable::new(config.max_envs),
            address_spaces: AddressSpaceManager::new(config.phys_pages),
            scheduler: Scheduler::new(),
            globals: Globals::new(config.cwd_capacity),
            syscalls,
        }
    }

    fn env_space(&self, id: EnvId) -> Option<AsHandle> {
        self.envs.get(id).and_then(|env| env.space())
    }
}

/// System-call core of one processor.
pub struct Kernel<'a> {
    state: Mutex<KernelState>,
    rtc: &'a (dyn Rtc + Sync),
    config: KernelConfig,
}

static_assertions::assert_impl_all!(Kernel<'static>: Send, Sync);

impl<'a> Kernel<'a> {
    /// Creates a kernel with empty registries sized by `config`.
    pub fn new(config: KernelConfig, rtc: &'a (dyn Rtc + Sync)) -> Self {
        let config = config.normalized();
        log_info!(
            target: "kernel",
            "boot: {} envs, {} frames, cwd {} bytes",
            config.max_envs,
            config.phys_pages,
            config.cwd_capacity
        );
        Self { state: Mutex::new(KernelState::new(config)), rtc, config }
    }

    /// Effective configuration after clamping.
    pub fn config(&self) -> KernelConfig {
        self.config
    }

    /// Creates a parentless, runnable environment the way the boot loader does. It becomes
    /// current when the processor is idle.
    pub fn spawn_initial(&self) -> Result<EnvId, EnvError> {
        let mut state = self.state.lock();
        let KernelState { envs, address_spaces, scheduler, .. } = &mut *state;
        let id = envs.alloc(address_spaces, EnvId::CURRENT)?;
        envs.set_status(id, EnvStatus::Runnable)?;
        if scheduler.current().is_none() {
            scheduler.switch_to(id);
        }
        log_info!(target: "kernel", "spawned initial env {}", id);
        Ok(id)
    }

    /// Environment executing on this processor.
    pub fn current(&self) -> Option<EnvId> {
        self.state.lock().scheduler.current()
    }

    /// Runs the scheduler as a timer tick would.
    pub fn run_next(&self) -> Option<EnvId> {
        let mut state = self.state.lock();
        let KernelState { envs, scheduler, .. } = &mut *state;
        scheduler.yield_now(envs)
    }

    /// Executes call `number` on behalf of the current environment.
    ///
    /// Returns the word stored in the caller's return register, or `None` when the call did
    /// not return in-line (the caller blocked, yielded or was destroyed).
    pub fn syscall(&self, number: usize, regs: [usize; 5]) -> Option<isize> {
        let mut state = self.state.lock();
        let KernelState { envs, address_spaces, scheduler, globals, syscalls } = &mut *state;
        let caller = scheduler.current()?;
        let args = Args::new(regs);
        let result = {
            let mut ctx = Context::new(caller, envs, address_spaces, scheduler, self.rtc, globals);
            syscalls.dispatch(number, &mut ctx, &args)
        };

        #[cfg(feature = "trace_syscalls")]
        log_debug!(target: "syscall", "[{}] #{} {:x?} -> {:?}", caller, number, regs, result);

        let word = match result {
            Ok(value) => value as isize,
            Err(err) => err.code()?,
        };
        if let Some(env) = envs.get_mut(caller) {
            env.tf.set_return(word);
        }
        Some(word)
    }

    /// Decodes the call from the current environment's saved registers and executes it.
    pub fn trap_syscall(&self) -> Option<isize> {
        let (number, regs) = {
            let state = self.state.lock();
            let caller = state.scheduler.current()?;
            state.envs.get(caller)?.tf.syscall_regs()
        };
        self.syscall(number, regs)
    }

    /// Status of `id`, `None` once the record is free or reincarnated.
    pub fn status(&self, id: EnvId) -> Option<EnvStatus> {
        self.state.lock().envs.get(id).map(|env| env.status())
    }

    /// Parent recorded at allocation.
    pub fn parent(&self, id: EnvId) -> Option<EnvId> {
        self.state.lock().envs.get(id).map(|env| env.parent())
    }

    /// Saved register frame of `id`.
    pub fn trapframe(&self, id: EnvId) -> Option<TrapFrame> {
        self.state.lock().envs.get(id).map(|env| env.tf)
    }

    /// Replaces the saved frame of `id` as the loader does before first run.
    pub fn load_trapframe(&self, id: EnvId, mut tf: TrapFrame) -> Result<(), EnvError> {
        tf.sanitize_for_user();
        let mut state = self.state.lock();
        state.envs.get_mut(id).ok_or(EnvError::BadEnv)?.tf = tf;
        Ok(())
    }

    /// Page-fault entry point registered by `id`.
    pub fn pgfault_upcall(&self, id: EnvId) -> Option<usize> {
        self.state.lock().envs.get(id).and_then(|env| env.pgfault_upcall)
    }

    /// True while `id` is parked in `ipc_recv`.
    pub fn is_receiving(&self, id: EnvId) -> bool {
        self.state.lock().envs.get(id).is_some_and(|env| env.ipc.recving)
    }

    /// Hands the last completed receive of `id` to its resumed caller, once.
    pub fn take_delivery(&self, id: EnvId) -> Option<IpcDelivery> {
        self.state.lock().envs.get_mut(id).and_then(|env| env.take_delivery())
    }

    /// Mapping at `va` in `id`'s address space.
    pub fn lookup(&self, id: EnvId, va: usize) -> Option<Pte> {
        let state = self.state.lock();
        let space = state.env_space(id)?;
        state.address_spaces.lookup(space, va).ok().flatten()
    }

    /// Reads `buf.len()` bytes of `id`'s memory from any present user page.
    pub fn read_user(&self, id: EnvId, va: usize, buf: &mut [u8]) -> Result<(), AccessFault> {
        let state = self.state.lock();
        let space = state.env_space(id).ok_or(AccessFault { va })?;
        uaccess::copy_from_user(&state.address_spaces, space, va, buf)
    }

    /// Writes into `id`'s memory ignoring the write bit, as the program loader does.
    pub fn load_user(&self, id: EnvId, va: usize, data: &[u8]) -> Result<(), AccessFault> {
        let mut state = self.state.lock();
        let space = state.env_space(id).ok_or(AccessFault { va })?;
        uaccess::user_mem_check(&state.address_spaces, space, va, data.len(), PageFlags::USER)?;
        state.address_spaces.write_bytes(space, va, data).map_err(|_| AccessFault { va })
    }

    /// Kernel working directory bytes.
    pub fn cwd(&self) -> Vec<u8> {
        self.state.lock().globals.cwd().to_vec()
    }

    pub fn login_attempts(&self) -> u32 {
        self.state.lock().globals.login_attempts()
    }

    /// Physical frames not referenced by any address space.
    pub fn free_frames(&self) -> usize {
        self.state.lock().address_spaces.frames().free_count()
    }

    /// Environment records available for allocation.
    pub fn free_envs(&self) -> usize {
        self.state.lock().envs.free_count()
    }

    /// Makes the next physical frame allocation fail.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_frame_alloc(&self) {
        self.state.lock().address_spaces.fail_next_frame_alloc();
    }
}
