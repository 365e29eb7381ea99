// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context, Globals
//! DEPENDS_ON: env::EnvTable, mm::AddressSpaceManager, sched::Scheduler, ipc, uaccess, hal::Rtc
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; fixed check order
//!             resolve → address → perm → source lookup → write escalation → insert;
//!             nothing is mutated before the last check passes

use alloc::{vec, vec::Vec};

use super::{
    Args, Error, ErrorKind, SysResult, SyscallTable, SYSCALL_CHDIR, SYSCALL_ENV_DESTROY,
    SYSCALL_ENV_SET_PGFAULT_UPCALL, SYSCALL_ENV_SET_STATUS, SYSCALL_ENV_SET_TRAPFRAME,
    SYSCALL_EXOFORK, SYSCALL_GETCWD, SYSCALL_GETENVID, SYSCALL_GETTIME, SYSCALL_GET_LOGATT,
    SYSCALL_IPC_RECV, SYSCALL_IPC_TRY_SEND, SYSCALL_PAGE_ALLOC, SYSCALL_PAGE_MAP,
    SYSCALL_PAGE_UNMAP, SYSCALL_SET_LOGATT, SYSCALL_YIELD,
};
use crate::{
    env::{EnvError, EnvStatus, EnvTable},
    hal::Rtc,
    ipc,
    mm::{AddressSpaceManager, AsHandle, PageFlags, PermError},
    sched::Scheduler,
    trap::{TrapFrame, TRAPFRAME_BYTES},
    types::{EnvId, UserVa},
    uaccess,
};

// Typed decoders for Decode→Check→Execute

#[inline]
fn env_arg(raw: usize) -> EnvId {
    EnvId::from_raw(raw as u32)
}

#[inline]
fn page_arg(raw: usize) -> Result<UserVa, Error> {
    UserVa::page(raw).ok_or(Error::BadAddress(raw))
}

#[derive(Copy, Clone)]
struct SetStatusArgsTyped {
    env: EnvId,
    status: usize,
}

impl SetStatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { env: env_arg(args.get(0)), status: args.get(1) }
    }

    #[inline]
    fn check(&self) -> Result<EnvStatus, Error> {
        EnvStatus::from_raw(self.status)
            .filter(|status| status.is_live())
            .ok_or(Error::BadStatus(self.status))
    }
}

#[derive(Copy, Clone)]
struct PageAllocArgsTyped {
    env: EnvId,
    va: usize,
    perm: usize,
}

impl PageAllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { env: env_arg(args.get(0)), va: args.get(1), perm: args.get(2) }
    }

    #[inline]
    fn check(&self) -> Result<(UserVa, PageFlags), Error> {
        let va = page_arg(self.va)?;
        let flags = PageFlags::from_syscall(self.perm)?;
        Ok((va, flags))
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src_env: EnvId,
    src_va: usize,
    dst_env: EnvId,
    dst_va: usize,
    perm: usize,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            src_env: env_arg(args.get(0)),
            src_va: args.get(1),
            dst_env: env_arg(args.get(2)),
            dst_va: args.get(3),
            perm: args.get(4),
        }
    }

    #[inline]
    fn check(&self) -> Result<(UserVa, UserVa, PageFlags), Error> {
        let src = page_arg(self.src_va)?;
        let dst = page_arg(self.dst_va)?;
        let flags = PageFlags::from_syscall(self.perm)?;
        Ok((src, dst, flags))
    }
}

#[derive(Copy, Clone)]
struct SendArgsTyped {
    target: EnvId,
    value: u32,
    src_va: usize,
    perm: usize,
}

impl SendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            target: env_arg(args.get(0)),
            value: args.get(1) as u32,
            src_va: args.get(2),
            perm: args.get(3),
        }
    }
}

#[derive(Copy, Clone)]
struct ChdirArgsTyped {
    buf: usize,
    len: usize,
}

impl ChdirArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { buf: args.get(0), len: args.get(1) }
    }

    #[inline]
    fn check(&self, capacity: usize) -> Result<(), Error> {
        if self.len >= capacity {
            return Err(Error::PathTooLong(self.len));
        }
        Ok(())
    }
}

/// Kernel-global state reachable from syscalls that belongs to no single environment.
pub struct Globals {
    cwd: Vec<u8>,
    cwd_capacity: usize,
    login_attempts: u32,
}

impl Globals {
    /// Starts at the root directory (NUL terminated, as userspace passes it).
    pub fn new(cwd_capacity: usize) -> Self {
        let mut cwd = Vec::with_capacity(cwd_capacity);
        cwd.extend_from_slice(b"/\0");
        Self { cwd, cwd_capacity, login_attempts: 0 }
    }

    /// Current working directory bytes, as last stored by `chdir`.
    pub fn cwd(&self) -> &[u8] {
        &self.cwd
    }

    pub fn login_attempts(&self) -> u32 {
        self.login_attempts
    }
}

/// Execution context shared across syscalls.
pub struct Context<'a> {
    /// Environment that trapped into the kernel.
    pub caller: EnvId,
    pub envs: &'a mut EnvTable,
    pub address_spaces: &'a mut AddressSpaceManager,
    pub scheduler: &'a mut Scheduler,
    pub rtc: &'a dyn Rtc,
    pub globals: &'a mut Globals,
}

impl<'a> Context<'a> {
    /// Creates a new context for `caller`.
    pub fn new(
        caller: EnvId,
        envs: &'a mut EnvTable,
        address_spaces: &'a mut AddressSpaceManager,
        scheduler: &'a mut Scheduler,
        rtc: &'a dyn Rtc,
        globals: &'a mut Globals,
    ) -> Self {
        Self { caller, envs, address_spaces, scheduler, rtc, globals }
    }

    /// Resolves `id` with the ownership rule applied.
    fn resolve(&self, id: EnvId) -> SysResult<EnvId> {
        Ok(self.envs.resolve(id, self.caller, true)?)
    }

    fn space_of(&self, id: EnvId) -> SysResult<AsHandle> {
        self.envs.get(id).and_then(|env| env.space()).ok_or(Error::Env(EnvError::BadEnv))
    }

    /// Checks a caller-supplied buffer; a bad buffer destroys the caller.
    fn assert_user(&mut self, va: usize, len: usize, perm: PageFlags) -> SysResult<AsHandle> {
        if uaccess::user_mem_assert(self.envs, self.address_spaces, self.caller, va, len, perm)
            .is_err()
        {
            self.switch_away();
            return Err(Error::CallerDestroyed);
        }
        self.space_of(self.caller)
    }

    /// Gives the processor away from the caller.
    fn switch_away(&mut self) {
        self.scheduler.yield_now(self.envs);
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_ENV_DESTROY, sys_env_destroy);
    table.register(SYSCALL_EXOFORK, sys_exofork);
    table.register(SYSCALL_ENV_SET_STATUS, sys_env_set_status);
    table.register(SYSCALL_ENV_SET_TRAPFRAME, sys_env_set_trapframe);
    table.register(SYSCALL_ENV_SET_PGFAULT_UPCALL, sys_env_set_pgfault_upcall);
    table.register(SYSCALL_PAGE_ALLOC, sys_page_alloc);
    table.register(SYSCALL_PAGE_MAP, sys_page_map);
    table.register(SYSCALL_PAGE_UNMAP, sys_page_unmap);
    table.register(SYSCALL_IPC_TRY_SEND, sys_ipc_try_send);
    table.register(SYSCALL_IPC_RECV, sys_ipc_recv);
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_GETENVID, sys_getenvid);
    table.register(SYSCALL_GETTIME, sys_gettime);
    table.register(SYSCALL_CHDIR, sys_chdir);
    table.register(SYSCALL_GETCWD, sys_getcwd);
    table.register(SYSCALL_SET_LOGATT, sys_set_logatt);
    table.register(SYSCALL_GET_LOGATT, sys_get_logatt);
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.resolve(env_arg(args.get(0)))?;
    if target == ctx.caller {
        log_info!(target: "env", "[{}] exiting gracefully", target);
    } else {
        log_info!(target: "env", "[{}] destroying {}", ctx.caller, target);
    }
    ctx.envs.destroy(ctx.address_spaces, target, Some(ctx.caller))?;
    if target == ctx.caller {
        ctx.switch_away();
        return Err(Error::CallerDestroyed);
    }
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let parent_tf =
        ctx.envs.get(ctx.caller).map(|env| env.tf).ok_or(Error::Env(EnvError::BadEnv))?;
    let child = ctx.envs.alloc(ctx.address_spaces, ctx.caller)?;
    if let Some(env) = ctx.envs.get_mut(child) {
        env.tf = parent_tf;
        env.tf.set_return(0);
    }
    log_info!(target: "env", "[{}] new env {}", ctx.caller, child);
    Ok(usize::from(child))
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SetStatusArgsTyped::decode(args);
    let target = ctx.resolve(typed.env)?;
    let status = typed.check()?;
    if status == EnvStatus::Runnable {
        // A forced wake abandons the receive.
        if let Some(env) = ctx.envs.get_mut(target) {
            env.cancel_recv(ErrorKind::Invalid.code());
        }
    }
    ctx.envs.set_status(target, status)?;
    if target == ctx.caller && status == EnvStatus::NotRunnable {
        ctx.switch_away();
    }
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.resolve(env_arg(args.get(0)))?;
    let ptr = args.get(1);
    let space = ctx.space_of(ctx.caller)?;
    let mut raw = [0u8; TRAPFRAME_BYTES];
    uaccess::user_mem_check(
        ctx.address_spaces,
        space,
        ptr,
        TRAPFRAME_BYTES,
        PageFlags::USER | PageFlags::WRITABLE,
    )
    .map_err(Error::BadTrapframe)?;
    uaccess::copy_from_user(ctx.address_spaces, space, ptr, &mut raw)
        .map_err(Error::BadTrapframe)?;
    let mut tf = TrapFrame::from_le_bytes(&raw);
    tf.sanitize_for_user();
    ctx.envs.get_mut(target).ok_or(Error::Env(EnvError::BadEnv))?.tf = tf;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.resolve(env_arg(args.get(0)))?;
    let func = args.get(1);
    ctx.envs.get_mut(target).ok_or(Error::Env(EnvError::BadEnv))?.pgfault_upcall =
        (func != 0).then_some(func);
    Ok(0)
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageAllocArgsTyped::decode(args);
    let target = ctx.resolve(typed.env)?;
    let (va, flags) = typed.check()?;
    let space = ctx.space_of(target)?;
    ctx.address_spaces.page_alloc(space, va, flags)?;
    log_debug!(target: "mm", "[{}] page_alloc {} at {} {:?}", ctx.caller, target, va, flags);
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageMapArgsTyped::decode(args);
    let src = ctx.resolve(typed.src_env)?;
    let dst = ctx.resolve(typed.dst_env)?;
    let (src_va, dst_va, flags) = typed.check()?;
    let src_space = ctx.space_of(src)?;
    let dst_space = ctx.space_of(dst)?;
    let pte = ctx
        .address_spaces
        .lookup(src_space, src_va.raw())?
        .ok_or(Error::NotMapped(src_va.raw()))?;
    if flags.contains(PageFlags::WRITABLE) && !pte.flags.contains(PageFlags::WRITABLE) {
        return Err(PermError::WriteEscalation.into());
    }
    ctx.address_spaces.map_frame(dst_space, dst_va, pte.frame, flags)?;
    log_debug!(target: "mm", "[{}] page_map {}:{} -> {}:{}", ctx.caller, src, src_va, dst, dst_va);
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.resolve(env_arg(args.get(0)))?;
    let va = page_arg(args.get(1))?;
    let space = ctx.space_of(target)?;
    ctx.address_spaces.unmap(space, va)?;
    Ok(0)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgsTyped::decode(args);
    ipc::try_send(
        ctx.envs,
        ctx.address_spaces,
        ctx.caller,
        typed.target,
        typed.value,
        typed.src_va,
        typed.perm,
    )?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ipc::arm_recv(ctx.envs, ctx.caller, args.get(0))?;
    log_trace!(target: "ipc", "[{}] waiting", ctx.caller);
    ctx.switch_away();
    Err(Error::Suspended)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    if let Some(env) = ctx.envs.get_mut(ctx.caller) {
        env.tf.set_return(0);
    }
    ctx.switch_away();
    Err(Error::Suspended)
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(usize::from(ctx.caller))
}

fn sys_gettime(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.rtc.unix_seconds() as usize)
}

fn sys_chdir(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = ChdirArgsTyped::decode(args);
    typed.check(ctx.globals.cwd_capacity)?;
    let space = ctx.assert_user(typed.buf, typed.len, PageFlags::USER)?;
    let mut path = vec![0u8; typed.len];
    uaccess::copy_from_user(ctx.address_spaces, space, typed.buf, &mut path)
        .map_err(|fault| Error::BadAddress(fault.va))?;
    ctx.globals.cwd = path;
    Ok(0)
}

fn sys_getcwd(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let buf = args.get(0);
    let len = ctx.globals.cwd.len();
    let space = ctx.assert_user(buf, len, PageFlags::USER | PageFlags::WRITABLE)?;
    uaccess::copy_to_user(ctx.address_spaces, space, buf, &ctx.globals.cwd)
        .map_err(|fault| Error::BadAddress(fault.va))?;
    Ok(0)
}

fn sys_set_logatt(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.globals.login_attempts = args.get(0) as u32;
    Ok(0)
}

fn sys_get_logatt(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let out = args.get(0);
    let bytes = ctx.globals.login_attempts.to_le_bytes();
    let space = ctx.assert_user(out, bytes.len(), PageFlags::USER | PageFlags::WRITABLE)?;
    uaccess::copy_to_user(ctx.address_spaces, space, out, &bytes)
        .map_err(|fault| Error::BadAddress(fault.va))?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hal::virt::VirtRtc, mm::UTOP, trap::FL_IOPL_MASK};

    const P_U: usize = 0x5;
    const P_U_W: usize = 0x7;

    struct Rig {
        envs: EnvTable,
        spaces: AddressSpaceManager,
        scheduler: Scheduler,
        rtc: VirtRtc,
        globals: Globals,
        table: SyscallTable,
    }

    impl Rig {
        fn new() -> (Self, EnvId) {
            let mut envs = EnvTable::new(8);
            let mut spaces = AddressSpaceManager::new(128);
            let root = envs.alloc(&mut spaces, EnvId::CURRENT).unwrap();
            envs.set_status(root, EnvStatus::Runnable).unwrap();
            let mut scheduler = Scheduler::new();
            scheduler.switch_to(root);
            let mut table = SyscallTable::new();
            install_handlers(&mut table);
            let rig = Self {
                envs,
                spaces,
                scheduler,
                rtc: VirtRtc::new(1_000),
                globals: Globals::new(16),
                table,
            };
            (rig, root)
        }

        fn call(&mut self, caller: EnvId, number: usize, regs: [usize; 5]) -> SysResult<usize> {
            let mut ctx = Context::new(
                caller,
                &mut self.envs,
                &mut self.spaces,
                &mut self.scheduler,
                &self.rtc,
                &mut self.globals,
            );
            self.table.dispatch(number, &mut ctx, &Args::new(regs))
        }

        fn fork(&mut self, parent: EnvId) -> EnvId {
            EnvId::from_raw(self.call(parent, SYSCALL_EXOFORK, [0; 5]).unwrap() as u32)
        }

        fn space(&self, id: EnvId) -> AsHandle {
            self.envs.get(id).unwrap().space().unwrap()
        }
    }

    #[test]
    fn unknown_syscall_is_invalid() {
        let (mut rig, root) = Rig::new();
        assert_eq!(rig.call(root, 31, [0; 5]), Err(Error::InvalidSyscall));
        assert_eq!(rig.call(root, 1_000, [0; 5]), Err(Error::InvalidSyscall));
    }

    #[test]
    fn exofork_clones_frame_with_zero_return() {
        let (mut rig, root) = Rig::new();
        rig.envs.get_mut(root).unwrap().tf.eip = 0x0080_0042;
        rig.envs.get_mut(root).unwrap().tf.regs.eax = SYSCALL_EXOFORK as u32;
        let child = rig.fork(root);
        let env = rig.envs.get(child).unwrap();
        assert_eq!(env.status(), EnvStatus::NotRunnable);
        assert_eq!(env.parent(), root);
        assert_eq!(env.tf.eip, 0x0080_0042);
        assert_eq!(env.tf.regs.eax, 0);
    }

    #[test]
    fn set_status_validates_after_resolution() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        assert_eq!(
            rig.call(root, SYSCALL_ENV_SET_STATUS, [usize::from(child), 99, 0, 0, 0]),
            Err(Error::BadStatus(99))
        );
        assert_eq!(rig.envs.get(child).unwrap().status(), EnvStatus::NotRunnable);
        assert_eq!(
            rig.call(root, SYSCALL_ENV_SET_STATUS, [0x7777, 99, 0, 0, 0]),
            Err(Error::Env(EnvError::BadEnv))
        );
        assert_eq!(
            rig.call(root, SYSCALL_ENV_SET_STATUS, [usize::from(child), 1, 0, 0, 0]),
            Err(Error::BadStatus(1))
        );
        rig.call(root, SYSCALL_ENV_SET_STATUS, [usize::from(child), 2, 0, 0, 0]).unwrap();
        assert_eq!(rig.envs.get(child).unwrap().status(), EnvStatus::Runnable);
    }

    #[test]
    fn siblings_cannot_touch_each_other() {
        let (mut rig, root) = Rig::new();
        let a = rig.fork(root);
        let b = rig.fork(root);
        assert_eq!(
            rig.call(a, SYSCALL_PAGE_ALLOC, [usize::from(b), 0x1000, P_U, 0, 0]),
            Err(Error::Env(EnvError::BadEnv))
        );
        assert_eq!(
            rig.call(a, SYSCALL_ENV_DESTROY, [usize::from(root), 0, 0, 0, 0]),
            Err(Error::Env(EnvError::BadEnv))
        );
    }

    #[test]
    fn page_alloc_checks_address_before_perm() {
        let (mut rig, root) = Rig::new();
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x1001, 0x1, 0, 0]),
            Err(Error::BadAddress(0x1001))
        );
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_ALLOC, [0, UTOP, P_U, 0, 0]),
            Err(Error::BadAddress(UTOP))
        );
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x1000, 0x1, 0, 0]),
            Err(Error::Perm(PermError::MissingUser))
        );
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x1000, P_U | 0x100, 0, 0]),
            Err(Error::Perm(PermError::Disallowed(0x100)))
        );
    }

    #[test]
    fn page_alloc_yields_zeroed_page_and_replaces_prior_mapping() {
        let (mut rig, root) = Rig::new();
        let space = rig.space(root);
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x4000, P_U_W, 0, 0]).unwrap();
        rig.spaces.write_bytes(space, 0x4000, &[0xff; 16]).unwrap();
        let free = rig.spaces.frames().free_count();
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x4000, P_U_W, 0, 0]).unwrap();
        assert_eq!(rig.spaces.frames().free_count(), free);
        let mut out = [0xaa; 16];
        rig.spaces.read_bytes(space, 0x4000, &mut out).unwrap();
        assert_eq!(out, [0; 16]);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn page_alloc_reports_no_mem() {
        use crate::mm::{AddressSpaceError, MapError};

        let (mut rig, root) = Rig::new();
        rig.spaces.fail_next_frame_alloc();
        let err = rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x4000, P_U, 0, 0]).unwrap_err();
        assert_eq!(err, Error::AddressSpace(AddressSpaceError::Mapping(MapError::OutOfMemory)));
        assert_eq!(err.kind(), Some(ErrorKind::NoMem));
    }

    #[test]
    fn page_map_forbids_write_escalation() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x5000, P_U, 0, 0]).unwrap();
        let regs = [0, 0x5000, usize::from(child), 0x6000, P_U_W];
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_MAP, regs),
            Err(Error::Perm(PermError::WriteEscalation))
        );
        let regs = [0, 0x5000, usize::from(child), 0x6000, P_U];
        rig.call(root, SYSCALL_PAGE_MAP, regs).unwrap();
        let src = rig.spaces.lookup(rig.space(root), 0x5000).unwrap().unwrap();
        let dst = rig.spaces.lookup(rig.space(child), 0x6000).unwrap().unwrap();
        assert_eq!(src.frame, dst.frame);
    }

    #[test]
    fn page_map_rejects_unmapped_source_and_bad_addresses() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        let c = usize::from(child);
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_MAP, [0, 0x5000, c, 0x6000, P_U]),
            Err(Error::NotMapped(0x5000))
        );
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_MAP, [0, 0x5000, c, 0x6008, P_U]),
            Err(Error::BadAddress(0x6008))
        );
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_MAP, [0, 0x5000, 0x4321, 0x6000, P_U]),
            Err(Error::Env(EnvError::BadEnv))
        );
    }

    #[test]
    fn page_unmap_is_idempotent() {
        let (mut rig, root) = Rig::new();
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x7000, P_U, 0, 0]).unwrap();
        assert_eq!(rig.call(root, SYSCALL_PAGE_UNMAP, [0, 0x7000, 0, 0, 0]), Ok(0));
        assert_eq!(rig.call(root, SYSCALL_PAGE_UNMAP, [0, 0x7000, 0, 0, 0]), Ok(0));
        assert!(rig.spaces.lookup(rig.space(root), 0x7000).unwrap().is_none());
        assert_eq!(
            rig.call(root, SYSCALL_PAGE_UNMAP, [0, 0x7010, 0, 0, 0]),
            Err(Error::BadAddress(0x7010))
        );
    }

    #[test]
    fn set_trapframe_sanitizes_privilege() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x8000, P_U_W, 0, 0]).unwrap();
        let evil = TrapFrame {
            cs: 0x08,
            ss: 0x10,
            ds: 0x10,
            es: 0x10,
            eip: 0xdead_b000,
            eflags: FL_IOPL_MASK,
            ..TrapFrame::default()
        };
        rig.spaces.write_bytes(rig.space(root), 0x8000, &evil.to_le_bytes()).unwrap();
        rig.call(root, SYSCALL_ENV_SET_TRAPFRAME, [usize::from(child), 0x8000, 0, 0, 0]).unwrap();
        let tf = rig.envs.get(child).unwrap().tf;
        assert_eq!(tf.eip, 0xdead_b000);
        assert_eq!(tf.cs & 3, 3);
        assert_eq!(tf.eflags & FL_IOPL_MASK, 0);
    }

    #[test]
    fn set_trapframe_with_bad_pointer_is_bad_env_not_fatal() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        let err = rig
            .call(root, SYSCALL_ENV_SET_TRAPFRAME, [usize::from(child), 0x8000, 0, 0, 0])
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BadEnv));
        assert_eq!(rig.envs.get(root).unwrap().status(), EnvStatus::Runnable);
    }

    #[test]
    fn pgfault_upcall_is_stored_unchecked() {
        let (mut rig, root) = Rig::new();
        rig.call(root, SYSCALL_ENV_SET_PGFAULT_UPCALL, [0, 0xdead_0000, 0, 0, 0]).unwrap();
        assert_eq!(rig.envs.get(root).unwrap().pgfault_upcall, Some(0xdead_0000));
    }

    #[test]
    fn destroying_self_switches_away() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        rig.call(root, SYSCALL_ENV_SET_STATUS, [usize::from(child), 2, 0, 0, 0]).unwrap();
        assert_eq!(rig.call(root, SYSCALL_ENV_DESTROY, [0; 5]), Err(Error::CallerDestroyed));
        assert_eq!(rig.scheduler.current(), Some(child));
        assert!(rig.envs.get(root).is_none());
    }

    #[test]
    fn cwd_round_trip_and_length_limit() {
        let (mut rig, root) = Rig::new();
        let space = rig.space(root);
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0x9000, P_U_W, 0, 0]).unwrap();
        rig.spaces.write_bytes(space, 0x9000, b"/home\0").unwrap();
        rig.call(root, SYSCALL_CHDIR, [0x9000, 6, 0, 0, 0]).unwrap();
        assert_eq!(rig.globals.cwd(), b"/home\0");
        rig.call(root, SYSCALL_GETCWD, [0x9100, 0, 0, 0, 0]).unwrap();
        let mut out = [0u8; 6];
        rig.spaces.read_bytes(space, 0x9100, &mut out).unwrap();
        assert_eq!(&out, b"/home\0");
        assert_eq!(
            rig.call(root, SYSCALL_CHDIR, [0x9000, 16, 0, 0, 0]),
            Err(Error::PathTooLong(16))
        );
    }

    #[test]
    fn login_attempts_round_trip() {
        let (mut rig, root) = Rig::new();
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0xa000, P_U_W, 0, 0]).unwrap();
        rig.call(root, SYSCALL_SET_LOGATT, [3, 0, 0, 0, 0]).unwrap();
        rig.call(root, SYSCALL_GET_LOGATT, [0xa004, 0, 0, 0, 0]).unwrap();
        let mut out = [0u8; 4];
        rig.spaces.read_bytes(rig.space(root), 0xa004, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 3);
    }

    #[test]
    fn bad_output_pointer_destroys_caller() {
        let (mut rig, root) = Rig::new();
        rig.call(root, SYSCALL_PAGE_ALLOC, [0, 0xa000, P_U, 0, 0]).unwrap();
        assert_eq!(
            rig.call(root, SYSCALL_GET_LOGATT, [0xa000, 0, 0, 0, 0]),
            Err(Error::CallerDestroyed)
        );
        assert!(rig.envs.get(root).is_none());
        assert_eq!(rig.scheduler.current(), None);
    }

    #[test]
    fn identity_and_clock() {
        let (mut rig, root) = Rig::new();
        assert_eq!(rig.call(root, SYSCALL_GETENVID, [0; 5]), Ok(usize::from(root)));
        rig.rtc.tick(5);
        assert_eq!(rig.call(root, SYSCALL_GETTIME, [0; 5]), Ok(1_005));
    }

    #[test]
    fn yield_writes_zero_and_switches() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        rig.call(root, SYSCALL_ENV_SET_STATUS, [usize::from(child), 2, 0, 0, 0]).unwrap();
        rig.envs.get_mut(root).unwrap().tf.regs.eax = SYSCALL_YIELD as u32;
        assert_eq!(rig.call(root, SYSCALL_YIELD, [0; 5]), Err(Error::Suspended));
        assert_eq!(rig.envs.get(root).unwrap().tf.regs.eax, 0);
        assert_eq!(rig.scheduler.current(), Some(child));
    }

    #[test]
    fn forced_wake_cancels_receive() {
        let (mut rig, root) = Rig::new();
        let child = rig.fork(root);
        rig.call(root, SYSCALL_ENV_SET_STATUS, [usize::from(child), 2, 0, 0, 0]).unwrap();
        assert_eq!(rig.call(child, SYSCALL_IPC_RECV, [UTOP, 0, 0, 0, 0]), Err(Error::Suspended));
        rig.call(root, SYSCALL_ENV_SET_STATUS, [usize::from(child), 2, 0, 0, 0]).unwrap();
        let env = rig.envs.get(child).unwrap();
        assert!(!env.ipc.recving);
        assert_eq!(env.tf.regs.eax as i32 as isize, ErrorKind::Invalid.code());
    }
}
