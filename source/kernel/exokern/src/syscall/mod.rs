// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, ErrorKind, Handler, SYSCALL_* IDs
//! DEPENDS_ON: env, ipc, mm, uaccess, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline;
//!             unknown numbers fail Invalid without side effects

pub mod api;

use core::fmt;

use crate::{env, ipc, mm, uaccess};

/// Size of the dispatch window.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers edx, ecx, ebx, edi, esi.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 5],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 5]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Public syscall numbers.
pub const SYSCALL_ENV_DESTROY: usize = 0;
pub const SYSCALL_EXOFORK: usize = 1;
pub const SYSCALL_ENV_SET_STATUS: usize = 2;
pub const SYSCALL_ENV_SET_TRAPFRAME: usize = 3;
pub const SYSCALL_ENV_SET_PGFAULT_UPCALL: usize = 4;
pub const SYSCALL_PAGE_ALLOC: usize = 5;
pub const SYSCALL_PAGE_MAP: usize = 6;
pub const SYSCALL_PAGE_UNMAP: usize = 7;
pub const SYSCALL_IPC_TRY_SEND: usize = 8;
/// Blocks until a sender delivers; the return word arrives on resumption.
pub const SYSCALL_IPC_RECV: usize = 9;
pub const SYSCALL_YIELD: usize = 10;
pub const SYSCALL_GETENVID: usize = 11;
/// UNIX seconds from the wall clock.
pub const SYSCALL_GETTIME: usize = 12;
pub const SYSCALL_CHDIR: usize = 13;
pub const SYSCALL_GETCWD: usize = 14;
/// Login-attempt counter shared by the login program.
pub const SYSCALL_SET_LOGATT: usize = 15;
pub const SYSCALL_GET_LOGATT: usize = 16;

/// Error kinds visible to userspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadEnv,
    Invalid,
    NoMem,
    NoFreeEnv,
    IpcNotRecv,
}

impl ErrorKind {
    /// Negative code returned in the result register.
    pub const fn code(self) -> isize {
        match self {
            Self::BadEnv => -2,
            Self::Invalid => -3,
            Self::NoMem => -4,
            Self::NoFreeEnv => -5,
            Self::IpcNotRecv => -7,
        }
    }

    /// Decodes a result word back into a kind.
    pub const fn from_code(code: isize) -> Option<Self> {
        match code {
            -2 => Some(Self::BadEnv),
            -3 => Some(Self::Invalid),
            -4 => Some(Self::NoMem),
            -5 => Some(Self::NoFreeEnv),
            -7 => Some(Self::IpcNotRecv),
            _ => None,
        }
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Registry lookup or allocation failed.
    Env(env::EnvError),
    /// Address-space manager reported an error.
    AddressSpace(mm::AddressSpaceError),
    /// `perm` argument rejected.
    Perm(mm::PermError),
    /// Address at or above `UTOP`, or not page aligned.
    BadAddress(usize),
    /// Source address has no mapping.
    NotMapped(usize),
    /// Status word is not `Runnable` or `NotRunnable`.
    BadStatus(usize),
    /// Working directory does not fit the kernel buffer.
    PathTooLong(usize),
    /// Trap frame pointer is not accessible to the caller.
    BadTrapframe(uaccess::AccessFault),
    /// IPC failed.
    Ipc(ipc::IpcError),
    /// Caller gave up the processor; its return word is written when it resumes.
    Suspended,
    /// Caller no longer exists and must not be resumed.
    CallerDestroyed,
}

impl Error {
    /// Userspace-visible kind, `None` for control-flow outcomes.
    pub fn kind(&self) -> Option<ErrorKind> {
        use env::EnvError;
        use ipc::IpcError;
        use mm::{AddressSpaceError, MapError};

        Some(match self {
            Self::InvalidSyscall
            | Self::Perm(_)
            | Self::BadAddress(_)
            | Self::NotMapped(_)
            | Self::BadStatus(_)
            | Self::PathTooLong(_) => ErrorKind::Invalid,
            Self::Env(EnvError::BadEnv) | Self::BadTrapframe(_) => ErrorKind::BadEnv,
            Self::Env(EnvError::NoFreeEnv) => ErrorKind::NoFreeEnv,
            Self::Env(EnvError::NoMem) => ErrorKind::NoMem,
            Self::AddressSpace(AddressSpaceError::InvalidHandle) => ErrorKind::BadEnv,
            Self::AddressSpace(AddressSpaceError::Mapping(MapError::OutOfMemory)) => {
                ErrorKind::NoMem
            }
            Self::AddressSpace(_) => ErrorKind::Invalid,
            Self::Ipc(IpcError::BadEnv) => ErrorKind::BadEnv,
            Self::Ipc(IpcError::NotRecv) => ErrorKind::IpcNotRecv,
            Self::Ipc(IpcError::NoMem) => ErrorKind::NoMem,
            Self::Ipc(_) => ErrorKind::Invalid,
            Self::Suspended | Self::CallerDestroyed => return None,
        })
    }

    /// Result word for this error; `None` when nothing is returned to the caller.
    pub fn code(&self) -> Option<isize> {
        self.kind().map(ErrorKind::code)
    }
}

impl From<env::EnvError> for Error {
    fn from(value: env::EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<mm::AddressSpaceError> for Error {
    fn from(value: mm::AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<mm::PermError> for Error {
    fn from(value: mm::PermError) -> Self {
        Self::Perm(value)
    }
}

impl From<ipc::IpcError> for Error {
    fn from(value: ipc::IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
