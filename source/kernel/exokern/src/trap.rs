// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved user register state (i386 trap frame)
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, PushRegs, TRAPFRAME_BYTES, FL_IF, FL_IOPL_MASK
//! DEPENDS_ON: static_assertions
//! INVARIANTS: Wire layout is exactly 68 little-endian bytes; frames installed from userspace
//!             always resume at CPL 3 with interrupts enabled and IOPL 0

use core::mem::size_of;

/// Interrupt-enable flag.
pub const FL_IF: u32 = 0x0000_0200;
/// I/O privilege level bits.
pub const FL_IOPL_MASK: u32 = 0x0000_3000;
/// Requested privilege level 3 on a segment selector.
const RPL_USER: u16 = 3;

/// Encoded size of a [`TrapFrame`].
pub const TRAPFRAME_BYTES: usize = 68;

/// General-purpose registers in `pusha` order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Register snapshot taken on entry to the kernel and restored on return to userspace.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u16,
    pub padding1: u16,
    pub ds: u16,
    pub padding2: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding3: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    pub padding4: u16,
}

static_assertions::const_assert_eq!(size_of::<TrapFrame>(), TRAPFRAME_BYTES);
static_assertions::const_assert_eq!(size_of::<PushRegs>(), 32);

#[inline]
fn word(bytes: &[u8; TRAPFRAME_BYTES], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
fn half(bytes: &[u8; TRAPFRAME_BYTES], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

impl TrapFrame {
    /// Fresh frame for a new environment: user segments, interrupts on.
    pub fn new_user(eip: u32, esp: u32) -> Self {
        let mut tf = Self { eip, esp, ..Self::default() };
        tf.sanitize_for_user();
        tf
    }

    /// Forces the frame into a state that is safe to resume in user mode.
    pub fn sanitize_for_user(&mut self) {
        self.eflags |= FL_IF;
        self.eflags &= !FL_IOPL_MASK;
        self.cs |= RPL_USER;
        self.ss |= RPL_USER;
        self.ds |= RPL_USER;
        self.es |= RPL_USER;
    }

    /// Stores a syscall result in the return register.
    #[inline]
    pub fn set_return(&mut self, value: isize) {
        self.regs.eax = value as u32;
    }

    /// Call number and the five argument registers in calling-convention order.
    pub fn syscall_regs(&self) -> (usize, [usize; 5]) {
        let r = &self.regs;
        (
            r.eax as usize,
            [r.edx as usize, r.ecx as usize, r.ebx as usize, r.edi as usize, r.esi as usize],
        )
    }

    /// Serialises the frame in its little-endian memory layout.
    pub fn to_le_bytes(&self) -> [u8; TRAPFRAME_BYTES] {
        let mut bytes = [0u8; TRAPFRAME_BYTES];
        let r = &self.regs;
        let words = [r.edi, r.esi, r.ebp, r.oesp, r.ebx, r.edx, r.ecx, r.eax];
        for (i, w) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        bytes[32..34].copy_from_slice(&self.es.to_le_bytes());
        bytes[34..36].copy_from_slice(&self.padding1.to_le_bytes());
        bytes[36..38].copy_from_slice(&self.ds.to_le_bytes());
        bytes[38..40].copy_from_slice(&self.padding2.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.trapno.to_le_bytes());
        bytes[44..48].copy_from_slice(&self.err.to_le_bytes());
        bytes[48..52].copy_from_slice(&self.eip.to_le_bytes());
        bytes[52..54].copy_from_slice(&self.cs.to_le_bytes());
        bytes[54..56].copy_from_slice(&self.padding3.to_le_bytes());
        bytes[56..60].copy_from_slice(&self.eflags.to_le_bytes());
        bytes[60..64].copy_from_slice(&self.esp.to_le_bytes());
        bytes[64..66].copy_from_slice(&self.ss.to_le_bytes());
        bytes[66..68].copy_from_slice(&self.padding4.to_le_bytes());
        bytes
    }

    /// Deserialises a frame from its little-endian memory layout.
    pub fn from_le_bytes(bytes: &[u8; TRAPFRAME_BYTES]) -> Self {
        Self {
            regs: PushRegs {
                edi: word(bytes, 0),
                esi: word(bytes, 4),
                ebp: word(bytes, 8),
                oesp: word(bytes, 12),
                ebx: word(bytes, 16),
                edx: word(bytes, 20),
                ecx: word(bytes, 24),
                eax: word(bytes, 28),
            },
            es: half(bytes, 32),
            padding1: half(bytes, 34),
            ds: half(bytes, 36),
            padding2: half(bytes, 38),
            trapno: word(bytes, 40),
            err: word(bytes, 44),
            eip: word(bytes, 48),
            cs: half(bytes, 52),
            padding3: half(bytes, 54),
            eflags: word(bytes, 56),
            esp: word(bytes, 60),
            ss: half(bytes, 64),
            padding4: half(bytes, 66),
        }
    }
}
