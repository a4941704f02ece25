//! Saved CPU state.
//!
//! `TrapFrame` is the exact image the interrupt entry stubs leave on the stack: the general
//! registers they push, followed by what the CPU pushed on entry. The scheduler never reads
//! registers directly; it copies a frame into a `Context` and back.

use core::fmt;

use crate::constants::{
    gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR},
    processes::INITIAL_RFLAGS,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
}

/// Stack layout at the point the entry stub calls into Rust.
///
/// Field order is load-bearing: it mirrors the push sequence in `interrupts::idt`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: GeneralRegisters,
    // pushed by the CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub regs: GeneralRegisters,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

impl Context {
    /// A fresh kernel-mode context that starts executing at `entry` on `stack_top`.
    pub fn new(entry: u64, stack_top: u64) -> Self {
        Self {
            regs: GeneralRegisters::default(),
            rip: entry,
            rsp: stack_top,
            rflags: INITIAL_RFLAGS,
            cs: KERNEL_CODE_SELECTOR as u64,
            ss: KERNEL_DATA_SELECTOR as u64,
        }
    }
}

pub fn save_context(frame: &TrapFrame) -> Context {
    Context {
        regs: frame.regs,
        rip: frame.rip,
        rsp: frame.rsp,
        rflags: frame.rflags,
        cs: frame.cs,
        ss: frame.ss,
    }
}

/// Overwrites `frame` so that returning from the interrupt resumes `context`.
pub fn restore_context(frame: &mut TrapFrame, context: &Context) {
    frame.regs = context.regs;
    frame.rip = context.rip;
    frame.cs = context.cs;
    frame.rflags = context.rflags;
    frame.rsp = context.rsp;
    frame.ss = context.ss;
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let r = &self.regs;
        f.debug_struct("Context")
            .field("rax", &format_args!("{:#016x}", r.rax))
            .field("rbx", &format_args!("{:#016x}", r.rbx))
            .field("rcx", &format_args!("{:#016x}", r.rcx))
            .field("rdx", &format_args!("{:#016x}", r.rdx))
            .field("rsi", &format_args!("{:#016x}", r.rsi))
            .field("rdi", &format_args!("{:#016x}", r.rdi))
            .field("r8", &format_args!("{:#016x}", r.r8))
            .field("r9", &format_args!("{:#016x}", r.r9))
            .field("r10", &format_args!("{:#016x}", r.r10))
            .field("r11", &format_args!("{:#016x}", r.r11))
            .field("r12", &format_args!("{:#016x}", r.r12))
            .field("r13", &format_args!("{:#016x}", r.r13))
            .field("r14", &format_args!("{:#016x}", r.r14))
            .field("r15", &format_args!("{:#016x}", r.r15))
            .field("rbp", &format_args!("{:#016x}", r.rbp))
            .field("rsp", &format_args!("{:#016x}", self.rsp))
            .field("rip", &format_args!("{:#016x}", self.rip))
            .field("rflags", &format_args!("{:#016x}", self.rflags))
            .finish()
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&save_context(self), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_trap_frame_matches_push_order() {
        assert_eq!(size_of::<TrapFrame>(), 20 * 8);
        assert_eq!(offset_of!(TrapFrame, regs), 0);
        assert_eq!(offset_of!(GeneralRegisters, rax), 0);
        assert_eq!(offset_of!(GeneralRegisters, rbp), 14 * 8);
        assert_eq!(offset_of!(TrapFrame, rip), 15 * 8);
        assert_eq!(offset_of!(TrapFrame, rflags), 17 * 8);
        assert_eq!(offset_of!(TrapFrame, rsp), 18 * 8);
        assert_eq!(offset_of!(TrapFrame, ss), 19 * 8);
    }

    #[test]
    fn test_save_then_restore_round_trips() {
        let mut frame = TrapFrame::default();
        frame.regs.rax = 1;
        frame.regs.r15 = 15;
        frame.rip = 0xdead;
        frame.rsp = 0xbeef;
        frame.rflags = 0x246;

        let saved = save_context(&frame);
        let mut other = TrapFrame::default();
        restore_context(&mut other, &saved);
        assert_eq!(other, frame);
    }

    #[test]
    fn test_new_context_starts_at_entry() {
        let context = Context::new(0x1000, 0x8000);
        assert_eq!(context.rip, 0x1000);
        assert_eq!(context.rsp, 0x8000);
        assert_eq!(context.rflags, INITIAL_RFLAGS);
        assert_eq!(context.regs, GeneralRegisters::default());
    }
}
