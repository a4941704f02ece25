//! The `int 0x80` boundary.
//!
//! ABI: number in `rax`, arguments in `rdi`, `rsi`, `rdx`, result in `rax`. Failures come
//! back as negative status codes (see `error`).

use core::fmt;

use crate::processes::context::TrapFrame;

pub mod dispatcher;
pub mod handlers;
pub mod user;
pub mod user_buffer;

pub use dispatcher::entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall(u64),
    /// Bad pointer, length, or a call that needs a calling process when there is none.
    InvalidArgument,
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::InvalidSyscall(number) => write!(f, "No syscall number {}", number),
            SyscallError::InvalidArgument => write!(f, "Invalid argument"),
        }
    }
}

/// A syscall as captured from the trap frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    pub number: u64,
    pub args: [u64; 3],
}

impl SyscallRequest {
    pub fn from_frame(frame: &TrapFrame) -> Self {
        Self {
            number: frame.regs.rax,
            args: [frame.regs.rdi, frame.regs.rsi, frame.regs.rdx],
        }
    }
}

/// How the dispatcher finishes a call once the handler is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Return(i64),
    /// Return 0 and let the scheduler pick who runs next.
    Reschedule,
    Exit(i32),
}
