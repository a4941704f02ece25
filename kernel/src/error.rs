//! Kernel-wide error type.
//!
//! Each subsystem reports its own enum; `KernelError` gathers them so the syscall boundary
//! and the boot path can decide between handing a negative status back to the caller and
//! stopping the machine.

use core::fmt;

use crate::{
    memory::{bitmap_frame_allocator::FrameError, heap::HeapError, paging::VmmError},
    processes::process::ProcessError,
    syscalls::SyscallError,
};

pub const EAGAIN: i64 = -11;
pub const ENOMEM: i64 = -12;
pub const EINVAL: i64 = -22;
pub const ENOSYS: i64 = -38;
pub const EOVERFLOW: i64 = -75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Frame(FrameError),
    Vmm(VmmError),
    Heap(HeapError),
    Process(ProcessError),
    Syscall(SyscallError),
}

impl KernelError {
    /// Whether this indicates a kernel bug rather than a request that cannot be served.
    pub fn is_fatal(&self) -> bool {
        match self {
            KernelError::Frame(err) => err.is_fatal(),
            KernelError::Vmm(err) => err.is_fatal(),
            KernelError::Heap(err) => err.is_fatal(),
            KernelError::Process(err) => err.is_fatal(),
            KernelError::Syscall(_) => false,
        }
    }

    /// Status reported to a syscall caller.
    pub fn errno(&self) -> i64 {
        match self {
            KernelError::Frame(FrameError::OutOfMemory)
            | KernelError::Vmm(VmmError::OutOfMemory)
            | KernelError::Heap(HeapError::OutOfMemory)
            | KernelError::Process(ProcessError::OutOfMemory) => ENOMEM,
            KernelError::Heap(HeapError::Overflow) => EOVERFLOW,
            KernelError::Process(ProcessError::TableFull) => EAGAIN,
            KernelError::Process(ProcessError::Vmm(err)) => KernelError::Vmm(*err).errno(),
            KernelError::Process(ProcessError::Heap(err)) => KernelError::Heap(*err).errno(),
            KernelError::Syscall(SyscallError::InvalidSyscall(_)) => ENOSYS,
            _ => EINVAL,
        }
    }
}

impl From<FrameError> for KernelError {
    fn from(err: FrameError) -> Self {
        KernelError::Frame(err)
    }
}

impl From<VmmError> for KernelError {
    fn from(err: VmmError) -> Self {
        KernelError::Vmm(err)
    }
}

impl From<HeapError> for KernelError {
    fn from(err: HeapError) -> Self {
        KernelError::Heap(err)
    }
}

impl From<ProcessError> for KernelError {
    fn from(err: ProcessError) -> Self {
        KernelError::Process(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        KernelError::Syscall(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Frame(err) => write!(f, "Frame allocator: {}", err),
            KernelError::Vmm(err) => write!(f, "Virtual memory: {}", err),
            KernelError::Heap(err) => write!(f, "Heap: {}", err),
            KernelError::Process(err) => write!(f, "Processes: {}", err),
            KernelError::Syscall(err) => write!(f, "Syscall: {}", err),
        }
    }
}
