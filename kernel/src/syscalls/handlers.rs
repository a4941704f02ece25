//! Syscall implementations.
//!
//! Handlers only decide what a call does; the dispatcher turns the `Completion` into a
//! register result, a reschedule, or a process exit.

use log::debug;

use crate::{
    error::KernelError,
    state::Kernel,
    syscalls::{user_buffer::UserBuffer, Completion, SyscallError, SyscallRequest},
};

pub type SyscallHandler = fn(&mut Kernel, &SyscallRequest) -> Result<Completion, KernelError>;

pub const GREETING: &[u8] = b"Hello from the kernel!\n";

pub fn sys_hello(
    kernel: &mut Kernel,
    _request: &SyscallRequest,
) -> Result<Completion, KernelError> {
    kernel.console.write_bytes(GREETING);
    Ok(Completion::Return(0))
}

/// `write(ptr, len)`: copies `len` bytes of the caller's memory to the console.
pub fn sys_write(
    kernel: &mut Kernel,
    request: &SyscallRequest,
) -> Result<Completion, KernelError> {
    let [ptr, len, _] = request.args;
    let pcb = kernel
        .processes
        .current_pcb()
        .ok_or(SyscallError::InvalidArgument)?;

    let buffer = UserBuffer::validate(&kernel.vmm, pcb.space(), ptr, len)?;
    let console = &mut kernel.console;
    buffer.copy_chunks(&kernel.vmm, pcb.space(), |chunk| console.write_bytes(chunk))?;

    Ok(Completion::Return(buffer.len() as i64))
}

pub fn sys_getpid(
    kernel: &mut Kernel,
    _request: &SyscallRequest,
) -> Result<Completion, KernelError> {
    let pid = kernel.processes.current().unwrap_or(0);
    Ok(Completion::Return(pid as i64))
}

pub fn sys_yield(
    _kernel: &mut Kernel,
    _request: &SyscallRequest,
) -> Result<Completion, KernelError> {
    Ok(Completion::Reschedule)
}

pub fn sys_exit(
    kernel: &mut Kernel,
    request: &SyscallRequest,
) -> Result<Completion, KernelError> {
    let pid = kernel
        .processes
        .current()
        .ok_or(SyscallError::InvalidArgument)?;
    let code = request.args[0] as i32;

    debug!("Process {} requested exit({})", pid, code);
    Ok(Completion::Exit(code))
}
