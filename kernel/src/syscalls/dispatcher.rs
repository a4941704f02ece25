use log::debug;

use crate::{
    constants::syscalls::SYSCALL_COUNT,
    error::KernelError,
    processes::context::TrapFrame,
    state::Kernel,
    syscalls::{
        handlers::{sys_exit, sys_getpid, sys_hello, sys_write, sys_yield, SyscallHandler},
        Completion, SyscallError, SyscallRequest,
    },
};

/// Indexed by syscall number.
static SYSCALL_TABLE: [SyscallHandler; SYSCALL_COUNT] =
    [sys_hello, sys_write, sys_getpid, sys_yield, sys_exit];

/// Services the syscall described by `frame` and leaves the result in its `rax`.
///
/// On `yield` or `exit` the frame is rewritten to resume whichever process runs next.
pub fn entry(kernel: &mut Kernel, frame: &mut TrapFrame) {
    let request = SyscallRequest::from_frame(frame);

    let result = dispatch(kernel, &request).and_then(|done| complete(kernel, frame, done));
    match result {
        Ok(()) => {}
        Err(err) if err.is_fatal() => kernel.fatal(&err),
        Err(err) => {
            debug!("Syscall {} failed: {}", request.number, err);
            frame.regs.rax = err.errno() as u64;
        }
    }
}

fn dispatch(kernel: &mut Kernel, request: &SyscallRequest) -> Result<Completion, KernelError> {
    let handler = usize::try_from(request.number)
        .ok()
        .and_then(|number| SYSCALL_TABLE.get(number))
        .ok_or(SyscallError::InvalidSyscall(request.number))?;

    handler(kernel, request)
}

fn complete(
    kernel: &mut Kernel,
    frame: &mut TrapFrame,
    completion: Completion,
) -> Result<(), KernelError> {
    match completion {
        Completion::Return(value) => frame.regs.rax = value as u64,
        Completion::Reschedule => {
            frame.regs.rax = 0;
            kernel.processes.yield_current(frame, &mut kernel.vmm)?;
        }
        Completion::Exit(code) => {
            let pid = kernel
                .processes
                .current()
                .ok_or(SyscallError::InvalidArgument)?;
            kernel.processes.exit(
                pid,
                code,
                frame,
                &mut kernel.frames,
                &mut kernel.vmm,
                kernel.heap,
            )?;
        }
    }
    Ok(())
}
