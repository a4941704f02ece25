pub mod context;
#[cfg(target_os = "none")]
pub mod demo;
pub mod process;
pub mod scheduler;

pub use process::{Pid, ProcessState, ProcessTable};

/// Return address planted at the top of every process stack.
///
/// An entry function that returns pops this and issues `exit(0)`.
#[cfg(target_os = "none")]
#[unsafe(naked)]
pub extern "C" fn process_return() -> ! {
    core::arch::naked_asm!(
        "xor edi, edi",
        "mov eax, {exit}",
        "int 0x80",
        "ud2",
        exit = const crate::constants::syscalls::SYSCALL_EXIT,
    )
}

#[cfg(not(target_os = "none"))]
pub extern "C" fn process_return() -> ! {
    loop {
        crate::cpu::halt();
    }
}
