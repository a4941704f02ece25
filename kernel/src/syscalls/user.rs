//! Calling side of the syscall ABI, for code running as a process.

#[cfg(target_os = "none")]
mod imp {
    use core::arch::asm;

    use crate::constants::syscalls::{
        SYSCALL_EXIT, SYSCALL_GETPID, SYSCALL_HELLO, SYSCALL_WRITE, SYSCALL_YIELD,
    };

    #[inline(always)]
    fn syscall3(number: u64, arg0: u64, arg1: u64, arg2: u64) -> i64 {
        let ret: u64;
        unsafe {
            asm!(
                "int 0x80",
                inlateout("rax") number => ret,
                in("rdi") arg0,
                in("rsi") arg1,
                in("rdx") arg2,
            );
        }
        ret as i64
    }

    pub fn hello() -> i64 {
        syscall3(SYSCALL_HELLO, 0, 0, 0)
    }

    pub fn write(bytes: &[u8]) -> i64 {
        syscall3(SYSCALL_WRITE, bytes.as_ptr() as u64, bytes.len() as u64, 0)
    }

    pub fn getpid() -> u32 {
        syscall3(SYSCALL_GETPID, 0, 0, 0) as u32
    }

    pub fn yield_now() {
        syscall3(SYSCALL_YIELD, 0, 0, 0);
    }

    pub fn exit(code: i32) -> ! {
        syscall3(SYSCALL_EXIT, code as u64, 0, 0);
        unreachable!("exit returned");
    }
}

#[cfg(target_os = "none")]
pub use imp::*;
