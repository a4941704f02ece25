// Syscall numbers
pub const SYSCALL_HELLO: u64 = 0;
pub const SYSCALL_WRITE: u64 = 1;
pub const SYSCALL_GETPID: u64 = 2;
pub const SYSCALL_YIELD: u64 = 3;
pub const SYSCALL_EXIT: u64 = 4;

pub const SYSCALL_COUNT: usize = 5;

/// Longest buffer a single write may pass in.
pub const MAX_WRITE_LEN: usize = 4096;

/// Bytes copied out of the caller's address space per step.
pub const COPY_CHUNK: usize = 256;
