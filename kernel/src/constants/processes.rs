/// Number of PCB slots in the process table.
pub const MAX_PROCESSES: usize = 16;

/// Longest process name kept in a PCB, in bytes.
pub const PROCESS_NAME_LEN: usize = 16;

/// Kernel stack carved from the heap for every process.
pub const PROCESS_STACK_SIZE: usize = 4096 * 4;

/// Timer ticks a process runs before it is preempted.
pub const QUANTUM_TICKS: u32 = 5;

/// Interrupts enabled, reserved bit 1 set.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Where each process gets its private data page.
pub const PROCESS_DATA_START: u64 = 0x4000_0000;
