//! Global Descriptor Table and stack configuration.

/// Index in the Interrupt Stack Table (IST) for handling double faults.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of each IST stack in bytes.
/// Set to 16KB (4 pages) to handle deep call stacks during faults.
pub const IST_STACK_SIZE: usize = 4096 * 4;

/// Stack the idle loop runs on once the boot path hands off.
pub const IDLE_STACK_SIZE: usize = 4096 * 2;

/// Kernel code segment, the first descriptor after the null entry.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Kernel data segment, directly after the code segment.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
