//! Interrupt Descriptor Table configuration.

/// Vector number assigned to the timer interrupt.
pub const TIMER_VECTOR: u8 = 32;
pub const ERROR_VECTOR: u8 = 33;
pub const SPURIOUS_VECTOR: u8 = 0xFF;
pub const SYSCALL_HANDLER: u8 = 0x80;
