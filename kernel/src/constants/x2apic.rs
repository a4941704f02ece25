//! Local APIC timer configuration.

/// Milliseconds between two timer interrupts.
pub const TIMER_PERIOD_MS: u32 = 10;
