//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// PIT channel 0 data port, used to calibrate the APIC timer.
pub const PIT_CHANNEL_0: u16 = 0x40;
/// PIT mode/command register.
pub const PIT_MODE_CMD: u16 = 0x43;
