//! Devices the kernel core talks to.
//!
//! - Serial port (COM1) for logs and process output
//! - The `Console` sink that syscalls write into

pub mod console;
pub mod serial;

pub use console::Console;
