#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod cpu;
pub mod devices;
pub mod error;
#[cfg(target_os = "none")]
pub mod init;
#[cfg(target_os = "none")]
pub mod interrupts;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod state;
pub mod syscalls;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

/// Body of the idle context. Runs whenever no process is ready.
pub extern "C" fn idle_loop() -> ! {
    loop {
        cpu::halt();
    }
}
