//! Serial port interface for UART 16550 communication.
//! Provides locked access to write formatted text to COM1.
//!
//! Host builds have no port I/O; printing there is a no-op.

#[cfg(target_os = "none")]
mod port {
    use crate::constants::ports::SERIAL_PORT;
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        /// Locked wrapper around the first serial port (COM1).
        /// Initializes the port on first access.
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }
}

#[cfg(target_os = "none")]
pub use port::SERIAL1;

#[doc(hidden)]
#[cfg(target_os = "none")]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // printing must not race the timer handler for the port lock
    crate::cpu::without_interrupts(|| {
        // a UART write cannot fail, only the formatting of `args` can
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(_args: ::core::fmt::Arguments) {}

/// Sends process output straight to COM1.
#[cfg(target_os = "none")]
pub struct SerialConsole;

#[cfg(target_os = "none")]
impl super::Console for SerialConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        crate::cpu::without_interrupts(|| {
            let mut port = SERIAL1.lock();
            for &byte in bytes {
                port.send(byte);
            }
        });
    }
}

/// Prints formatted text to the serial port.
///
/// # Examples
/// ```ignore
/// serial_print!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
///
/// # Examples
/// ```ignore
/// serial_println!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
