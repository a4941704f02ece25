#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use kestrel::serial_println;

#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn kmain() -> ! {
    kestrel::init::init()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    serial_println!("Kernel panic: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}

/// The kernel only boots on bare metal; hosted builds exist for the unit tests.
#[cfg(not(target_os = "none"))]
fn main() {}
