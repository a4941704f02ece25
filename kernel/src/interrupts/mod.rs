//! CPU tables and interrupt sources. Bare metal only.

pub mod gdt;
pub mod idt;
pub mod x2apic;

/// Loads the GDT and IDT. Interrupts stay disabled until boot is ready for them.
pub fn init() {
    gdt::init();
    idt::init_idt();
}
