//! Privileged CPU operations.
//!
//! The memory and process code calls these instead of touching control registers or the
//! interrupt flag directly. Bare-metal builds get the real instructions; host builds (unit
//! tests) get inert versions so the same logic runs under `cargo test`.

use x86_64::{structures::paging::PhysFrame, VirtAddr};

#[cfg(target_os = "none")]
mod imp {
    use x86_64::{
        instructions::{hlt, interrupts, tlb},
        registers::{
            control::{Cr0, Cr0Flags, Cr3, Cr3Flags},
            model_specific::{Efer, EferFlags},
        },
        structures::paging::PhysFrame,
        VirtAddr,
    };

    pub fn load_root(frame: PhysFrame) {
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    pub fn invalidate_page(addr: VirtAddr) {
        tlb::flush(addr);
    }

    pub fn enable_paging_features() {
        unsafe {
            // Must be done after enabling long mode + paging
            Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE));
            Cr0::update(|flags| flags.insert(Cr0Flags::WRITE_PROTECT));
        }
    }

    pub fn without_interrupts<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        interrupts::without_interrupts(f)
    }

    pub fn halt() {
        hlt();
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use x86_64::{structures::paging::PhysFrame, VirtAddr};

    pub fn load_root(_frame: PhysFrame) {}

    pub fn invalidate_page(_addr: VirtAddr) {}

    pub fn enable_paging_features() {}

    pub fn without_interrupts<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        f()
    }

    pub fn halt() {
        core::hint::spin_loop();
    }
}

/// Makes `frame` the active PML4.
pub fn load_root(frame: PhysFrame) {
    imp::load_root(frame)
}

/// Drops any cached translation for the page containing `addr`.
pub fn invalidate_page(addr: VirtAddr) {
    imp::invalidate_page(addr)
}

/// Turns on no-execute support and supervisor write protection.
pub fn enable_paging_features() {
    imp::enable_paging_features()
}

/// Executes a closure with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    imp::without_interrupts(f)
}

pub fn halt() {
    imp::halt()
}
