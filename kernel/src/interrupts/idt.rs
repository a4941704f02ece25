//! Interrupt Descriptor Table
//!
//! - CPU exceptions (breakpoint, page fault, double fault)
//! - Timer interrupt, which drives preemption
//! - `int 0x80` syscalls
//!
//! The timer and syscall vectors enter through naked stubs that push the general registers
//! on top of the CPU-pushed frame, hand Rust a `&mut TrapFrame`, and `iretq` through
//! whatever the handler left there. Switching processes is just rewriting that frame.

use lazy_static::lazy_static;
use log::error;
use x86_64::{
    instructions::interrupts,
    registers::control::Cr2,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
    VirtAddr,
};

use crate::{
    constants::{
        gdt::DOUBLE_FAULT_IST_INDEX,
        idt::{SYSCALL_HANDLER, TIMER_VECTOR},
    },
    interrupts::x2apic,
    processes::context::TrapFrame,
    serial_println,
    state::{with_kernel, KERNEL},
};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
            idt[TIMER_VECTOR].set_handler_addr(VirtAddr::new(naked_timer_handler as usize as u64));
            idt[SYSCALL_HANDLER]
                .set_handler_addr(VirtAddr::new(naked_syscall_handler as usize as u64));
        }
        idt
    };
}

pub fn init_idt() {
    IDT.load();
}

/// Enables interrupts on the CPU.
pub fn enable() {
    interrupts::enable();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    serial_println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// No demand paging: every page fault is a kernel or process bug.
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let faulting_address = Cr2::read_raw();
    error!(
        "EXCEPTION: PAGE FAULT at {:#x}, error code {:?}\n{:#?}",
        faulting_address, error_code, stack_frame
    );

    // the fault may have hit while the state was locked
    if let Some(guard) = KERNEL.try_lock() {
        if let Some(kernel) = guard.as_ref() {
            kernel.dump_stats();
        }
    }
    panic!("PAGE FAULT at {:#x}", faulting_address);
}

macro_rules! trap_stub {
    ($name:ident, $handler:ident) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "
                push rbp
                push r15
                push r14
                push r13
                push r12
                push r11
                push r10
                push r9
                push r8
                push rdi
                push rsi
                push rdx
                push rcx
                push rbx
                push rax

                cld
                mov rdi, rsp
                call {handler}

                pop rax
                pop rbx
                pop rcx
                pop rdx
                pop rsi
                pop rdi
                pop r8
                pop r9
                pop r10
                pop r11
                pop r12
                pop r13
                pop r14
                pop r15
                pop rbp
                iretq
                ",
                handler = sym $handler,
            )
        }
    };
}

trap_stub!(naked_timer_handler, timer_handler);
trap_stub!(naked_syscall_handler, syscall_handler);

extern "C" fn timer_handler(frame: &mut TrapFrame) {
    with_kernel(|kernel| kernel.timer_tick(frame));
    if let Err(err) = x2apic::eoi() {
        panic!("Timer EOI failed: {}", err);
    }
}

extern "C" fn syscall_handler(frame: &mut TrapFrame) {
    with_kernel(|kernel| kernel.syscall(frame));
}
