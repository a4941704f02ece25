//! Global Descriptor Table for the single CPU.
//!
//! Only ring-0 segments exist: processes run with the kernel code and data selectors. The
//! TSS carries the double-fault IST stack.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::constants::gdt::{
    DOUBLE_FAULT_IST_INDEX, IST_STACK_SIZE, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR,
};

// Null + kernel code/data + TSS (two entries in long mode)
const GDT_ENTRIES: usize = 5;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        static mut STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];
        let mut tss = TaskStateSegment::new();

        let stack_start = VirtAddr::from_ptr(&raw const STACK);
        let stack_end = stack_start + IST_STACK_SIZE as u64;
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_end;
        tss
    };

    static ref GDT: (GlobalDescriptorTable<GDT_ENTRIES>, Selectors) = {
        let mut gdt = GlobalDescriptorTable::<GDT_ENTRIES>::empty();

        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));

        (gdt, Selectors {
            code_selector,
            data_selector,
            tss_selector,
        })
    };
}

#[derive(Debug)]
struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

pub fn init() {
    // fresh process contexts are built from the constants
    assert_eq!(GDT.1.code_selector.0, KERNEL_CODE_SELECTOR);
    assert_eq!(GDT.1.data_selector.0, KERNEL_DATA_SELECTOR);

    GDT.0.load();

    unsafe {
        CS::set_reg(GDT.1.code_selector);

        DS::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);

        load_tss(GDT.1.tss_selector);
    }
}
