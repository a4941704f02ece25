//! Boot: turn what Limine hands over into a running `Kernel`, then enter the first process.

use alloc::boxed::Box;

use arrayvec::ArrayVec;
use limine::{
    memory_map::EntryType,
    request::{
        HhdmRequest, KernelAddressRequest, MemoryMapRequest, RequestsEndMarker,
        RequestsStartMarker,
    },
    BaseRevision,
};
use log::{info, warn};
use x86_64::{registers::control::Cr3, VirtAddr};

use crate::{
    constants::{
        gdt::IDLE_STACK_SIZE,
        memory::{HEAP_SIZE, HEAP_START},
    },
    devices::serial::SerialConsole,
    idle_loop,
    interrupts::{self, idt, x2apic},
    logging,
    memory::{
        bitmap_frame_allocator::{MemoryRegion, RegionKind},
        heap::HEAP,
        BitmapFrameAllocator, Vmm,
    },
    processes::{context::Context, demo, process::EntryPoint},
    serial_println,
    state::{Kernel, KERNEL},
    syscalls::user,
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

extern "C" {
    /// First byte past the loaded image, placed by `linker.ld`.
    static _kernel_end: u8;
}

const MAX_REGIONS: usize = 128;

#[repr(align(16))]
struct IdleStack([u8; IDLE_STACK_SIZE]);

static mut IDLE_STACK: IdleStack = IdleStack([0; IDLE_STACK_SIZE]);

const DEMO_PROCESSES: [(EntryPoint, &str); 2] = [(demo::ping, "ping"), (demo::pong, "pong")];

type MemoryMap = ArrayVec<MemoryRegion, MAX_REGIONS>;

fn boot_memory_map() -> MemoryMap {
    let response = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed");

    let mut regions = MemoryMap::new();
    for entry in response.entries() {
        let kind = match entry.entry_type {
            EntryType::USABLE => RegionKind::Usable,
            EntryType::KERNEL_AND_MODULES => RegionKind::KernelImage,
            _ => RegionKind::Reserved,
        };
        // one slot stays free for the image region below
        if regions.len() == MAX_REGIONS - 1 {
            warn!("Memory map has too many entries, ignoring the rest");
            break;
        }
        regions.push(MemoryRegion::new(entry.base, entry.length, kind));
    }

    // the image's own extent, in case the bootloader folded it into a bigger entry
    let image = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("Kernel address request failed");
    let image_len = unsafe { &raw const _kernel_end as u64 } - image.virtual_base();
    regions.push(MemoryRegion::new(
        image.physical_base(),
        image_len,
        RegionKind::KernelImage,
    ));

    regions
}

fn idle_context() -> Context {
    let bottom = (&raw const IDLE_STACK) as u64;
    Context::new(idle_loop as usize as u64, bottom + IDLE_STACK_SIZE as u64 - 8)
}

pub fn init() -> ! {
    assert!(BASE_REVISION.is_supported());

    if let Err(err) = logging::init() {
        serial_println!("Logger already set: {}", err);
    }
    info!("Booting kestrel");

    interrupts::init();

    let phys_offset = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset(),
    );
    let memory_map = boot_memory_map();
    let mut frames = BitmapFrameAllocator::init(&memory_map);

    let (boot_root, _) = Cr3::read();
    let mut vmm = Vmm::new(phys_offset, Some(boot_root), &mut frames)
        .unwrap_or_else(|err| panic!("Failed to build kernel address space: {}", err));
    vmm.enable()
        .unwrap_or_else(|err| panic!("Failed to enable paging: {}", err));

    let heap_pages = vmm
        .map_kernel_region(VirtAddr::new(HEAP_START), HEAP_SIZE, &mut frames)
        .unwrap_or_else(|err| panic!("Failed to map kernel heap: {}", err));
    unsafe { HEAP.init(HEAP_START as usize, HEAP_SIZE) };
    info!("Kernel heap: {} pages at {:#x}", heap_pages, HEAP_START);

    let mut kernel = Kernel::new(
        Box::new(frames),
        vmm,
        &HEAP,
        idle_context(),
        Box::new(SerialConsole),
    );
    for (entry, name) in DEMO_PROCESSES {
        match kernel.spawn(entry, name) {
            Ok(pid) => info!("Spawned {} as pid {}", name, pid),
            Err(err) => warn!("Failed to spawn {}: {}", name, err),
        }
    }
    kernel.dump_stats();
    *KERNEL.lock() = Some(kernel);

    x2apic::init_timer().unwrap_or_else(|err| panic!("Failed to start timer: {}", err));
    idt::enable();

    // with nothing running, the scheduler drops this boot context and never comes back
    user::yield_now();
    idle_loop()
}
