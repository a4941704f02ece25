pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

// Kernel heap, 2 GiB below the kernel image at -2 GiB
pub const HEAP_START: u64 = 0xFFFF_FFFF_0000_0000;
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MB

// Frames above this physical address are never handed out
pub const MAX_PHYS_MEMORY: usize = 512 * 1024 * 1024;
pub const MAX_FRAMES: usize = MAX_PHYS_MEMORY / FRAME_SIZE;
pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const BITMAP_ENTRIES: usize = MAX_FRAMES / BITMAP_ENTRY_SIZE;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

/// First PML4 slot of the higher half. Slots from here up are shared by every address space.
pub const KERNEL_PML4_START: usize = 256;
pub const PML4_ENTRIES: usize = 512;

/// Every heap block payload is aligned to this many bytes.
pub const HEAP_ALIGN: usize = 16;
