//! The Kernel Heap
//!
//! A first-fit allocator over one contiguous, already-mapped virtual range. Every block
//! starts with an inline header holding its total size and an in-use tag; blocks tile the
//! range with no gaps, so walking headers from the start visits every block in address
//! order. Two free blocks are never adjacent: `free` merges with both neighbours.
//!
//! `LockedHeap` wraps it for the `#[global_allocator]` slot, so `alloc` collections in the
//! kernel are served from the same blocks.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt, mem,
    ptr::{self, null_mut},
};

use spin::{Mutex, MutexGuard};

use crate::{constants::memory::HEAP_ALIGN, cpu};

#[repr(C)]
struct BlockHeader {
    /// Whole block, header included.
    size: usize,
    tag: usize,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const MIN_BLOCK: usize = HEADER_SIZE + HEAP_ALIGN;

const BLOCK_MAGIC: usize = 0x6b68_6561_7000;
const TAG_FREE: usize = BLOCK_MAGIC << 1;
const TAG_USED: usize = (BLOCK_MAGIC << 1) | 1;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Address of an allocation's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeapHandle(usize);

impl HeapHandle {
    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory,
    InvalidFree(usize),
    Overflow,
}

impl HeapError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HeapError::InvalidFree(_))
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "Kernel heap exhausted"),
            HeapError::InvalidFree(addr) => {
                write!(f, "Free of {:#x}, which is not a live heap allocation", addr)
            }
            HeapError::Overflow => write!(f, "Allocation size overflows"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the start of the heap.
    pub offset: usize,
    pub size: usize,
    pub in_use: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    /// Biggest request that would currently succeed.
    pub largest_free: usize,
}

pub struct KernelHeap {
    start: usize,
    size: usize,
}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self { start: 0, size: 0 }
    }

    /// Establishes one free block spanning `[start, start + size)`.
    ///
    /// # Safety
    /// The range must be mapped, writable, and used by nothing else for as long as the heap
    /// lives.
    pub unsafe fn init(&mut self, start: usize, size: usize) {
        let aligned = align_up(start, HEAP_ALIGN);
        let usable = size.saturating_sub(aligned - start) & !(HEAP_ALIGN - 1);

        self.start = aligned;
        self.size = if usable >= MIN_BLOCK { usable } else { 0 };
        if self.size > 0 {
            self.write_header(aligned, self.size, TAG_FREE);
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// First-fit allocation of `size` bytes, 16-byte aligned.
    pub fn alloc(&mut self, size: usize) -> Result<HeapHandle, HeapError> {
        let needed = size
            .max(1)
            .checked_add(HEADER_SIZE + HEAP_ALIGN - 1)
            .ok_or(HeapError::OutOfMemory)?
            & !(HEAP_ALIGN - 1);

        let mut addr = self.start;
        while addr < self.end() {
            let (block_size, used) = self.read_header(addr);
            if !used && block_size >= needed {
                if block_size - needed >= MIN_BLOCK {
                    self.write_header(addr + needed, block_size - needed, TAG_FREE);
                    self.write_header(addr, needed, TAG_USED);
                } else {
                    self.write_header(addr, block_size, TAG_USED);
                }
                return Ok(HeapHandle(addr + HEADER_SIZE));
            }
            addr += block_size;
        }

        Err(HeapError::OutOfMemory)
    }

    /// Zeroed allocation of `count * size` bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<HeapHandle, HeapError> {
        let bytes = count.checked_mul(size).ok_or(HeapError::Overflow)?;
        let handle = self.alloc(bytes)?;
        unsafe { ptr::write_bytes(handle.as_ptr(), 0, bytes) };
        Ok(handle)
    }

    /// Releases an allocation and merges it with free neighbours.
    ///
    /// The handle is looked up by walking the block list, so a pointer that never came
    /// from `alloc`, or one that was already freed, is reported instead of trusted.
    pub fn free(&mut self, handle: HeapHandle) -> Result<(), HeapError> {
        let target = handle
            .0
            .checked_sub(HEADER_SIZE)
            .filter(|&addr| addr >= self.start && addr < self.end())
            .ok_or(HeapError::InvalidFree(handle.0))?;

        let mut prev: Option<usize> = None;
        let mut addr = self.start;
        while addr < target {
            prev = Some(addr);
            addr += self.read_header(addr).0;
        }

        // an interior pointer of the last block walks off the end
        if addr != target {
            return Err(HeapError::InvalidFree(handle.0));
        }
        let (mut size, used) = self.read_header(addr);
        if !used {
            return Err(HeapError::InvalidFree(handle.0));
        }

        let mut block = addr;
        let next = addr + size;
        if next < self.end() {
            let (next_size, next_used) = self.read_header(next);
            if !next_used {
                size += next_size;
                self.clear_header(next);
            }
        }
        if let Some(prev) = prev {
            let (prev_size, prev_used) = self.read_header(prev);
            if !prev_used {
                self.clear_header(block);
                block = prev;
                size += prev_size;
            }
        }

        self.write_header(block, size, TAG_FREE);
        Ok(())
    }

    /// Walks the block list in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            addr: self.start,
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            total: self.size,
            ..HeapStats::default()
        };
        for block in self.blocks() {
            stats.blocks += 1;
            if block.in_use {
                stats.used += block.size;
            } else {
                stats.free += block.size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.size - HEADER_SIZE);
            }
        }
        stats
    }

    fn alloc_layout(&mut self, layout: Layout) -> Result<HeapHandle, HeapError> {
        if layout.align() <= HEAP_ALIGN {
            return self.alloc(layout.size());
        }

        // over-allocate and stash the real handle just below the aligned address
        let padded = layout
            .size()
            .checked_add(layout.align())
            .ok_or(HeapError::Overflow)?;
        let handle = self.alloc(padded)?;
        let aligned = align_up(handle.0 + 1, layout.align());
        unsafe { ((aligned - mem::size_of::<usize>()) as *mut usize).write(handle.0) };
        Ok(HeapHandle(aligned))
    }

    fn free_layout(&mut self, ptr: *mut u8, layout: Layout) -> Result<(), HeapError> {
        if layout.align() <= HEAP_ALIGN {
            return self.free(HeapHandle(ptr as usize));
        }

        let stash = (ptr as usize)
            .checked_sub(mem::size_of::<usize>())
            .filter(|&addr| addr >= self.start && addr < self.end())
            .ok_or(HeapError::InvalidFree(ptr as usize))?;
        let original = unsafe { (stash as *const usize).read() };
        self.free(HeapHandle(original))
    }

    fn end(&self) -> usize {
        self.start + self.size
    }

    fn read_header(&self, addr: usize) -> (usize, bool) {
        let header = unsafe { &*(addr as *const BlockHeader) };
        let used = match header.tag {
            TAG_USED => true,
            TAG_FREE => false,
            tag => panic!("Heap corruption: block at {:#x} has tag {:#x}", addr, tag),
        };
        if header.size < MIN_BLOCK || addr + header.size > self.end() {
            panic!(
                "Heap corruption: block at {:#x} claims size {:#x}",
                addr, header.size
            );
        }
        (header.size, used)
    }

    fn write_header(&mut self, addr: usize, size: usize, tag: usize) {
        unsafe { (addr as *mut BlockHeader).write(BlockHeader { size, tag }) };
    }

    fn clear_header(&mut self, addr: usize) {
        unsafe { (addr as *mut BlockHeader).write(BlockHeader { size: 0, tag: 0 }) };
    }
}

pub struct Blocks<'a> {
    heap: &'a KernelHeap,
    addr: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.addr >= self.heap.end() {
            return None;
        }
        let (size, in_use) = self.heap.read_header(self.addr);
        let info = BlockInfo {
            offset: self.addr - self.heap.start,
            size,
            in_use,
        };
        self.addr += size;
        Some(info)
    }
}

/// Interrupt-safe, lock-protected heap.
pub struct LockedHeap(Mutex<KernelHeap>);

impl LockedHeap {
    pub const fn empty() -> Self {
        Self(Mutex::new(KernelHeap::empty()))
    }

    /// # Safety
    /// See [`KernelHeap::init`].
    pub unsafe fn init(&self, start: usize, size: usize) {
        cpu::without_interrupts(|| self.0.lock().init(start, size))
    }

    /// Runs `f` on the heap with interrupts masked.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut KernelHeap) -> R,
    {
        cpu::without_interrupts(|| f(&mut self.0.lock()))
    }

    pub fn alloc(&self, size: usize) -> Result<HeapHandle, HeapError> {
        self.with(|heap| heap.alloc(size))
    }

    pub fn calloc(&self, count: usize, size: usize) -> Result<HeapHandle, HeapError> {
        self.with(|heap| heap.calloc(count, size))
    }

    pub fn free(&self, handle: HeapHandle) -> Result<(), HeapError> {
        self.with(|heap| heap.free(handle))
    }

    pub fn stats(&self) -> HeapStats {
        self.with(|heap| heap.stats())
    }

    /// Direct access for callers that already run with interrupts masked.
    pub fn lock(&self) -> MutexGuard<'_, KernelHeap> {
        self.0.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with(|heap| heap.alloc_layout(layout))
            .map_or(null_mut(), HeapHandle::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Err(err) = self.with(|heap| heap.free_layout(ptr, layout)) {
            panic!("{}", err);
        }
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
pub static HEAP: LockedHeap = LockedHeap::empty();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::HeapArena;
    use alloc::vec::Vec;

    const ARENA: usize = 64 * 1024;

    fn heap_over(arena: &HeapArena) -> KernelHeap {
        let mut heap = KernelHeap::empty();
        unsafe { heap.init(arena.start(), arena.size()) };
        heap
    }

    fn layout(heap: &KernelHeap) -> Vec<BlockInfo> {
        heap.blocks().collect()
    }

    #[test]
    fn test_init_creates_one_free_block() {
        let arena = HeapArena::new(ARENA);
        let heap = heap_over(&arena);

        assert_eq!(
            layout(&heap),
            [BlockInfo {
                offset: 0,
                size: ARENA,
                in_use: false
            }]
        );
        assert_eq!(heap.stats().largest_free, ARENA - HEADER_SIZE);
    }

    #[test]
    fn test_alloc_free_restores_layout() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);
        let keep = heap.alloc(100).unwrap();
        let before = layout(&heap);

        for size in [1, 16, 17, 500, 4096] {
            let handle = heap.alloc(size).unwrap();
            heap.free(handle).unwrap();
            assert_eq!(layout(&heap), before);
        }
        heap.free(keep).unwrap();
    }

    #[test]
    fn test_live_allocations_never_overlap() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for i in 0..120usize {
            let size = 8 + (i * 37) % 300;
            if i % 4 == 3 {
                let (addr, _) = live.remove(i % live.len());
                heap.free(HeapHandle(addr)).unwrap();
            }
            let handle = heap.alloc(size).unwrap();
            assert_eq!(handle.addr() % HEAP_ALIGN, 0);
            for &(addr, len) in &live {
                let disjoint = handle.addr() + size <= addr || addr + len <= handle.addr();
                assert!(disjoint, "{:#x} overlaps {:#x}", handle.addr(), addr);
            }
            live.push((handle.addr(), size));
        }

        // blocks tile the heap exactly
        let total: usize = heap.blocks().map(|b| b.size).sum();
        assert_eq!(total, heap.size());
    }

    #[test]
    fn test_first_fit_reuses_lowest_hole() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);

        let a = heap.alloc(64).unwrap();
        let _b = heap.alloc(64).unwrap();
        let c = heap.alloc(64).unwrap();
        let _d = heap.alloc(64).unwrap();
        heap.free(c).unwrap();
        heap.free(a).unwrap();

        assert_eq!(heap.alloc(48).unwrap(), a);
        assert_eq!(heap.alloc(48).unwrap(), c);
    }

    #[test]
    fn test_free_coalesces_both_neighbours() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);

        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let c = heap.alloc(64).unwrap();
        let guard = heap.alloc(64).unwrap();

        heap.free(a).unwrap();
        heap.free(c).unwrap();
        assert_eq!(heap.stats().free_blocks, 3);

        heap.free(b).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.blocks, 3);
        assert_eq!(layout(&heap)[0].size, 3 * (64 + HEADER_SIZE));

        heap.free(guard).unwrap();
        assert_eq!(heap.stats().blocks, 1);
    }

    #[test]
    fn test_invalid_and_double_free() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);
        let handle = heap.alloc(32).unwrap();

        let interior = HeapHandle(handle.addr() + 16);
        assert_eq!(heap.free(interior), Err(HeapError::InvalidFree(interior.addr())));
        assert_eq!(heap.free(HeapHandle(8)), Err(HeapError::InvalidFree(8)));

        heap.free(handle).unwrap();
        let err = heap.free(handle).unwrap_err();
        assert_eq!(err, HeapError::InvalidFree(handle.addr()));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_interior_pointer_of_last_block_is_rejected() {
        let arena = HeapArena::new(4096);
        let mut heap = heap_over(&arena);
        let handle = heap.alloc(4096 - HEADER_SIZE).unwrap();
        assert_eq!(heap.stats().free_blocks, 0);

        let interior = HeapHandle(handle.addr() + 16);
        assert_eq!(heap.free(interior), Err(HeapError::InvalidFree(interior.addr())));
        heap.free(handle).unwrap();
    }

    #[test]
    fn test_out_of_memory_leaves_heap_untouched() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);
        let _small = heap.alloc(128).unwrap();
        let before = layout(&heap);

        assert_eq!(heap.alloc(ARENA), Err(HeapError::OutOfMemory));
        assert_eq!(heap.alloc(usize::MAX), Err(HeapError::OutOfMemory));
        assert_eq!(layout(&heap), before);
    }

    #[test]
    fn test_calloc_zeroes_and_checks_overflow() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);

        // dirty a block, release it, then calloc over the same bytes
        let dirty = heap.alloc(640).unwrap();
        unsafe { ptr::write_bytes(dirty.as_ptr(), 0xAB, 640) };
        heap.free(dirty).unwrap();

        let handle = heap.calloc(10, 64).unwrap();
        assert_eq!(handle, dirty);
        let bytes = unsafe { core::slice::from_raw_parts(handle.as_ptr(), 640) };
        assert!(bytes.iter().all(|&b| b == 0));

        let before = layout(&heap);
        assert_eq!(heap.calloc(usize::MAX, 2), Err(HeapError::Overflow));
        assert_eq!(layout(&heap), before);
    }

    #[test]
    fn test_global_alloc_honours_large_alignment() {
        let arena = HeapArena::new(ARENA);
        let locked = LockedHeap::empty();
        unsafe { locked.init(arena.start(), arena.size()) };

        let layout = Layout::from_size_align(200, 256).unwrap();
        let ptr = unsafe { GlobalAlloc::alloc(&locked, layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 256, 0);

        unsafe { GlobalAlloc::dealloc(&locked, ptr, layout) };
        assert_eq!(locked.stats().blocks, 1);
    }

    #[test]
    fn test_stats_account_for_every_byte() {
        let arena = HeapArena::new(ARENA);
        let mut heap = heap_over(&arena);
        let _a = heap.alloc(1000).unwrap();
        let _b = heap.calloc(4, 4).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.used + stats.free, stats.total);
        assert_eq!(stats.used, align_up(1000, 16) + HEADER_SIZE + 16 + HEADER_SIZE);
    }
}
