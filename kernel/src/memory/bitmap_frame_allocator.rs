//! Physical frame allocator
//!
//! - Tracks every 4 KiB frame below `MAX_PHYS_MEMORY` in a fixed bitmap (1 = used)
//! - Allocation is next-fit: the cursor resumes after the last frame handed out
//! - Frames are referred to by index; `FrameId(n)` starts at physical `n * FRAME_SIZE`

use core::fmt;

use log::{debug, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::constants::memory::{
    BITMAP_ENTRIES, BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_FRAMES,
};

/// Index of a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

impl FrameId {
    pub fn start_address(self) -> PhysAddr {
        PhysAddr::new((self.0 * FRAME_SIZE) as u64)
    }

    pub fn as_phys_frame(self) -> PhysFrame {
        PhysFrame::containing_address(self.start_address())
    }

    pub fn from_phys_frame(frame: PhysFrame) -> Self {
        FrameId(frame.start_address().as_u64() as usize / FRAME_SIZE)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame #{} ({:#x})", self.0, self.start_address().as_u64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    KernelImage,
}

/// One entry of the boot memory map, already translated out of the bootloader's format.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    OutOfMemory,
    DoubleFree(FrameId),
    OutOfRange(FrameId),
}

impl FrameError {
    /// DoubleFree and OutOfRange mean the caller lost track of frame ownership.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::OutOfMemory)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::OutOfMemory => write!(f, "Out of physical frames"),
            FrameError::DoubleFree(id) => write!(f, "Double free of {}", id),
            FrameError::OutOfRange(id) => write!(f, "{} is not tracked by the allocator", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    next: usize,
    bitmap: [u64; BITMAP_ENTRIES],
}

impl BitmapFrameAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// Usable regions are released first, then every reserved or kernel-image region is
    /// marked used again, so an overlap always resolves to "used".
    pub fn init(memory_map: &[MemoryRegion]) -> Self {
        let mut top: u64 = 0;
        for region in memory_map.iter().filter(|r| r.kind == RegionKind::Usable) {
            top = top.max(region.end());
        }

        let mut total_frames = (top as usize).div_ceil(FRAME_SIZE);
        if total_frames > MAX_FRAMES {
            warn!(
                "Ignoring {} frames above the tracked physical limit",
                total_frames - MAX_FRAMES
            );
            total_frames = MAX_FRAMES;
        }

        let mut allocator = Self {
            total_frames,
            free_frames: 0,
            next: 0,
            bitmap: [FULL_BITMAP_ENTRY; BITMAP_ENTRIES],
        };

        for region in memory_map.iter().filter(|r| r.kind == RegionKind::Usable) {
            // only frames lying entirely inside the region are usable
            let start = (region.base as usize).div_ceil(FRAME_SIZE);
            let end = (region.end() as usize / FRAME_SIZE).min(total_frames);
            for index in start..end {
                allocator.clear_bit(index);
            }
        }

        for region in memory_map.iter().filter(|r| r.kind != RegionKind::Usable) {
            let start = region.base as usize / FRAME_SIZE;
            let end = (region.end() as usize).div_ceil(FRAME_SIZE).min(total_frames);
            for index in start..end {
                allocator.set_bit(index);
            }
        }

        allocator.free_frames = (0..total_frames)
            .filter(|&index| !allocator.is_bit_set(index))
            .count();

        debug!(
            "Frame allocator tracks {} frames, {} free",
            allocator.total_frames, allocator.free_frames
        );

        allocator
    }

    /// Hands out one free frame and marks it used.
    pub fn allocate(&mut self) -> Result<FrameId, FrameError> {
        if self.free_frames == 0 {
            return Err(FrameError::OutOfMemory);
        }

        let mut scanned = 0;
        while scanned < self.total_frames {
            let index = self.next;

            // skip whole words with no free frame in them
            if self.bitmap[index / BITMAP_ENTRY_SIZE] == FULL_BITMAP_ENTRY {
                // padding bits past the last frame do not count as scanned
                let skip = (BITMAP_ENTRY_SIZE - index % BITMAP_ENTRY_SIZE)
                    .min(self.total_frames - index);
                self.advance(skip);
                scanned += skip;
                continue;
            }

            self.advance(1);
            scanned += 1;

            if !self.is_bit_set(index) {
                self.set_bit(index);
                self.free_frames -= 1;
                return Ok(FrameId(index));
            }
        }

        Err(FrameError::OutOfMemory)
    }

    /// Returns a used frame to the pool.
    pub fn free(&mut self, id: FrameId) -> Result<(), FrameError> {
        if id.0 >= self.total_frames {
            return Err(FrameError::OutOfRange(id));
        }
        if !self.is_bit_set(id.0) {
            return Err(FrameError::DoubleFree(id));
        }

        self.clear_bit(id.0);
        self.free_frames += 1;
        Ok(())
    }

    /// Check if frame is used
    pub fn is_used(&self, id: FrameId) -> bool {
        id.0 >= self.total_frames || self.is_bit_set(id.0)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total_frames,
            free: self.free_frames,
            used: self.used_frames(),
        }
    }

    fn advance(&mut self, frames: usize) {
        self.next += frames;
        if self.next >= self.total_frames {
            self.next = 0;
        }
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        self.bitmap[frame_index / BITMAP_ENTRY_SIZE] |= mask;
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        self.bitmap[frame_index / BITMAP_ENTRY_SIZE] &= !mask;
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        (self.bitmap[frame_index / BITMAP_ENTRY_SIZE] & mask) != 0
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.allocate().ok().map(FrameId::as_phys_frame)
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        if let Err(err) = self.free(FrameId::from_phys_frame(frame)) {
            panic!("{}", err);
        }
    }
}
