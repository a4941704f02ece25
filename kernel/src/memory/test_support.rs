//! Simulated physical memory for host tests.
//!
//! Frame `n` lives at byte `n * FRAME_SIZE` of a page-aligned arena, and the arena's base
//! address plays the part of the higher-half direct map offset.

use alloc::{boxed::Box, vec, vec::Vec};
use x86_64::VirtAddr;

use crate::{
    constants::memory::FRAME_SIZE,
    memory::bitmap_frame_allocator::{BitmapFrameAllocator, MemoryRegion, RegionKind},
};

#[derive(Clone)]
#[repr(C, align(4096))]
struct RawFrame([u8; FRAME_SIZE]);

pub struct PhysArena {
    frames: Vec<RawFrame>,
    base: VirtAddr,
}

impl PhysArena {
    pub fn new(frame_count: usize) -> Self {
        let mut frames = vec![RawFrame([0; FRAME_SIZE]); frame_count];
        let base = VirtAddr::from_ptr(frames.as_mut_ptr());
        Self { frames, base }
    }

    pub fn phys_offset(&self) -> VirtAddr {
        self.base
    }

    pub fn memory_map(&self) -> [MemoryRegion; 1] {
        [MemoryRegion::new(
            0,
            (self.frames.len() * FRAME_SIZE) as u64,
            RegionKind::Usable,
        )]
    }

    pub fn frame_allocator(&self) -> Box<BitmapFrameAllocator> {
        Box::new(BitmapFrameAllocator::init(&self.memory_map()))
    }
}

#[derive(Clone)]
#[repr(C, align(16))]
struct Chunk([u8; 16]);

/// A 16-byte aligned byte region standing in for the mapped heap range.
pub struct HeapArena {
    chunks: Vec<Chunk>,
    start: usize,
}

impl HeapArena {
    pub fn new(size: usize) -> Self {
        let mut chunks = vec![Chunk([0; 16]); size / 16];
        let start = chunks.as_mut_ptr() as usize;
        Self { chunks, start }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn size(&self) -> usize {
        self.chunks.len() * 16
    }
}
