pub mod address_space;
pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;

#[cfg(test)]
pub mod test_support;

pub use address_space::AddressSpace;
pub use bitmap_frame_allocator::{BitmapFrameAllocator, FrameId};
pub use heap::{HeapHandle, KernelHeap, LockedHeap};
pub use paging::Vmm;
