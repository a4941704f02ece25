//! Virtual memory manager.
//!
//! Page tables are edited through the `x86_64` crate's `OffsetPageTable`, reaching every
//! physical frame through the direct-map window at `phys_offset`. Intermediate tables are
//! drawn from the frame allocator through a recorder, so the address space that caused
//! the allocation owns them.

use core::fmt;

use log::{debug, info};
use x86_64::{
    structures::paging::{
        mapper::{MapToError, TranslateResult, UnmapError},
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
        Size4KiB, Translate,
    },
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{KERNEL_PML4_START, PAGE_SIZE, PML4_ENTRIES},
    cpu,
    memory::{
        address_space::{AddressSpace, SpaceKind, KERNEL_DATA},
        bitmap_frame_allocator::{BitmapFrameAllocator, FrameError, FrameId},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    OutOfMemory,
    AlreadyMapped(Page<Size4KiB>),
    NotMapped(Page<Size4KiB>),
    /// The page lies in the half of the address space this space may not map.
    OutOfRange(Page<Size4KiB>),
    AlreadyEnabled,
    /// Tried to tear down the address space that is currently loaded.
    ActiveSpace,
    Frame(FrameError),
}

impl VmmError {
    pub fn is_fatal(&self) -> bool {
        match self {
            VmmError::OutOfMemory => false,
            VmmError::Frame(err) => err.is_fatal(),
            _ => true,
        }
    }
}

impl From<FrameError> for VmmError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::OutOfMemory => VmmError::OutOfMemory,
            other => VmmError::Frame(other),
        }
    }
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmError::OutOfMemory => write!(f, "Out of frames for page tables"),
            VmmError::AlreadyMapped(page) => {
                write!(f, "Page {:#x} is already mapped", page.start_address())
            }
            VmmError::NotMapped(page) => write!(f, "Page {:#x} is not mapped", page.start_address()),
            VmmError::OutOfRange(page) => write!(
                f,
                "Page {:#x} is outside this address space's half",
                page.start_address()
            ),
            VmmError::AlreadyEnabled => write!(f, "Paging was already enabled"),
            VmmError::ActiveSpace => write!(f, "Cannot destroy the active address space"),
            VmmError::Frame(err) => write!(f, "{}", err),
        }
    }
}

/// Hands intermediate-table frames to the mapper and remembers which ones it gave out.
struct TableRecorder<'a> {
    frames: &'a mut BitmapFrameAllocator,
    tables: &'a mut alloc::vec::Vec<FrameId>,
}

unsafe impl FrameAllocator<Size4KiB> for TableRecorder<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.frames.allocate().ok()?;
        self.tables.push(frame);
        Some(frame.as_phys_frame())
    }
}

pub struct Vmm {
    phys_offset: VirtAddr,
    kernel: AddressSpace,
    active_root: Option<FrameId>,
    paging_enabled: bool,
}

impl Vmm {
    /// Builds the kernel address space.
    ///
    /// When `boot_root` is given, its higher half (kernel image and direct map set up by
    /// the bootloader) is copied into the new root so the kernel keeps running after
    /// `enable`.
    pub fn new(
        phys_offset: VirtAddr,
        boot_root: Option<PhysFrame>,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<Self, VmmError> {
        let root = frames.allocate()?;
        let vmm = Self {
            phys_offset,
            kernel: AddressSpace::new(SpaceKind::Kernel, root),
            active_root: None,
            paging_enabled: false,
        };

        unsafe {
            let table = &mut *vmm.table_ptr(root);
            table.zero();
            if let Some(boot_root) = boot_root {
                let boot = &*vmm.table_ptr(FrameId::from_phys_frame(boot_root));
                for i in KERNEL_PML4_START..PML4_ENTRIES {
                    table[i] = boot[i].clone();
                }
            }
        }

        debug!("Kernel address space root at {}", root);
        Ok(vmm)
    }

    pub fn phys_offset(&self) -> VirtAddr {
        self.phys_offset
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    pub fn active_root(&self) -> Option<FrameId> {
        self.active_root
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    /// Allocates a fresh root table and installs the shared kernel half.
    pub fn create_address_space(
        &self,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<AddressSpace, VmmError> {
        let root = frames.allocate()?;

        unsafe {
            let table = &mut *self.table_ptr(root);
            let kernel = &*self.table_ptr(self.kernel.root());
            table.zero();
            for i in KERNEL_PML4_START..PML4_ENTRIES {
                table[i] = kernel[i].clone();
            }
        }

        Ok(AddressSpace::new(SpaceKind::User, root))
    }

    /// Maps `page` to `frame` in `space`. On success the space owns `frame`.
    pub fn map(
        &mut self,
        space: &mut AddressSpace,
        page: Page<Size4KiB>,
        frame: FrameId,
        flags: PageTableFlags,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<(), VmmError> {
        map_into(self.window(), space, page, frame, flags, frames)
    }

    /// Removes the mapping at `page` and hands its frame back to the caller.
    pub fn unmap(
        &mut self,
        space: &mut AddressSpace,
        page: Page<Size4KiB>,
    ) -> Result<FrameId, VmmError> {
        let frame = space.frame_at(page).ok_or(VmmError::NotMapped(page))?;

        let window = self.window();
        let mut mapper = unsafe { window.mapper(space.root()) };
        match mapper.unmap(page) {
            Ok((_, flush)) => {
                flush.ignore();
                window.invalidate(space.root(), page);
                space.pages.remove(&page);
                Ok(frame)
            }
            Err(UnmapError::PageNotMapped)
            | Err(UnmapError::ParentEntryHugePage)
            | Err(UnmapError::InvalidFrameAddress(_)) => Err(VmmError::NotMapped(page)),
        }
    }

    /// Maps fresh frames over `[start, start + len)` in the kernel address space.
    pub fn map_kernel_region(
        &mut self,
        start: VirtAddr,
        len: usize,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<usize, VmmError> {
        let first = Page::<Size4KiB>::containing_address(start);
        let last = Page::<Size4KiB>::containing_address(start + (len as u64 - 1));

        let window = self.window();
        for page in Page::range_inclusive(first, last) {
            let frame = frames.allocate()?;
            if let Err(err) = map_into(window, &mut self.kernel, page, frame, KERNEL_DATA, frames) {
                frames.free(frame)?;
                return Err(err);
            }
        }

        Ok(Page::range_inclusive(first, last).count())
    }

    /// Physical address and flags `vaddr` resolves to in `space`.
    pub fn translate(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Option<(PhysAddr, PageTableFlags)> {
        let mapper = unsafe { self.window().mapper(space.root()) };
        match mapper.translate(vaddr) {
            TranslateResult::Mapped {
                frame,
                offset,
                flags,
            } => Some((frame.start_address() + offset, flags)),
            _ => None,
        }
    }

    /// Copies `buf.len()` bytes starting at `vaddr` in `space` through the direct map.
    ///
    /// Works whichever address space is loaded, since nothing is read through `vaddr`.
    pub fn read_bytes(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), VmmError> {
        let mut copied = 0;
        while copied < buf.len() {
            let addr = vaddr + copied as u64;
            let (phys, _) = self
                .translate(space, addr)
                .ok_or(VmmError::NotMapped(Page::containing_address(addr)))?;

            let in_page = (PAGE_SIZE - addr.as_u64() % PAGE_SIZE) as usize;
            let step = in_page.min(buf.len() - copied);
            let src = self.phys_to_virt(phys).as_ptr::<u8>();
            unsafe {
                core::ptr::copy_nonoverlapping(src, buf[copied..].as_mut_ptr(), step);
            }
            copied += step;
        }
        Ok(())
    }

    /// Copies `bytes` to `vaddr` in `space` through the direct map.
    pub fn write_bytes(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        bytes: &[u8],
    ) -> Result<(), VmmError> {
        let mut copied = 0;
        while copied < bytes.len() {
            let addr = vaddr + copied as u64;
            let (phys, _) = self
                .translate(space, addr)
                .ok_or(VmmError::NotMapped(Page::containing_address(addr)))?;

            let in_page = (PAGE_SIZE - addr.as_u64() % PAGE_SIZE) as usize;
            let step = in_page.min(bytes.len() - copied);
            let dst = self.phys_to_virt(phys).as_mut_ptr::<u8>();
            unsafe {
                core::ptr::copy_nonoverlapping(bytes[copied..].as_ptr(), dst, step);
            }
            copied += step;
        }
        Ok(())
    }

    /// Returns every frame owned by `space` to the allocator.
    ///
    /// # Returns
    /// The number of frames released
    pub fn destroy_address_space(
        &mut self,
        space: AddressSpace,
        frames: &mut BitmapFrameAllocator,
    ) -> Result<usize, VmmError> {
        if self.active_root == Some(space.root()) {
            return Err(VmmError::ActiveSpace);
        }

        let mut released = 0;
        for frame in space.owned_frames() {
            frames.free(frame)?;
            released += 1;
        }

        Ok(released)
    }

    /// Loads `space` as the active address space.
    pub(crate) fn switch_to(&mut self, space: &AddressSpace) {
        self.load(space.root());
    }

    pub(crate) fn switch_to_kernel(&mut self) {
        self.load(self.kernel.root());
    }

    /// Loads the kernel root and turns on NX and write protection. One-shot.
    pub fn enable(&mut self) -> Result<(), VmmError> {
        if self.paging_enabled {
            return Err(VmmError::AlreadyEnabled);
        }

        cpu::load_root(self.kernel.root().as_phys_frame());
        cpu::enable_paging_features();
        self.active_root = Some(self.kernel.root());
        self.paging_enabled = true;

        info!("Paging enabled, kernel root at {}", self.kernel.root());
        Ok(())
    }

    fn load(&mut self, root: FrameId) {
        if self.active_root != Some(root) {
            cpu::load_root(root.as_phys_frame());
            self.active_root = Some(root);
        }
    }

    pub fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        self.phys_offset + phys.as_u64()
    }

    fn table_ptr(&self, frame: FrameId) -> *mut PageTable {
        self.window().table_ptr(frame)
    }

    fn window(&self) -> Window {
        Window {
            phys_offset: self.phys_offset,
            active_root: self.active_root,
        }
    }
}

/// The pieces of `Vmm` page-table edits need, copied out so an address space owned by the
/// `Vmm` itself can be borrowed mutably at the same time.
#[derive(Clone, Copy)]
struct Window {
    phys_offset: VirtAddr,
    active_root: Option<FrameId>,
}

impl Window {
    fn table_ptr(&self, frame: FrameId) -> *mut PageTable {
        (self.phys_offset + frame.start_address().as_u64()).as_mut_ptr()
    }

    /// # Safety
    ///
    /// `root` must be a page table owned by an address space of this `Vmm`, and no other
    /// mapper for it may be alive.
    unsafe fn mapper(&self, root: FrameId) -> OffsetPageTable<'static> {
        OffsetPageTable::new(&mut *self.table_ptr(root), self.phys_offset)
    }

    fn invalidate(&self, root: FrameId, page: Page<Size4KiB>) {
        if self.active_root == Some(root) {
            cpu::invalidate_page(page.start_address());
        }
    }
}

fn map_into(
    window: Window,
    space: &mut AddressSpace,
    page: Page<Size4KiB>,
    frame: FrameId,
    flags: PageTableFlags,
    frames: &mut BitmapFrameAllocator,
) -> Result<(), VmmError> {
    if !space.accepts(page) {
        return Err(VmmError::OutOfRange(page));
    }
    if space.pages.contains_key(&page) {
        return Err(VmmError::AlreadyMapped(page));
    }

    let mut mapper = unsafe { window.mapper(space.root()) };
    let mut recorder = TableRecorder {
        frames,
        tables: &mut space.tables,
    };

    let result = unsafe {
        mapper.map_to(
            page,
            frame.as_phys_frame(),
            flags | PageTableFlags::PRESENT,
            &mut recorder,
        )
    };

    match result {
        Ok(flush) => {
            flush.ignore();
            window.invalidate(space.root(), page);
            space.pages.insert(page, frame);
            Ok(())
        }
        Err(MapToError::FrameAllocationFailed) => Err(VmmError::OutOfMemory),
        Err(MapToError::PageAlreadyMapped(_)) | Err(MapToError::ParentEntryHugePage) => {
            Err(VmmError::AlreadyMapped(page))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{address_space::USER_DATA, test_support::PhysArena};
    use alloc::vec::Vec;

    fn user_page(n: u64) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(0x4000_0000 + n * PAGE_SIZE))
    }

    #[test]
    fn test_map_then_unmap_returns_same_frame() {
        let arena = PhysArena::new(128);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let mut space = vmm.create_address_space(&mut frames).unwrap();

        let frames_to_map: Vec<FrameId> = (0..6).map(|_| frames.allocate().unwrap()).collect();
        for (i, &frame) in frames_to_map.iter().enumerate() {
            vmm.map(&mut space, user_page(i as u64 * 300), frame, USER_DATA, &mut frames)
                .unwrap();
        }
        for (i, &frame) in frames_to_map.iter().enumerate() {
            assert_eq!(vmm.unmap(&mut space, user_page(i as u64 * 300)), Ok(frame));
        }
        assert_eq!(space.mapping_count(), 0);
    }

    #[test]
    fn test_translate_and_copy_through_direct_map() {
        let arena = PhysArena::new(64);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let mut space = vmm.create_address_space(&mut frames).unwrap();

        let a = frames.allocate().unwrap();
        let b = frames.allocate().unwrap();
        vmm.map(&mut space, user_page(0), a, USER_DATA, &mut frames).unwrap();
        vmm.map(&mut space, user_page(1), b, USER_DATA, &mut frames).unwrap();

        let addr = user_page(0).start_address() + 0xff0u64;
        let (phys, flags) = vmm.translate(&space, addr).unwrap();
        assert_eq!(phys, a.start_address() + 0xff0u64);
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));

        // straddles the page boundary
        vmm.write_bytes(&space, addr, b"across two frames").unwrap();
        let mut buf = [0u8; 17];
        vmm.read_bytes(&space, addr, &mut buf).unwrap();
        assert_eq!(&buf, b"across two frames");

        let unmapped = user_page(2).start_address();
        assert_eq!(vmm.translate(&space, unmapped), None);
        assert_eq!(
            vmm.read_bytes(&space, unmapped, &mut buf),
            Err(VmmError::NotMapped(user_page(2)))
        );
    }

    #[test]
    fn test_double_map_and_missing_unmap() {
        let arena = PhysArena::new(64);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let mut space = vmm.create_address_space(&mut frames).unwrap();

        let frame = frames.allocate().unwrap();
        let other = frames.allocate().unwrap();
        vmm.map(&mut space, user_page(3), frame, USER_DATA, &mut frames).unwrap();

        let err = vmm
            .map(&mut space, user_page(3), other, USER_DATA, &mut frames)
            .unwrap_err();
        assert_eq!(err, VmmError::AlreadyMapped(user_page(3)));
        assert!(err.is_fatal());

        let err = vmm.unmap(&mut space, user_page(4)).unwrap_err();
        assert_eq!(err, VmmError::NotMapped(user_page(4)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_user_space_rejects_kernel_half() {
        let arena = PhysArena::new(64);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let mut space = vmm.create_address_space(&mut frames).unwrap();

        let page = Page::containing_address(VirtAddr::new(0xFFFF_8000_0000_0000));
        let frame = frames.allocate().unwrap();
        assert_eq!(
            vmm.map(&mut space, page, frame, USER_DATA, &mut frames),
            Err(VmmError::OutOfRange(page))
        );
    }

    #[test]
    fn test_kernel_half_is_shared_with_new_spaces() {
        let arena = PhysArena::new(128);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();

        let start = VirtAddr::new(0xFFFF_FFFF_0000_0000);
        assert_eq!(vmm.map_kernel_region(start, 3 * PAGE_SIZE as usize, &mut frames), Ok(3));

        let space = vmm.create_address_space(&mut frames).unwrap();
        let (kernel_phys, _) = vmm.translate(vmm.kernel_space(), start).unwrap();
        let (user_phys, flags) = vmm.translate(&space, start).unwrap();
        assert_eq!(kernel_phys, user_phys);
        assert!(!flags.contains(PageTableFlags::USER_ACCESSIBLE));

        // shared tables are not owned by the process space
        assert_eq!(space.frame_count(), 1);
    }

    #[test]
    fn test_out_of_memory_while_building_tables() {
        // root for the kernel, root for the space, and two spare frames
        let arena = PhysArena::new(4);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let mut space = vmm.create_address_space(&mut frames).unwrap();
        let leaf = frames.allocate().unwrap();

        // three intermediate tables are needed, only one frame is left
        assert_eq!(
            vmm.map(&mut space, user_page(0), leaf, USER_DATA, &mut frames),
            Err(VmmError::OutOfMemory)
        );
        assert_eq!(space.mapping_count(), 0);

        // the partially built table is still owned and comes back on teardown
        frames.free(leaf).unwrap();
        let released = vmm.destroy_address_space(space, &mut frames).unwrap();
        assert_eq!(released, 2);
        assert_eq!(frames.used_frames(), 1);
    }

    #[test]
    fn test_destroy_returns_every_owned_frame() {
        let arena = PhysArena::new(128);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let baseline = frames.used_frames();

        let mut space = vmm.create_address_space(&mut frames).unwrap();
        for i in 0..4 {
            let frame = frames.allocate().unwrap();
            vmm.map(&mut space, user_page(i * 600), frame, USER_DATA, &mut frames)
                .unwrap();
        }
        let owned: Vec<FrameId> = space.owned_frames().collect();
        assert_eq!(owned.len(), space.frame_count());
        assert_eq!(frames.used_frames(), baseline + owned.len());

        let released = vmm.destroy_address_space(space, &mut frames).unwrap();
        assert_eq!(released, owned.len());
        assert_eq!(frames.used_frames(), baseline);
        assert!(owned.iter().all(|&f| !frames.is_used(f)));
    }

    #[test]
    fn test_active_space_cannot_be_destroyed() {
        let arena = PhysArena::new(64);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let space = vmm.create_address_space(&mut frames).unwrap();

        vmm.enable().unwrap();
        vmm.switch_to(&space);
        assert_eq!(vmm.active_root(), Some(space.root()));
        assert_eq!(
            vmm.destroy_address_space(space, &mut frames),
            Err(VmmError::ActiveSpace)
        );
    }

    #[test]
    fn test_enable_is_one_shot() {
        let arena = PhysArena::new(16);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();

        assert!(!vmm.paging_enabled());
        vmm.enable().unwrap();
        assert_eq!(vmm.active_root(), Some(vmm.kernel_space().root()));
        assert_eq!(vmm.enable(), Err(VmmError::AlreadyEnabled));
    }
}
