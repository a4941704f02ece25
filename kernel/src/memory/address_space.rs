//! Address spaces as owned sets of frames.
//!
//! An `AddressSpace` never touches page-table memory itself; `Vmm` does. It only records
//! which frames belong to it: the root table, every intermediate table allocated while
//! mapping into it, and every leaf frame currently mapped. The higher half copied in from
//! the kernel root is shared and never appears here.

use alloc::{collections::BTreeMap, vec::Vec};
use x86_64::structures::paging::{Page, PageTableFlags, Size4KiB};

use crate::memory::bitmap_frame_allocator::FrameId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// Read-write, never executable, reachable from ring 3.
pub const USER_DATA: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE)
    .union(PageTableFlags::NO_EXECUTE);

/// Read-write kernel data, never executable.
pub const KERNEL_DATA: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::NO_EXECUTE);

#[derive(Debug)]
pub struct AddressSpace {
    kind: SpaceKind,
    root: FrameId,
    pub(super) tables: Vec<FrameId>,
    pub(super) pages: BTreeMap<Page<Size4KiB>, FrameId>,
}

impl AddressSpace {
    pub(super) fn new(kind: SpaceKind, root: FrameId) -> Self {
        Self {
            kind,
            root,
            tables: Vec::new(),
            pages: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Frame holding the PML4.
    pub fn root(&self) -> FrameId {
        self.root
    }

    /// Frame currently mapped at `page` by this space, if any.
    pub fn frame_at(&self, page: Page<Size4KiB>) -> Option<FrameId> {
        self.pages.get(&page).copied()
    }

    pub fn mapping_count(&self) -> usize {
        self.pages.len()
    }

    /// Every frame this space would hand back on teardown.
    pub fn owned_frames(&self) -> impl Iterator<Item = FrameId> + '_ {
        core::iter::once(self.root)
            .chain(self.tables.iter().copied())
            .chain(self.pages.values().copied())
    }

    pub fn frame_count(&self) -> usize {
        1 + self.tables.len() + self.pages.len()
    }

    /// Whether `page` lies in the half of the address space this kind may map.
    pub fn accepts(&self, page: Page<Size4KiB>) -> bool {
        let kernel_half = usize::from(page.p4_index())
            >= crate::constants::memory::KERNEL_PML4_START;
        match self.kind {
            SpaceKind::Kernel => kernel_half,
            SpaceKind::User => !kernel_half,
        }
    }
}
