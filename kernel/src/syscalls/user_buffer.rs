//! Caller-supplied buffers.
//!
//! A pointer from a syscall is never dereferenced. It is checked against the caller's
//! address space, then its bytes are copied out through the physical-memory window.

use x86_64::{structures::paging::Page, VirtAddr};

use crate::{
    constants::syscalls::{COPY_CHUNK, MAX_WRITE_LEN},
    memory::{AddressSpace, Vmm},
    syscalls::SyscallError,
};

/// A range in the caller's address space that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBuffer {
    start: VirtAddr,
    len: usize,
}

impl UserBuffer {
    /// Checks that `[ptr, ptr + len)` is non-null, does not wrap, is at most
    /// `MAX_WRITE_LEN` bytes, and lies entirely in present pages of `space`'s own half.
    pub fn validate(
        vmm: &Vmm,
        space: &AddressSpace,
        ptr: u64,
        len: u64,
    ) -> Result<Self, SyscallError> {
        if ptr == 0 || len > MAX_WRITE_LEN as u64 {
            return Err(SyscallError::InvalidArgument);
        }
        let end = ptr.checked_add(len).ok_or(SyscallError::InvalidArgument)?;

        let start = VirtAddr::try_new(ptr).map_err(|_| SyscallError::InvalidArgument)?;
        let buffer = Self {
            start,
            len: len as usize,
        };
        if len == 0 {
            return Ok(buffer);
        }

        let last = VirtAddr::try_new(end - 1).map_err(|_| SyscallError::InvalidArgument)?;
        let first_page = Page::containing_address(start);
        let last_page = Page::containing_address(last);
        for page in Page::range_inclusive(first_page, last_page) {
            if !space.accepts(page) || vmm.translate(space, page.start_address()).is_none() {
                return Err(SyscallError::InvalidArgument);
            }
        }

        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hands the contents to `sink` in pieces of at most `COPY_CHUNK` bytes.
    pub fn copy_chunks<F>(
        &self,
        vmm: &Vmm,
        space: &AddressSpace,
        mut sink: F,
    ) -> Result<(), SyscallError>
    where
        F: FnMut(&[u8]),
    {
        let mut chunk = [0u8; COPY_CHUNK];
        let mut offset = 0;
        while offset < self.len {
            let step = COPY_CHUNK.min(self.len - offset);
            vmm.read_bytes(space, self.start + offset as u64, &mut chunk[..step])
                .map_err(|_| SyscallError::InvalidArgument)?;
            sink(&chunk[..step]);
            offset += step;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::memory::PAGE_SIZE,
        memory::{address_space::USER_DATA, test_support::PhysArena},
    };
    use alloc::vec::Vec;

    const BASE: u64 = 0x4000_0000;

    fn page(n: u64) -> Page {
        Page::containing_address(VirtAddr::new(BASE + n * PAGE_SIZE))
    }

    #[test]
    fn test_validation_rules() {
        let arena = PhysArena::new(64);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let mut space = vmm.create_address_space(&mut frames).unwrap();
        for n in 0..2 {
            let frame = frames.allocate().unwrap();
            vmm.map(&mut space, page(n), frame, USER_DATA, &mut frames).unwrap();
        }

        // spans both pages
        let ok = UserBuffer::validate(&vmm, &space, BASE + 100, PAGE_SIZE).unwrap();
        assert_eq!(ok.len(), PAGE_SIZE as usize);
        assert!(UserBuffer::validate(&vmm, &space, BASE, 0).unwrap().is_empty());

        let invalid = Err(SyscallError::InvalidArgument);
        assert_eq!(UserBuffer::validate(&vmm, &space, 0, 4), invalid);
        assert_eq!(
            UserBuffer::validate(&vmm, &space, BASE, MAX_WRITE_LEN as u64 + 1),
            invalid
        );
        // runs one byte into the unmapped third page
        assert_eq!(
            UserBuffer::validate(&vmm, &space, BASE + PAGE_SIZE + 1, PAGE_SIZE),
            invalid
        );
        // wraps past the top of the address space
        assert_eq!(UserBuffer::validate(&vmm, &space, u64::MAX - 3, 16), invalid);
        // non-canonical
        assert_eq!(UserBuffer::validate(&vmm, &space, 0x0000_8000_0000_0000, 8), invalid);
    }

    #[test]
    fn test_kernel_half_is_off_limits() {
        let arena = PhysArena::new(64);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let kernel_addr = VirtAddr::new(0xFFFF_FFFF_0000_0000);
        vmm.map_kernel_region(kernel_addr, PAGE_SIZE as usize, &mut frames).unwrap();
        let space = vmm.create_address_space(&mut frames).unwrap();

        // present through the shared kernel half, but not the caller's to hand in
        assert!(vmm.translate(&space, kernel_addr).is_some());
        assert_eq!(
            UserBuffer::validate(&vmm, &space, kernel_addr.as_u64(), 8),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn test_copy_in_chunks() {
        let arena = PhysArena::new(64);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        let mut space = vmm.create_address_space(&mut frames).unwrap();
        let frame = frames.allocate().unwrap();
        vmm.map(&mut space, page(0), frame, USER_DATA, &mut frames).unwrap();

        let message: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        vmm.write_bytes(&space, VirtAddr::new(BASE), &message).unwrap();

        let buffer = UserBuffer::validate(&vmm, &space, BASE, message.len() as u64).unwrap();
        let mut sizes = Vec::new();
        let mut copied = Vec::new();
        buffer
            .copy_chunks(&vmm, &space, |chunk| {
                sizes.push(chunk.len());
                copied.extend_from_slice(chunk);
            })
            .unwrap();

        assert_eq!(sizes, [COPY_CHUNK, COPY_CHUNK, 600 - 2 * COPY_CHUNK]);
        assert_eq!(copied, message);
    }
}
