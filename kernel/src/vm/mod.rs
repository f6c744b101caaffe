// SPDX-License-Identifier: MPL-2.0

//! Virtual memory (VM).
//!
//! The IPC subsystem does not manage page tables or physical frames itself.
//! Shared-memory segments obtain their backing pages from a [`FrameAllocator`]
//! and are mapped into a task through its [`AddressSpace`], both provided by
//! the embedding kernel.

pub mod perms;
pub mod shared_mem;

use crate::prelude::*;

/// A virtual address.
pub type Vaddr = usize;

/// The page size of the platform.
pub const PAGE_SIZE: usize = 4096;

/// Reads and writes bytes of a memory object.
pub trait VmIo: Send + Sync {
    /// Reads `buf.len()` bytes at `offset`.
    ///
    /// # No short reads
    ///
    /// If the requested range is only partially available, the method returns an error
    /// and the content of `buf` is unspecified.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` at `offset`.
    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()>;
}

/// Contiguous or not, a set of physical pages owned by one handle.
///
/// The pages are zero-filled when allocated and returned to the allocator when the last
/// `Arc` of the handle is dropped.
pub trait Pages: VmIo {
    fn nr_pages(&self) -> usize;

    fn size(&self) -> usize {
        self.nr_pages() * PAGE_SIZE
    }
}

/// The physical page allocator of the embedding kernel.
pub trait FrameAllocator: Send + Sync {
    /// Allocates `count` zeroed pages.
    ///
    /// Fails with `ENOMEM` when memory is exhausted.
    fn allocate_pages(&self, count: usize) -> Result<Arc<dyn Pages>>;
}

/// The user address space of a task.
pub trait AddressSpace: Send + Sync {
    /// Maps `size` bytes of `pages` with `perms`.
    ///
    /// If `hint` is `Some(_)`, the mapping must start exactly at the hinted page-aligned
    /// address; otherwise the address space chooses the address. Returns the start address.
    fn map(
        &self,
        pages: Arc<dyn Pages>,
        size: usize,
        perms: perms::VmPerms,
        hint: Option<Vaddr>,
    ) -> Result<Vaddr>;

    /// Removes the mapping that starts at `addr`.
    ///
    /// The address space drops its handle of the pages.
    fn unmap(&self, addr: Vaddr, size: usize) -> Result<()>;
}

/// Rounds `size` up to a multiple of the page size.
pub(crate) const fn page_align_up(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}
