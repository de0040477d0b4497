//! The tiered kernel allocators built on top of the page-table engine.
//!
//! Grounded on the teacher's `memory` module split
//! (`page_frame_allocator` → `page` → `vm_kernel`), generalized from a
//! single-purpose COW-page allocator into four independent tiers plus a
//! size-dispatching front end, per this crate's design: [`boot`] (no
//! free), [`page_alloc`] (multi-page free-list, first-fit, no
//! coalescing), [`slab`] (fixed size classes), and [`vmalloc`]
//! (virtually contiguous, physically fragmented).

pub mod boot;
pub mod page_alloc;
pub mod slab;
pub mod vmalloc;

use crate::addr::PhysAddr;
use crate::hal::Hal;
use crate::layout::PAGE_SIZE;
use crate::page_table::PageSource;

use page_alloc::PageAllocator;
use slab::SlabAllocator;
use vmalloc::VmallocAllocator;

/// Zeroes a freshly allocated physical page through the direct map.
pub(crate) fn zero_page(pa: PhysAddr) {
    let ptr = core::ptr::with_exposed_provenance_mut::<u8>(pa.to_direct_map().as_usize());
    // SAFETY: `pa` was just allocated by a page source and is not
    // concurrently accessed by anyone else yet.
    unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
}

/// Size thresholds the generic allocator dispatches on.
pub const SLAB_THRESHOLD: usize = slab::MAX_SIZE;
/// Requests above `SLAB_THRESHOLD` and at or below this go to the page
/// allocator; larger requests go to vmalloc.
pub const PAGE_THRESHOLD: usize = 2 * PAGE_SIZE;

/// A size-dispatching front end over the slab, page, and vmalloc tiers.
///
/// Grounded on the teacher's `memory::page::PageFrameAllocator`'s
/// `Allocator` trait impl, generalized from "always a page allocation"
/// to the spec's three-way size dispatch. Deallocation must be called
/// with the same size the allocation used — this type does not track
/// sizes itself, matching the slab and page tiers it wraps.
pub struct GenericAllocator<'a, S: PageSource, H: Hal> {
    slab: &'a SlabAllocator<S, H>,
    pages: &'a PageAllocator<H>,
    vmalloc: &'a VmallocAllocator<S, H>,
}

/// Where a request of a given size was or will be routed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tier {
    Slab,
    Page,
    Vmalloc,
}

/// Classifies a request size into the tier that will serve it.
#[must_use]
pub fn tier_for(size: usize) -> Tier {
    if size <= SLAB_THRESHOLD {
        Tier::Slab
    } else if size <= PAGE_THRESHOLD {
        Tier::Page
    } else {
        Tier::Vmalloc
    }
}

fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

impl<'a, S: PageSource, H: Hal> GenericAllocator<'a, S, H> {
    /// Builds a generic allocator over already-initialized slab, page,
    /// and vmalloc tiers, shared with whatever else references them.
    #[must_use]
    pub fn new(slab: &'a SlabAllocator<S, H>, pages: &'a PageAllocator<H>, vmalloc: &'a VmallocAllocator<S, H>) -> Self {
        Self { slab, pages, vmalloc }
    }

    /// Allocates `size` bytes, dispatching to slab, page, or vmalloc
    /// depending on [`tier_for`].
    ///
    /// Returns the physical address the slab and page tiers hand back
    /// directly; the vmalloc tier instead returns the virtual address of
    /// the mapped region, which has no single physical address (use
    /// [`VmallocAllocator::transform`] per page if needed).
    pub fn alloc(&self, size: usize) -> Option<usize> {
        match tier_for(size) {
            Tier::Slab => self.slab.alloc(size).map(PhysAddr::as_usize),
            Tier::Page => self.pages.alloc_pages(pages_for(size)).map(PhysAddr::as_usize),
            Tier::Vmalloc => self.vmalloc.alloc_vpages(pages_for(size)).ok().map(|va| va.as_usize()),
        }
    }

    /// Frees an allocation of `size` bytes previously returned by
    /// [`Self::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if `addr`/`size` do not describe a live allocation from
    /// this allocator (the same conditions each tier's own `dealloc`
    /// panics on).
    pub fn dealloc(&self, addr: usize, size: usize) {
        match tier_for(size) {
            Tier::Slab => self.slab.dealloc(PhysAddr::new(addr), size),
            Tier::Page => self.pages.dealloc_pages(PhysAddr::new(addr), pages_for(size)),
            Tier::Vmalloc => self.vmalloc.dealloc_vpages(crate::addr::VirtAddr::new(addr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_thresholds() {
        assert_eq!(tier_for(1), Tier::Slab);
        assert_eq!(tier_for(2048), Tier::Slab);
        assert_eq!(tier_for(2049), Tier::Page);
        assert_eq!(tier_for(2 * PAGE_SIZE), Tier::Page);
        assert_eq!(tier_for(2 * PAGE_SIZE + 1), Tier::Vmalloc);
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}
