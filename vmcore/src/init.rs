//! Wiring the tiers together into one kernel memory stack.
//!
//! Grounded on the teacher's `memory::vm_kernel::KernelPageTable`
//! bring-up (`new` builds the mapping, `init`/`init_hart` install it):
//! first build the kernel's own page table using the boot bump
//! allocator for its interior pages, then graduate to the free-list
//! allocator over whatever physical memory remains, and only then layer
//! slab and vmalloc on top. This crate owns no global singleton state —
//! per the crate's Non-goals it has no boot or trap surface — so
//! [`KernelMemory`] is a plain value the embedding kernel constructs and
//! parks in its own `'static` storage (typically one
//! [`once_init::OnceInit`] per tier).

use crate::addr::PhysAddr;
use crate::alloc_core::boot::{BootAllocator, BootSource};
use crate::alloc_core::page_alloc::{PageAllocator, PageSourceHandle};
use crate::alloc_core::slab::SlabAllocator;
use crate::alloc_core::vmalloc::VmallocAllocator;
use crate::alloc_core::GenericAllocator;
use crate::hal::Hal;
use crate::page_table::{PageSource, PageTable};

/// A [`PageSource`] that starts out backed by the boot bump allocator and
/// is switched, once, to the free-list page allocator.
///
/// Avoids threading a second type parameter through every allocator tier
/// just to support the boot-to-steady-state handoff: the kernel's own
/// page table is built with `Boot`, then every later caller (slab,
/// vmalloc, further table growth) uses `Pages`.
#[derive(Clone, Copy, derive_more::From)]
pub enum KernelPageSource<H: Hal> {
    Boot(BootSource),
    Pages(PageSourceHandle<H>),
}

impl<H: Hal> PageSource for KernelPageSource<H> {
    fn alloc_zeroed_page(&self) -> Option<PhysAddr> {
        match self {
            Self::Boot(b) => b.alloc_zeroed_page(),
            Self::Pages(p) => p.alloc_zeroed_page(),
        }
    }

    unsafe fn dealloc_page(&self, pa: PhysAddr) {
        match self {
            Self::Boot(b) => unsafe { b.dealloc_page(pa) },
            Self::Pages(p) => unsafe { p.dealloc_page(pa) },
        }
    }
}

/// The fully assembled allocator stack for one kernel: the live page
/// table plus the slab and vmalloc tiers built on the free-list
/// allocator.
pub struct KernelMemory<H: Hal> {
    pub table: PageTable<KernelPageSource<H>>,
    pub slab: SlabAllocator<KernelPageSource<H>, H>,
    pub vmalloc: VmallocAllocator<KernelPageSource<H>, H>,
}

impl<H: Hal> KernelMemory<H> {
    /// Runs the bring-up sequence:
    ///
    /// 1. Build an empty page table backed by `boot`.
    /// 2. Call `map_kernel` to install the kernel's fixed mappings
    ///    (image, direct map, device windows) — the only phase that uses
    ///    the boot allocator.
    /// 3. Switch to `pages` (already initialized by the caller over
    ///    whatever physical range the boot allocator did not consume) for
    ///    every allocation from here on, including the slab and vmalloc
    ///    tiers this function builds.
    ///
    /// The caller installs `table`'s root (via
    /// `Hal::set_pagetable_base`) and brings up per-hart state
    /// afterwards; that step is architecture-specific and not this
    /// crate's concern.
    pub fn init(
        boot: &'static BootAllocator,
        pages: &'static PageAllocator<H>,
        map_kernel: impl FnOnce(&mut PageTable<KernelPageSource<H>>),
    ) -> Self {
        let mut table = PageTable::new(KernelPageSource::Boot(BootSource(boot)));
        map_kernel(&mut table);

        let source = KernelPageSource::Pages(PageSourceHandle(pages));
        log::info!("kernel memory: switching from boot allocator to free-list allocator");
        Self {
            table,
            slab: SlabAllocator::new(source),
            vmalloc: VmallocAllocator::new(source),
        }
    }

    /// Builds a [`GenericAllocator`] dispatching across this stack's
    /// slab, page, and vmalloc tiers.
    #[must_use]
    pub fn generic_allocator<'a>(
        &'a self,
        pages: &'a PageAllocator<H>,
    ) -> GenericAllocator<'a, KernelPageSource<H>, H> {
        GenericAllocator::new(&self.slab, pages, &self.vmalloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VirtAddr;
    use crate::layout::PAGE_SIZE;
    use crate::mock_hal::MockHal;
    use crate::page_table::{Level, PtEntryFlags};

    #[test]
    fn boot_then_steady_state_sequence() {
        MockHal::reset();

        static BOOT_STORAGE: std::sync::OnceLock<Box<[u8]>> = std::sync::OnceLock::new();
        static PAGES_STORAGE: std::sync::OnceLock<Box<[u8]>> = std::sync::OnceLock::new();
        static BOOT: std::sync::OnceLock<BootAllocator> = std::sync::OnceLock::new();
        static PAGES: std::sync::OnceLock<PageAllocator<MockHal>> = std::sync::OnceLock::new();

        fn page_aligned(buf: &[u8]) -> usize {
            (buf.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
        }

        let boot_buf = BOOT_STORAGE.get_or_init(|| vec![0u8; 4 * PAGE_SIZE].into_boxed_slice());
        let boot_base = page_aligned(boot_buf);
        let boot = BOOT.get_or_init(|| BootAllocator::new(PhysAddr::new(boot_base), PhysAddr::new(boot_base + 2 * PAGE_SIZE)));

        let pages_buf = PAGES_STORAGE.get_or_init(|| vec![0u8; 18 * PAGE_SIZE].into_boxed_slice());
        let pages_base = page_aligned(pages_buf);
        let pages = PAGES.get_or_init(|| PageAllocator::new(PhysAddr::new(pages_base), PhysAddr::new(pages_base + 16 * PAGE_SIZE)));

        let mem = KernelMemory::<MockHal>::init(boot, pages, |table| {
            table.add_mapping(VirtAddr::new(0x1000), PhysAddr::new(boot_base), PtEntryFlags::RW, Level::L0);
        });

        assert_eq!(mem.table.transform(VirtAddr::new(0x1000)), PhysAddr::new(boot_base));

        let obj = mem.slab.alloc(16).unwrap();
        mem.slab.dealloc(obj, 16);

        let va = mem.vmalloc.alloc_vpages(2).unwrap();
        mem.vmalloc.dealloc_vpages(va);
    }
}
