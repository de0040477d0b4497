//! The vmalloc allocator: virtually contiguous, physically fragmented
//! kernel allocations.
//!
//! Grounded on the teacher's `memory::vm_kernel` (mapping construction
//! into the live kernel table) and `memory::page_manager` (a
//! lock-guarded singleton tracking occupied ranges). This core has no
//! general heap to allocate a `Vec`-backed range tracker from, so the
//! occupied-range list is a bespoke singly linked list whose nodes come
//! from the slab tier instead — the "slab-backed node allocator" the
//! design calls for.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::VmError;
use crate::hal::Hal;
use crate::layout::{PAGE_SIZE, VMALLOC_END, VMALLOC_START};
use crate::page_table::{Level, PageSource, PageTable, PtEntryFlags};
use crate::sync::SpinLock;

use mutex_api::Mutex;

use super::slab::SlabAllocator;

#[repr(C)]
struct Region {
    va: VirtAddr,
    pages: usize,
    next: Option<NonNull<Region>>,
}

fn region_ptr(pa: PhysAddr) -> *mut Region {
    core::ptr::with_exposed_provenance_mut::<Region>(pa.to_direct_map().as_usize())
}

fn region_pa(ptr: NonNull<Region>) -> PhysAddr {
    VirtAddr::new(ptr.as_ptr() as usize).from_direct_map()
}

struct State<S: PageSource, H: Hal> {
    head: Option<NonNull<Region>>,
    table: PageTable<S>,
    nodes: SlabAllocator<S, H>,
    pages: S,
}

// SAFETY: every `NonNull<Region>` reachable from `State` points at
// slab-owned memory that is only ever touched while holding the
// `VmallocAllocator`'s spinlock, so the whole struct may cross threads
// as a unit.
unsafe impl<S: PageSource, H: Hal> Send for State<S, H> {}

/// Virtually contiguous allocations in `[VMALLOC_START, VMALLOC_END)`,
/// each page individually backed and mapped into an owned kernel page
/// table.
pub struct VmallocAllocator<S: PageSource, H: Hal> {
    state: SpinLock<State<S, H>, H>,
}

impl<S: PageSource, H: Hal> VmallocAllocator<S, H> {
    /// Creates an empty vmalloc allocator, using `pages` both for
    /// backing data pages and for its own node storage (via the slab
    /// tier).
    #[must_use]
    pub fn new(pages: S) -> Self {
        Self {
            state: SpinLock::new(State {
                head: None,
                table: PageTable::new(pages.clone()),
                nodes: SlabAllocator::new(pages.clone()),
                pages,
            }),
        }
    }

    /// Allocates `n` virtually contiguous pages backed by `n`
    /// individually allocated physical pages, mapped read/write/execute.
    ///
    /// # Errors
    ///
    /// [`VmError::ZeroSizeRequest`] if `n == 0`; [`VmError::GapNotFound`]
    /// if no `n`-page gap exists in the window; [`VmError::OutOfPhysicalMemory`]
    /// if backing pages run out partway through (partial mappings are
    /// unwound; this never touches the TLB since those pages were never
    /// accessible).
    pub fn alloc_vpages(&self, n: usize) -> Result<VirtAddr, VmError> {
        if n == 0 {
            return Err(VmError::ZeroSizeRequest);
        }
        let mut state = self.state.lock();
        let va = find_gap(&state, n).ok_or(VmError::GapNotFound)?;

        for i in 0..n {
            let Some(pa) = state.pages.alloc_zeroed_page() else {
                for j in 0..i {
                    state.table.del_mapping(va.byte_add(j * PAGE_SIZE));
                }
                return Err(VmError::OutOfPhysicalMemory);
            };
            state
                .table
                .add_mapping(va.byte_add(i * PAGE_SIZE), pa, PtEntryFlags::RWX, Level::L0);
        }

        insert_region(&mut state, va, n);
        Ok(va)
    }

    /// Unmaps and frees the region starting at `va`: each page is
    /// unmapped and locally flushed in turn, then one remote flush
    /// covers the whole range.
    ///
    /// # Panics
    ///
    /// Panics if `va` does not start a tracked region.
    pub fn dealloc_vpages(&self, va: VirtAddr) {
        let mut state = self.state.lock();
        let n = remove_region(&mut state, va)
            .unwrap_or_else(|| panic!("dealloc_vpages: {va:?} is not a known vmalloc region"));

        for i in 0..n {
            let page_va = va.byte_add(i * PAGE_SIZE);
            let pa = state.table.transform(page_va);
            // SAFETY: `pa` was handed out by `state.pages` in `alloc_vpages`
            // and has not been freed since (it is only reachable through
            // this region, which is removed from the list above).
            unsafe { state.pages.dealloc_page(pa) };
            state.table.del_mapping(page_va);
            H::tlb_flush(page_va);
        }
        H::remote_tlb_flush(va, n * PAGE_SIZE);
    }

    /// Translates a vmalloc'd virtual address to its backing physical
    /// address.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not mapped.
    #[must_use]
    pub fn transform(&self, va: VirtAddr) -> PhysAddr {
        self.state.lock().table.transform(va)
    }
}

fn find_gap<S: PageSource, H: Hal>(state: &State<S, H>, n: usize) -> Option<VirtAddr> {
    let mut prev_end = VMALLOC_START;
    let mut cur = state.head;
    loop {
        let region_start = match cur {
            Some(ptr) => unsafe { ptr.as_ref() }.va,
            None => VMALLOC_END,
        };
        let gap_pages = (region_start.as_usize() - prev_end.as_usize()) / PAGE_SIZE;
        if gap_pages >= n {
            return Some(prev_end);
        }
        let ptr = cur?;
        let region = unsafe { ptr.as_ref() };
        prev_end = region.va.byte_add(region.pages * PAGE_SIZE);
        cur = region.next;
    }
}

fn insert_region<S: PageSource, H: Hal>(state: &mut State<S, H>, va: VirtAddr, pages: usize) {
    let node_pa = state
        .nodes
        .alloc(size_of::<Region>())
        .expect("out of physical memory allocating a vmalloc node");
    let ptr = NonNull::new(region_ptr(node_pa)).expect("node address must not be null");

    let mut prev: Option<NonNull<Region>> = None;
    let mut cur = state.head;
    while let Some(cur_ptr) = cur {
        if unsafe { cur_ptr.as_ref() }.va > va {
            break;
        }
        prev = Some(cur_ptr);
        cur = unsafe { cur_ptr.as_ref() }.next;
    }

    // SAFETY: `ptr` is freshly allocated, exclusively owned node storage.
    unsafe { ptr.as_ptr().write(Region { va, pages, next: cur }) };
    match prev {
        None => state.head = Some(ptr),
        Some(mut prev_ptr) => unsafe { prev_ptr.as_mut().next = Some(ptr) },
    }
}

fn remove_region<S: PageSource, H: Hal>(state: &mut State<S, H>, va: VirtAddr) -> Option<usize> {
    let mut prev: Option<NonNull<Region>> = None;
    let mut cur = state.head;
    while let Some(cur_ptr) = cur {
        let region = unsafe { cur_ptr.as_ref() };
        if region.va == va {
            let pages = region.pages;
            let next = region.next;
            match prev {
                None => state.head = next,
                Some(mut prev_ptr) => unsafe { prev_ptr.as_mut().next = next },
            }
            state.nodes.dealloc(region_pa(cur_ptr), size_of::<Region>());
            return Some(pages);
        }
        prev = Some(cur_ptr);
        cur = region.next;
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::mock_hal::MockHal;

    const NUM_PAGES: usize = 64;

    #[derive(Clone)]
    struct TestSource(Arc<StdMutex<Inner>>);

    struct Inner {
        pages: Box<[[u8; PAGE_SIZE]]>,
        base: usize,
        free: Vec<usize>,
    }

    impl TestSource {
        fn new() -> Self {
            let pages: Box<[[u8; PAGE_SIZE]]> = vec![[0u8; PAGE_SIZE]; NUM_PAGES].into_boxed_slice();
            let base = pages.as_ptr() as usize;
            let free = (0..NUM_PAGES).collect();
            Self(Arc::new(StdMutex::new(Inner { pages, base, free })))
        }
    }

    impl PageSource for TestSource {
        fn alloc_zeroed_page(&self) -> Option<PhysAddr> {
            let mut inner = self.0.lock().unwrap();
            let idx = inner.free.pop()?;
            inner.pages[idx] = [0u8; PAGE_SIZE];
            Some(PhysAddr::new(inner.base + idx * PAGE_SIZE))
        }

        unsafe fn dealloc_page(&self, pa: PhysAddr) {
            let mut inner = self.0.lock().unwrap();
            let idx = (pa.as_usize() - inner.base) / PAGE_SIZE;
            inner.free.push(idx);
        }
    }

    #[test]
    fn alloc_write_read_dealloc_round_trip() {
        MockHal::reset();
        let v = VmallocAllocator::<_, MockHal>::new(TestSource::new());
        let va = v.alloc_vpages(3).unwrap();
        for i in 0..3 {
            let pa = v.transform(va.byte_add(i * PAGE_SIZE));
            assert!(pa.is_aligned_to(PAGE_SIZE));
        }
        v.dealloc_vpages(va);
        assert_eq!(MockHal::tlb_flush_count(), 3);
        assert_eq!(MockHal::remote_flush_count(), 1);
    }

    #[test]
    #[should_panic(expected = "not a known vmalloc region")]
    fn dealloc_unknown_region_panics() {
        let v = VmallocAllocator::<_, MockHal>::new(TestSource::new());
        v.dealloc_vpages(VMALLOC_START);
    }

    #[test]
    fn reuses_gap_after_free() {
        let v = VmallocAllocator::<_, MockHal>::new(TestSource::new());
        let a = v.alloc_vpages(4).unwrap();
        let b = v.alloc_vpages(4).unwrap();
        v.dealloc_vpages(a);
        let c = v.alloc_vpages(4).unwrap();
        assert_eq!(a, c, "freed gap at the front of the window should be reused first");
        v.dealloc_vpages(b);
        v.dealloc_vpages(c);
    }
}
