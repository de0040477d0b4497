//! The slab allocator.
//!
//! Grounded on `crates/page_alloc`'s `HeapAllocator`: free objects of a
//! size class are threaded through themselves as a singly linked list,
//! and an empty class is refilled one page at a time by chopping it into
//! `PAGE_SIZE / class_size` objects. That source rounds a request up to
//! its class via `bit_ceil`; this tier does the same, except that the
//! two non-power-of-two classes (96, 192) are reached only by a request
//! of exactly that size — `class_for(80)` and `class_for(150)` round
//! past them to 128 and 256.

use crate::addr::PhysAddr;
use crate::hal::Hal;
use crate::layout::PAGE_SIZE;
use crate::page_table::PageSource;
use crate::sync::SpinLock;

use mutex_api::Mutex;

/// Fixed slab size classes, smallest first.
pub const SIZE_CLASSES: [usize; 11] = [8, 16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048];

/// Largest request this tier will service; larger requests are the
/// generic allocator's job (page or vmalloc tier).
pub const MAX_SIZE: usize = 2048;

/// Rounds `size` up to its slab class via `bit_ceil`, or `None` if
/// `size` is `0` or exceeds [`MAX_SIZE`].
///
/// The 96 and 192 classes are reached only by a request of exactly that
/// size; any other size rounds up to the next power of two (so `80`
/// lands in the 128 class, not 96, and `150` lands in 256, not 192).
#[must_use]
pub fn class_for(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_SIZE {
        return None;
    }
    if size == 96 || size == 192 {
        return Some(size);
    }
    let class = size.next_power_of_two().max(SIZE_CLASSES[0]);
    (class <= MAX_SIZE).then_some(class)
}

fn class_index(class_size: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .position(|&c| c == class_size)
        .expect("class_index: not a slab size class")
}

fn free_list_next(obj: PhysAddr) -> Option<PhysAddr> {
    let ptr = core::ptr::with_exposed_provenance::<usize>(obj.to_direct_map().as_usize());
    // SAFETY: `obj` is either on a class free list (its first word is the
    // next link we wrote) or was just handed out and is never read again
    // through this path.
    let raw = unsafe { ptr.read() };
    (raw != 0).then(|| PhysAddr::new(raw))
}

fn free_list_set_next(obj: PhysAddr, next: Option<PhysAddr>) {
    let ptr = core::ptr::with_exposed_provenance_mut::<usize>(obj.to_direct_map().as_usize());
    // SAFETY: see `free_list_next`.
    unsafe { ptr.write(next.map_or(0, PhysAddr::as_usize)) };
}

struct ClassState {
    free: [Option<PhysAddr>; SIZE_CLASSES.len()],
}

/// A slab allocator over the fixed size-class table, refilled a page at
/// a time from a [`PageSource`].
///
/// All eleven classes share one lock (an acknowledged contention point —
/// see the crate's design notes): this mirrors the teacher's
/// single-lock `HeapAllocator`, which the spec carries forward rather
/// than redesigning into per-class locks.
pub struct SlabAllocator<S: PageSource, H: Hal> {
    state: SpinLock<ClassState, H>,
    pages: S,
}

impl<S: PageSource, H: Hal> SlabAllocator<S, H> {
    /// Creates an empty slab allocator backed by `pages` for refill.
    #[must_use]
    pub fn new(pages: S) -> Self {
        Self {
            state: SpinLock::new(ClassState {
                free: [None; SIZE_CLASSES.len()],
            }),
            pages,
        }
    }

    /// Allocates an object of at least `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`MAX_SIZE`]. Returns `None` for `size ==
    /// 0` or if the backing page source is exhausted.
    pub fn alloc(&self, size: usize) -> Option<PhysAddr> {
        assert!(size <= MAX_SIZE, "slab allocation of {size} exceeds the slab ceiling");
        if size == 0 {
            return None;
        }
        let class = class_for(size)?;
        let idx = class_index(class);

        let mut state = self.state.lock();
        if state.free[idx].is_none() {
            let page = self.pages.alloc_zeroed_page()?;
            state.free[idx] = Some(refill(page, class));
        }
        let obj = state.free[idx].take()?;
        state.free[idx] = free_list_next(obj);
        Some(obj)
    }

    /// Returns `obj`, previously allocated for `size`, to its class.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a valid request size or `obj` is not
    /// aligned to its class size.
    pub fn dealloc(&self, obj: PhysAddr, size: usize) {
        let class = class_for(size).expect("dealloc: invalid slab size");
        assert!(obj.as_usize() % class == 0, "dealloc: {obj:?} is not aligned to its slab class ({class})");
        let idx = class_index(class);
        let mut state = self.state.lock();
        free_list_set_next(obj, state.free[idx]);
        state.free[idx] = Some(obj);
    }
}

/// Chops a freshly zeroed page into `PAGE_SIZE / class` objects, linking
/// them into a free list in address order, and returns the head.
fn refill(page: PhysAddr, class: usize) -> PhysAddr {
    let count = PAGE_SIZE / class;
    for i in (0..count - 1).rev() {
        let obj = page.byte_add(i * class);
        let next = page.byte_add((i + 1) * class);
        free_list_set_next(obj, Some(next));
    }
    free_list_set_next(page.byte_add((count - 1) * class), None);
    page
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::mock_hal::MockHal;

    #[derive(Clone)]
    struct TestSource(Arc<StdMutex<Inner>>);

    struct Inner {
        pages: Box<[[u8; PAGE_SIZE]]>,
        base: usize,
        next: usize,
    }

    impl TestSource {
        fn new(n: usize) -> Self {
            let pages: Box<[[u8; PAGE_SIZE]]> = vec![[0u8; PAGE_SIZE]; n].into_boxed_slice();
            let base = pages.as_ptr() as usize;
            Self(Arc::new(StdMutex::new(Inner { pages, base, next: 0 })))
        }
    }

    impl PageSource for TestSource {
        fn alloc_zeroed_page(&self) -> Option<PhysAddr> {
            let mut inner = self.0.lock().unwrap();
            if inner.next >= inner.pages.len() {
                return None;
            }
            let idx = inner.next;
            inner.next += 1;
            inner.pages[idx] = [0u8; PAGE_SIZE];
            Some(PhysAddr::new(inner.base + idx * PAGE_SIZE))
        }

        unsafe fn dealloc_page(&self, _pa: PhysAddr) {}
    }

    #[test]
    fn class_rounding() {
        assert_eq!(class_for(1), Some(8));
        assert_eq!(class_for(8), Some(8));
        assert_eq!(class_for(9), Some(16));
        assert_eq!(class_for(80), Some(128));
        assert_eq!(class_for(96), Some(96));
        assert_eq!(class_for(97), Some(128));
        assert_eq!(class_for(129), Some(256));
        assert_eq!(class_for(150), Some(256));
        assert_eq!(class_for(192), Some(192));
        assert_eq!(class_for(193), Some(256));
        assert_eq!(class_for(2048), Some(2048));
        assert_eq!(class_for(2049), None);
        assert_eq!(class_for(0), None);
    }

    #[test]
    fn alloc_objects_are_unique_and_aligned() {
        let slab = SlabAllocator::<_, MockHal>::new(TestSource::new(4));
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let obj = slab.alloc(32).unwrap();
            assert!(obj.is_aligned_to(32));
            assert!(seen.insert(obj.as_usize()), "slab handed out the same object twice while live");
            slab.dealloc(obj, 32);
            // Re-insert as available so the next loop iteration reuses
            // storage instead of requiring an unbounded backing source.
            seen.remove(&obj.as_usize());
        }
    }

    #[test]
    fn refill_on_empty_class() {
        let slab = SlabAllocator::<_, MockHal>::new(TestSource::new(2));
        let objs: Vec<_> = (0..(PAGE_SIZE / 8)).map(|_| slab.alloc(8).unwrap()).collect();
        assert_eq!(objs.iter().collect::<HashSet<_>>().len(), objs.len());
        // Triggers a second page's worth of refill.
        assert!(slab.alloc(8).is_some());
    }
}
