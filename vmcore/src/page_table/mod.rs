//! The Sv39 page-table engine.
//!
//! Grounded on the teacher's `memory::page_table::{mod, entry}`: a
//! `Box`-owned root table (`PageTable(Box<PageTableEntries, _>)`),
//! interior tables accessed by translating their PPN through the direct
//! map, and a recursive free on `Drop`. The teacher's COW machinery
//! (`make_copy_on_write`, `request_user_write`, `clone_pages_from` plus
//! `memory::page_manager`'s per-page refcounting) has no counterpart
//! here — see `shared_copy`/`shared_mark`/`shared_attach`/`shared_detach`
//! below for this engine's actual sharing model, a `SHARED`-bit-plus-pin
//! scheme that owns zero extra bytes per page.
//!
//! One deliberate divergence from the teacher, recorded in `DESIGN.md`:
//! leaf-mapped physical pages are never owned by the table. `add_mapping`
//! takes the physical frame as a parameter and `del_mapping` never frees
//! it; only the *interior* table pages the engine allocates for itself
//! are freed on `Drop` or on overwrite. Callers (see
//! `crate::alloc_core::vmalloc`) that want "unmap and free the backing
//! page" do both steps themselves, in the order `transform` →
//! `del_mapping` → return the page to their allocator.

pub mod entry;
mod iter;

use core::ptr::NonNull;

use alloc::boxed::Box;

pub use entry::{Level, PageSource, Perm, PtEntryFlags, TableAllocator};
use entry::PtEntry;
use iter::Leaves;

use crate::addr::{PhysAddr, VirtAddr};
use crate::layout::HUGE_PAGE_SIZE;

/// One 4 KiB page's worth of page-table entries: an L2, L1, or L0 table.
#[repr(transparent)]
pub struct PageTableEntries([PtEntry; 512]);

/// An owned Sv39 translation tree.
///
/// Has value semantics: [`Clone`] deep-copies every interior table
/// (leaf PTEs are copied verbatim — see the module docs on leaf
/// ownership), moving transfers the root, and `Drop` recursively frees
/// every interior table this tree owns.
pub struct PageTable<S: PageSource> {
    root: Option<Box<PageTableEntries, TableAllocator<S>>>,
    source: S,
}

impl<S: PageSource> PageTable<S> {
    /// Creates an empty page table. No page is allocated until the first
    /// mapping is added.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self { root: None, source }
    }

    /// Physical address of the root table, if one has been allocated.
    #[must_use]
    pub fn root_phys_addr(&self) -> Option<PhysAddr> {
        self.root.as_deref().map(table_pa)
    }

    fn ensure_root(&mut self) -> &mut PageTableEntries {
        if self.root.is_none() {
            let alloc = TableAllocator(self.source.clone());
            let zeroed = PageTableEntries([PtEntry::INVALID; 512]);
            let boxed = Box::try_new_in(zeroed, alloc).expect("out of physical memory allocating page-table root");
            self.root = Some(boxed);
        }
        self.root.as_mut().unwrap()
    }

    /// Adds a mapping `va -> pa` at `level`, with permission `perm`.
    ///
    /// # Panics
    ///
    /// Panics if `va`/`pa` are not aligned to `level`'s page size, if the
    /// walk would cross an existing leaf at a higher level, or if `va` is
    /// already mapped at `level` (including via a non-empty interior
    /// subtree).
    pub fn add_mapping(&mut self, va: VirtAddr, pa: PhysAddr, perm: Perm, level: Level) {
        assert!(va.is_aligned_to(level.page_size()), "add_mapping: {va:?} not aligned to {level:?}");
        assert!(pa.is_aligned_to(level.page_size()), "add_mapping: {pa:?} not aligned to {level:?}");
        assert!(perm.intersects(PtEntryFlags::RWX), "add_mapping: perm {perm:?} has no R/W/X bit");

        let source = self.source.clone();
        let mut table = self.ensure_root();
        let mut cur = Level::L2;
        while cur != level {
            let idx = cur.index(va);
            let pte = table.0[idx];
            assert!(!pte.is_leaf(), "add_mapping: {va:?} collides with an active {cur:?} hugepage");
            if !pte.is_valid() {
                let child_pa = source.alloc_zeroed_page().expect("out of physical memory");
                table.0[idx] = PtEntry::interior(child_pa);
            }
            let child_pa = table.0[idx].phys_addr();
            table = unsafe { child_table_mut(child_pa) };
            cur = cur.child().expect("add_mapping: walked past L0");
        }

        let idx = level.index(va);
        let existing = table.0[idx];
        if existing.is_valid() {
            assert!(!existing.is_leaf(), "add_mapping: {va:?} is already mapped");
            let child = unsafe { child_table(existing.phys_addr()) };
            assert!(
                !subtree_has_leaf(child),
                "add_mapping: {va:?} overlaps a mapped region below {level:?}"
            );
            free_subtree(&source, child, false);
            unsafe { source.dealloc_page(existing.phys_addr()) };
        }
        table.0[idx] = PtEntry::leaf(pa, perm);
    }

    /// Removes the mapping at `va`. Does not flush the TLB and does not
    /// free the mapped physical page — the caller owns that lifecycle.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not mapped to a leaf.
    pub fn del_mapping(&mut self, va: VirtAddr) {
        self.leaf_mut(va).clear();
    }

    /// Overwrites the permission bits of the leaf mapping at `va`.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not mapped to a leaf.
    pub fn set_page_perm(&mut self, va: VirtAddr, perm: Perm) {
        self.leaf_mut(va).set_perm(perm);
    }

    /// Reads the permission bits of the leaf mapping at `va`.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not mapped to a leaf. (The teacher's source
    /// returns a default permission for unmapped addresses here instead;
    /// we pick the panicking behavior to stay consistent with every other
    /// walk-based accessor — see `DESIGN.md`.)
    #[must_use]
    pub fn get_page_perm(&self, va: VirtAddr) -> Perm {
        self.leaf(va).perm()
    }

    /// Translates `va` to its mapped physical address.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not mapped.
    #[must_use]
    pub fn transform(&self, va: VirtAddr) -> PhysAddr {
        let (level, pte) = self.walk_to_leaf(va);
        let offset = va.as_usize() & (level.page_size() - 1);
        pte.phys_addr().byte_add(offset)
    }

    fn walk_to_leaf(&self, va: VirtAddr) -> (Level, PtEntry) {
        let mut table: &PageTableEntries = self.root.as_deref().expect("walk: page table is empty");
        let mut level = Level::L2;
        loop {
            let pte = table.0[level.index(va)];
            if pte.is_leaf() {
                return (level, pte);
            }
            assert!(pte.is_valid(), "walk: {va:?} is not mapped");
            let next = level.child().expect("walk: invalid page table (non-leaf at L0)");
            table = unsafe { child_table(pte.phys_addr()) };
            level = next;
        }
    }

    fn leaf(&self, va: VirtAddr) -> PtEntry {
        self.walk_to_leaf(va).1
    }

    fn leaf_mut(&mut self, va: VirtAddr) -> &mut PtEntry {
        let mut table: &mut PageTableEntries = self.root.as_deref_mut().expect("walk: page table is empty");
        let mut level = Level::L2;
        loop {
            let idx = level.index(va);
            if table.0[idx].is_leaf() {
                return &mut table.0[idx];
            }
            assert!(table.0[idx].is_valid(), "walk: {va:?} is not mapped");
            let child_pa = table.0[idx].phys_addr();
            level = level.child().expect("walk: invalid page table (non-leaf at L0)");
            table = unsafe { child_table_mut(child_pa) };
        }
    }

    /// Returns every leaf mapping reachable from the root, in address
    /// order, as `(va, level, perm, pa)`.
    pub fn leaves(&self) -> impl Iterator<Item = (VirtAddr, Level, Perm, PhysAddr)> + '_ {
        self.root
            .as_deref()
            .map(|root| Leaves::new(root, resolve_child))
            .into_iter()
            .flatten()
            .map(|(va, level, pte)| (va, level, pte.perm(), pte.phys_addr()))
    }

    /// Logs every leaf mapping at `log::debug!` level.
    pub fn dump(&self) {
        for (va, level, perm, pa) in self.leaves() {
            log::debug!("{va:?} -> {pa:?} ({level:?}, {perm:?})");
        }
    }

    /// Produces an independent deep copy: every interior table is
    /// recursively duplicated into fresh pages, and leaf PTEs are copied
    /// verbatim (the underlying physical pages are not duplicated — see
    /// the module docs on leaf ownership).
    ///
    /// Unlike [`Self::shared_copy`], the result shares no structure with
    /// `self`: even subtrees `self` itself only borrowed via an earlier
    /// `shared_attach` are fully duplicated here, so the clone never
    /// depends on `self` outliving it. Use `shared_copy` when aliasing is
    /// what you want.
    #[must_use]
    pub fn try_clone(&self) -> Self {
        let mut new = Self::new(self.source.clone());
        if let Some(root) = self.root.as_deref() {
            let new_root_pa = clone_subtree(&self.source, root);
            new.root = Some(box_from_page(new_root_pa, new.source.clone()));
        }
        new
    }

    /// Produces a copy that shares every existing subtree with `self`
    /// via the `SHARED`-bit-plus-pin protocol: neither `self` nor the
    /// copy will free those subtrees on `Drop`, and later writes through
    /// either handle (outside of `add_mapping`/`del_mapping` on the
    /// shared range) are visible through the other.
    ///
    /// Mappings added to `self` *after* this call, in a root slot that
    /// was empty at copy time, are private to `self` and not visible
    /// through the copy — call [`Self::shared_mark`] first if that's not
    /// what you want.
    #[must_use]
    pub fn shared_copy(&self) -> Self {
        let mut new = Self::new(self.source.clone());
        let Some(root) = self.root.as_deref() else {
            return new;
        };
        let new_root_pa = self.source.alloc_zeroed_page().expect("out of physical memory in shared_copy");
        let new_table = unsafe { child_table_mut(new_root_pa) };
        new_table.0.copy_from_slice(&root.0);
        for pte in &mut new_table.0 {
            if pte.is_non_leaf() {
                pte.set_shared(true);
                let l1 = unsafe { child_table_mut(pte.phys_addr()) };
                l1.0[0].set_shared(true);
            }
        }
        new.root = Some(box_from_page(new_root_pa, new.source.clone()));
        new
    }

    /// Pins every existing interior subtree in `[start, end)` (both
    /// `HUGE`-aligned) so a later [`Self::shared_attach`] from another
    /// table can borrow it. Allocates an (empty) interior page for any
    /// root slot in range that is currently unmapped.
    ///
    /// # Panics
    ///
    /// Panics if `start`/`end` are not `HUGE`-aligned or `end <= start`.
    pub fn shared_mark(&mut self, start: VirtAddr, end: VirtAddr) {
        assert_huge_range(start, end);
        let source = self.source.clone();
        let table = self.ensure_root();
        for idx in Level::L2.index(start)..Level::L2.index(end) {
            let pte = table.0[idx];
            if pte.is_leaf() {
                continue;
            }
            if !pte.is_valid() {
                let child_pa = source.alloc_zeroed_page().expect("out of physical memory in shared_mark");
                table.0[idx] = PtEntry::interior(child_pa);
            }
            let l1 = unsafe { child_table_mut(table.0[idx].phys_addr()) };
            l1.0[0].set_shared(true);
        }
    }

    /// Borrows every pinned subtree `other` has in `[start, end)` into
    /// `self`, at the same root slots. Slots already occupied in `self`
    /// are left untouched; slots in `other` that are not pinned (no
    /// prior `shared_mark`/`shared_copy`) are skipped.
    ///
    /// # Panics
    ///
    /// Panics if `start`/`end` are not `HUGE`-aligned or `end <= start`.
    pub fn shared_attach(&mut self, other: &Self, start: VirtAddr, end: VirtAddr) {
        assert_huge_range(start, end);
        let Some(other_root) = other.root.as_deref() else {
            return;
        };
        let table = self.ensure_root();
        for idx in Level::L2.index(start)..Level::L2.index(end) {
            let other_pte = other_root.0[idx];
            if !other_pte.is_non_leaf() {
                continue;
            }
            let other_l1 = unsafe { child_table(other_pte.phys_addr()) };
            if !other_l1.0[0].is_shared() {
                continue;
            }
            if table.0[idx].is_valid() {
                continue;
            }
            let mut new_pte = PtEntry::interior(other_pte.phys_addr());
            new_pte.set_shared(true);
            table.0[idx] = new_pte;
        }
    }

    /// Detaches every borrowed (`SHARED`) root slot in `[start, end)`.
    /// The borrowed subtree is not freed — it is owned by whoever pinned
    /// it.
    ///
    /// # Panics
    ///
    /// Panics if `start`/`end` are not `HUGE`-aligned or `end <= start`.
    pub fn shared_detach(&mut self, start: VirtAddr, end: VirtAddr) {
        assert_huge_range(start, end);
        let Some(table) = self.root.as_deref_mut() else {
            return;
        };
        for idx in Level::L2.index(start)..Level::L2.index(end) {
            let pte = &mut table.0[idx];
            if pte.is_non_leaf() && pte.is_shared() {
                pte.clear();
            }
        }
    }
}

impl<S: PageSource> Clone for PageTable<S> {
    fn clone(&self) -> Self {
        self.try_clone()
    }
}

impl<S: PageSource> Drop for PageTable<S> {
    fn drop(&mut self) {
        if let Some(root) = self.root.take() {
            free_subtree(&self.source, &root, true);
            drop(root);
        }
    }
}

fn assert_huge_range(start: VirtAddr, end: VirtAddr) {
    assert!(start.is_aligned_to(HUGE_PAGE_SIZE), "{start:?} is not HUGE-aligned");
    assert!(end.is_aligned_to(HUGE_PAGE_SIZE), "{end:?} is not HUGE-aligned");
    assert!(end > start, "empty or inverted range {start:?}..{end:?}");
}

fn subtree_has_leaf(table: &PageTableEntries) -> bool {
    table.0.iter().any(|pte| {
        pte.is_leaf() || (pte.is_non_leaf() && subtree_has_leaf(unsafe { child_table(pte.phys_addr()) }))
    })
}

/// Recursively frees every interior table page reachable from `table`,
/// skipping a root-level entry with `SHARED` set (I4: a shared subtree
/// borrowed via `shared_attach`/`shared_copy` is owned elsewhere). Leaf-
/// mapped physical pages are never touched — see the module docs on leaf
/// ownership.
///
/// `is_root` is true only for the initial call over the tree's own L2
/// table. `shared_mark`/`shared_copy` also set `SHARED` on PTE index 0
/// of an owned, non-root L1 page, as a pin marker `shared_attach` reads
/// to find borrowable subtrees — that marker does not mean "borrowed",
/// and must not stop this table's own L0 table from being freed when its
/// own `Drop` runs, so the `SHARED` check only applies at `is_root`.
fn free_subtree<S: PageSource>(source: &S, table: &PageTableEntries, is_root: bool) {
    for pte in &table.0 {
        if pte.is_non_leaf() {
            if is_root && pte.is_shared() {
                continue;
            }
            let child = unsafe { child_table(pte.phys_addr()) };
            free_subtree(source, child, false);
            unsafe { source.dealloc_page(pte.phys_addr()) };
        }
    }
}

/// Deep-copies `src` into a freshly allocated table page, recursing into
/// every interior entry regardless of `SHARED` (an ordinary `Clone`
/// always produces a fully independent copy; see [`PageTable::try_clone`]
/// docs).
fn clone_subtree<S: PageSource>(source: &S, src: &PageTableEntries) -> PhysAddr {
    let new_pa = source.alloc_zeroed_page().expect("out of physical memory cloning page table");
    let new_table = unsafe { child_table_mut(new_pa) };
    new_table.0.copy_from_slice(&src.0);
    for (i, pte) in src.0.iter().enumerate() {
        if pte.is_non_leaf() {
            let child_src = unsafe { child_table(pte.phys_addr()) };
            let child_new_pa = clone_subtree(source, child_src);
            new_table.0[i] = PtEntry::interior(child_new_pa);
        }
    }
    new_pa
}

fn resolve_child<'a>(pte: PtEntry) -> Option<&'a PageTableEntries> {
    pte.is_non_leaf().then(|| unsafe { child_table(pte.phys_addr()) })
}

fn table_pa(table: &PageTableEntries) -> PhysAddr {
    VirtAddr::new(core::ptr::from_ref(table) as usize).from_direct_map()
}

fn box_from_page<S: PageSource>(pa: PhysAddr, source: S) -> Box<PageTableEntries, TableAllocator<S>> {
    let ptr = NonNull::new(core::ptr::with_exposed_provenance_mut::<PageTableEntries>(pa.to_direct_map().as_usize()))
        .expect("page-table page address must not be null");
    unsafe { Box::from_raw_in(ptr.as_ptr(), TableAllocator(source)) }
}

unsafe fn child_table<'a>(pa: PhysAddr) -> &'a PageTableEntries {
    unsafe { &*core::ptr::with_exposed_provenance::<PageTableEntries>(pa.to_direct_map().as_usize()) }
}

unsafe fn child_table_mut<'a>(pa: PhysAddr) -> &'a mut PageTableEntries {
    unsafe { &mut *core::ptr::with_exposed_provenance_mut::<PageTableEntries>(pa.to_direct_map().as_usize()) }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::layout::PAGE_SIZE;

    const NUM_PAGES: usize = 128;

    #[derive(Clone)]
    struct TestPageSource(Arc<Mutex<Inner>>);

    struct Inner {
        pages: Box<[[u8; PAGE_SIZE]]>,
        base: usize,
        free: Vec<usize>,
    }

    impl TestPageSource {
        fn new() -> Self {
            let pages: Box<[[u8; PAGE_SIZE]]> = vec![[0u8; PAGE_SIZE]; NUM_PAGES].into_boxed_slice();
            let base = pages.as_ptr() as usize;
            let free = (0..NUM_PAGES).collect();
            Self(Arc::new(Mutex::new(Inner { pages, base, free })))
        }
    }

    impl PageSource for TestPageSource {
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

    fn new_table() -> PageTable<TestPageSource> {
        PageTable::new(TestPageSource::new())
    }

    #[test]
    fn base_mapping_round_trip() {
        let mut t = new_table();
        let pa = PhysAddr::new(0x8000_2000);
        t.add_mapping(VirtAddr::new(0x1000), pa, PtEntryFlags::RW, Level::L0);
        assert_eq!(t.transform(VirtAddr::new(0x1000)), pa);
        assert_eq!(t.transform(VirtAddr::new(0x1FFF)), pa.byte_add(0xFFF));
        assert_eq!(t.get_page_perm(VirtAddr::new(0x1000)), PtEntryFlags::RW);
    }

    #[test]
    #[should_panic(expected = "collides with an active")]
    fn hugepage_collision_panics() {
        let mut t = new_table();
        t.add_mapping(VirtAddr::new(0x4000_0000), PhysAddr::new(0xC000_0000), PtEntryFlags::R, Level::L2);
        t.add_mapping(VirtAddr::new(0x4000_1000), PhysAddr::new(0xD000_0000), PtEntryFlags::R, Level::L0);
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn unmap_then_transform_panics() {
        let mut t = new_table();
        t.add_mapping(VirtAddr::new(0x1000), PhysAddr::new(0x9000), PtEntryFlags::RW, Level::L0);
        t.del_mapping(VirtAddr::new(0x1000));
        t.transform(VirtAddr::new(0x1000));
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut t1 = new_table();
        let va0 = VirtAddr::new(0x1000);
        t1.add_mapping(va0, PhysAddr::new(0x9000), PtEntryFlags::RW, Level::L0);
        t1.add_mapping(VirtAddr::new(0x2000), PhysAddr::new(0xA000), PtEntryFlags::RW, Level::L0);

        let t2 = t1.clone();
        t1.del_mapping(va0);

        assert_eq!(t2.transform(va0), PhysAddr::new(0x9000));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| t1.transform(va0)));
        assert!(result.is_err());
    }

    #[test]
    fn shared_subtree_visible_and_detachable() {
        let mut t1 = new_table();
        let huge = VirtAddr::new(0);
        t1.add_mapping(VirtAddr::new(0x1000), PhysAddr::new(0x9000), PtEntryFlags::RW, Level::L0);
        t1.add_mapping(VirtAddr::new(0x2000), PhysAddr::new(0xA000), PtEntryFlags::RW, Level::L0);

        let t2 = t1.shared_copy();

        t1.add_mapping(VirtAddr::new(0x3000), PhysAddr::new(0xB000), PtEntryFlags::RW, Level::L0);
        assert_eq!(t2.transform(VirtAddr::new(0x3000)), PhysAddr::new(0xB000));

        let mut t2 = t2;
        t2.shared_detach(huge, VirtAddr::new(HUGE_PAGE_SIZE));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| t2.transform(VirtAddr::new(0x1000))));
        assert!(result.is_err());
        assert_eq!(t1.transform(VirtAddr::new(0x1000)), PhysAddr::new(0x9000));
    }

    #[test]
    fn shared_mark_does_not_leak_owning_tables_own_subtree() {
        let source = TestPageSource::new();
        let mut t = PageTable::new(source.clone());
        t.add_mapping(VirtAddr::new(0x1000), PhysAddr::new(0x9000), PtEntryFlags::RW, Level::L0);
        t.shared_mark(VirtAddr::new(0), VirtAddr::new(HUGE_PAGE_SIZE));
        drop(t);

        assert_eq!(
            source.0.lock().unwrap().free.len(),
            NUM_PAGES,
            "shared_mark's pin marker on the owning table's own L1 page must not stop \
             that table's L0 table from being freed on Drop"
        );
    }

    #[test]
    fn shared_mark_and_attach() {
        let mut t1 = new_table();
        t1.add_mapping(VirtAddr::new(0x1000), PhysAddr::new(0x9000), PtEntryFlags::RW, Level::L0);
        t1.shared_mark(VirtAddr::new(0), VirtAddr::new(HUGE_PAGE_SIZE));

        let mut t2 = new_table();
        t2.shared_attach(&t1, VirtAddr::new(0), VirtAddr::new(HUGE_PAGE_SIZE));
        assert_eq!(t2.transform(VirtAddr::new(0x1000)), PhysAddr::new(0x9000));
    }
}
