//! The page-table entry type and the level geometry of the three-level
//! Sv39 tree.
//!
//! Grounded on the teacher's `memory::page_table::entry`: a `bitflags!`
//! flag set over a `#[derive(Pod)] #[repr(transparent)]` word, with getter
//! methods gated on `is_leaf`/`is_non_leaf`. The teacher's copy-on-write
//! machinery (`make_copy_on_write`, `request_user_write`, and the COW `C`
//! bit) has no counterpart here: this engine shares subtrees explicitly
//! via a `SHARED` bit instead, never splits pages lazily on write fault.

use core::alloc::{AllocError, Allocator, Layout};
use core::ptr::NonNull;

use bitflags::bitflags;
use dataview::Pod;

use crate::addr::{PhysAddr, VirtAddr};
use crate::layout::PAGE_SIZE;

bitflags! {
    /// Flags carried by a page-table entry, Sv39 bit-for-bit.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
        /// Global.
        const G = 1 << 5;
        /// Accessed.
        const A = 1 << 6;
        /// Dirty.
        const D = 1 << 7;
        /// This core's subtree-sharing marker: on an interior PTE, "this
        /// table does not own the pointed-to page"; on PTE index 0 of an
        /// L1 page, "this page is pinned because some table borrows it".
        const SHARED = 1 << 8;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

/// The subset of [`PtEntryFlags`] a caller may request for a leaf mapping:
/// `R`, `W`, `X`, `U`. Carried as a `PtEntryFlags` value for convenience;
/// [`PageTable::add_mapping`](super::PageTable::add_mapping) asserts it
/// intersects `RWX`.
pub type Perm = PtEntryFlags;

const FLAGS_MASK: usize = 0x1FF;
const PPN_SHIFT: u32 = 10;

/// A single Sv39 page-table entry.
#[repr(transparent)]
#[derive(Clone, Copy, Pod)]
pub struct PtEntry(usize);

impl PtEntry {
    /// The all-zero, invalid entry.
    pub const INVALID: Self = Self(0);

    /// Builds an entry pointing at `ppn` with the given flags.
    ///
    /// # Panics
    ///
    /// Panics if `flags` contains bits outside [`FLAGS_MASK`](module
    /// constant) or `ppn` does not fit in the PPN field.
    #[must_use]
    pub fn new(ppn: usize, flags: PtEntryFlags) -> Self {
        assert_eq!(flags.bits() & !FLAGS_MASK, 0, "flags out of range: {flags:?}");
        assert!(ppn < (1 << (usize::BITS - PPN_SHIFT)), "ppn out of range: {ppn:#x}");
        Self((ppn << PPN_SHIFT) | flags.bits())
    }

    /// Builds a leaf entry mapping `pa` with `perm` and `V` set.
    #[must_use]
    pub fn leaf(pa: PhysAddr, perm: Perm) -> Self {
        assert!(perm.intersects(PtEntryFlags::RWX), "leaf entry needs R, W, or X");
        Self::new(pa.page_number(), perm | PtEntryFlags::V)
    }

    /// Builds an interior entry pointing at the table page `pa`.
    #[must_use]
    pub fn interior(pa: PhysAddr) -> Self {
        Self::new(pa.page_number(), PtEntryFlags::V)
    }

    #[must_use]
    pub fn flags(self) -> PtEntryFlags {
        PtEntryFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    #[must_use]
    pub fn phys_page_num(self) -> usize {
        self.0 >> PPN_SHIFT
    }

    #[must_use]
    pub fn phys_addr(self) -> PhysAddr {
        PhysAddr::new(self.phys_page_num() << 12)
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    #[must_use]
    pub fn is_leaf(self) -> bool {
        self.flags().intersects(PtEntryFlags::RWX)
    }

    #[must_use]
    pub fn is_non_leaf(self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    #[must_use]
    pub fn is_shared(self) -> bool {
        self.flags().contains(PtEntryFlags::SHARED)
    }

    #[must_use]
    pub fn perm(self) -> Perm {
        self.flags() & PtEntryFlags::URWX
    }

    pub fn set_shared(&mut self, shared: bool) {
        let mut flags = self.flags();
        flags.set(PtEntryFlags::SHARED, shared);
        *self = Self::new(self.phys_page_num(), flags);
    }

    pub fn set_perm(&mut self, perm: Perm) {
        assert!(perm.intersects(PtEntryFlags::RWX));
        let flags = (self.flags() - PtEntryFlags::URWX) | (perm & PtEntryFlags::URWX);
        *self = Self::new(self.phys_page_num(), flags | PtEntryFlags::V);
    }

    pub fn clear(&mut self) {
        *self = Self::INVALID;
    }
}

/// The three Sv39 table levels, root first.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum Level {
    L2 = 2,
    L1 = 1,
    L0 = 0,
}

impl Level {
    /// Bit shift to the index field for this level.
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self as u32)
    }

    /// Size of a leaf mapping at this level: BASE (4 KiB), MID (2 MiB), or
    /// HUGE (1 GiB).
    #[must_use]
    pub const fn page_size(self) -> usize {
        1 << self.shift()
    }

    /// Extracts this level's 9-bit index out of `va`.
    #[must_use]
    pub const fn index(self, va: VirtAddr) -> usize {
        (va.as_usize() >> self.shift()) & 0x1FF
    }

    /// The next level down, or `None` at L0.
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::L2 => Some(Self::L1),
            Self::L1 => Some(Self::L0),
            Self::L0 => None,
        }
    }

    /// `self as usize`, i.e. the number of levels below this one.
    #[must_use]
    pub const fn depth(self) -> usize {
        self as usize
    }
}

/// A source of zeroed physical pages the page-table engine uses to back
/// its own interior and (when requested) leaf pages.
///
/// Grounded on the teacher's `memory::page::PageFrameAllocator`, which
/// implements `core::alloc::Allocator` by delegating to a single global
/// page pool. We generalize it to a trait so the engine can be driven by
/// either the boot bump allocator or the free-list allocator, and so host
/// tests can supply a fake page source without any global state.
pub trait PageSource: Clone {
    /// Returns a freshly zeroed page, or `None` if the source is
    /// exhausted.
    fn alloc_zeroed_page(&self) -> Option<PhysAddr>;

    /// Returns `pa` to the source.
    ///
    /// # Safety
    ///
    /// `pa` must have been returned by [`Self::alloc_zeroed_page`] on this
    /// same source and not already freed.
    unsafe fn dealloc_page(&self, pa: PhysAddr);
}

/// Adapts a [`PageSource`] into a `core::alloc::Allocator` so page tables
/// can be backed by `Box<_, TableAllocator<S>>`.
#[derive(Clone)]
pub struct TableAllocator<S: PageSource>(pub S);

unsafe impl<S: PageSource> Allocator for TableAllocator<S> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        assert!(layout.size() <= PAGE_SIZE, "page-table allocations are page-sized");
        assert!(PAGE_SIZE % layout.align() == 0, "page-table allocations are page-aligned");
        let pa = self.0.alloc_zeroed_page().ok_or(AllocError)?;
        let va = pa.to_direct_map();
        let ptr = NonNull::new(core::ptr::with_exposed_provenance_mut::<u8>(va.as_usize())).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, PAGE_SIZE))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        let va = VirtAddr::new(ptr.as_ptr().expose_provenance());
        let pa = va.from_direct_map();
        unsafe { self.0.dealloc_page(pa) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_geometry() {
        assert_eq!(Level::L0.page_size(), PAGE_SIZE);
        assert_eq!(Level::L1.page_size(), crate::layout::MID_PAGE_SIZE);
        assert_eq!(Level::L2.page_size(), crate::layout::HUGE_PAGE_SIZE);
        assert_eq!(Level::L2.child(), Some(Level::L1));
        assert_eq!(Level::L0.child(), None);
    }

    #[test]
    fn entry_round_trip() {
        let pa = PhysAddr::new(0x1234_5000);
        let e = PtEntry::leaf(pa, PtEntryFlags::RW);
        assert!(e.is_valid());
        assert!(e.is_leaf());
        assert_eq!(e.phys_addr(), pa);
        assert_eq!(e.perm(), PtEntryFlags::RW);
    }

    #[test]
    fn interior_is_not_leaf() {
        let e = PtEntry::interior(PhysAddr::new(0x2000));
        assert!(e.is_valid());
        assert!(!e.is_leaf());
        assert!(e.is_non_leaf());
    }

    #[test]
    fn shared_bit_round_trips() {
        let mut e = PtEntry::interior(PhysAddr::new(0x3000));
        assert!(!e.is_shared());
        e.set_shared(true);
        assert!(e.is_shared());
        assert!(e.is_non_leaf(), "SHARED must not look like a leaf");
        e.set_shared(false);
        assert!(!e.is_shared());
    }
}
