//! Fixed Sv39 address-space layout.
//!
//! Unlike the teacher's `memory::layout`, which documents a whole qemu
//! `virt` machine's MMIO map, this crate only fixes the handful of
//! constants the page-table engine and allocators need to agree on. The
//! embedding kernel owns device/MMIO placement; it maps those regions
//! through the page-table engine using ordinary [`crate::page_table`]
//! calls.

use crate::addr::{PhysAddr, VirtAddr};

/// Size of a base (L0) page: 4 KiB.
pub const PAGE_SIZE: usize = 1 << 12;
/// Size of a mid (L1) page: 2 MiB.
pub const MID_PAGE_SIZE: usize = 1 << 21;
/// Size of a huge (L2) page: 1 GiB.
pub const HUGE_PAGE_SIZE: usize = 1 << 30;

/// Start of the user address range.
pub const USER_START: VirtAddr = VirtAddr::new_const(1 << 30);
/// End (exclusive) of the user address range.
pub const USER_END: VirtAddr = VirtAddr::new_const(256 << 30);

/// Base of the direct physical map: `DIRECT_MAP_BASE + pa` is valid for
/// `pa` in `[0, DIRECT_MAP_SIZE)`.
///
/// Host unit tests never run with real physical RAM behind a direct map,
/// so under `cfg(test)` this collapses to an identity mapping over the
/// whole address space: the host heap memory standing in for "physical"
/// pages in tests is used directly as both PA and VA, the same way the
/// teacher's allocator tests use a plain `Box<[u8]>` as a fake physical
/// range without any translation layer at all.
#[cfg(not(test))]
pub const DIRECT_MAP_BASE: usize = 0xFFFF_FFC0_0000_0000;
#[cfg(test)]
pub const DIRECT_MAP_BASE: usize = 0;

/// Size of the physical range reachable through the direct map.
#[cfg(not(test))]
pub const DIRECT_MAP_SIZE: usize = 128 << 30;
#[cfg(test)]
pub const DIRECT_MAP_SIZE: usize = usize::MAX;

/// Start of the vmalloc window.
pub const VMALLOC_START: VirtAddr = VirtAddr::new_const(0xFFFF_FFE0_0000_0000);
/// End (exclusive) of the vmalloc window.
pub const VMALLOC_END: VirtAddr = VirtAddr::new_const(0xFFFF_FFF4_0000_0000);

/// Start of the kernel image window.
pub const KERNEL_IMAGE_START: VirtAddr = VirtAddr::new_const(0xFFFF_FFFF_0000_0000);

/// Whether `pa` lies within the direct-map-addressable physical window.
#[must_use]
pub fn is_direct_mappable(pa: PhysAddr) -> bool {
    pa.as_usize() < DIRECT_MAP_SIZE
}
