//! The architecture hardware-abstraction seam this crate consumes.
//!
//! Everything in `§6 External Interfaces` that is not the single SBI
//! remote-flush ecall (see [`crate::sbi`]) is expressed here as a trait
//! rather than implemented: boot/trap assembly, per-architecture register
//! touches, and the panic harness belong to the embedding kernel. Keeping
//! this as a trait (instead of a set of `extern "C"` globals, as the old
//! xv6-derived `kernel` crate did) is what lets the page table and
//! allocators run their unit tests on the host via [`crate::mock_hal`].

use crate::addr::{PhysAddr, VirtAddr};

/// Architecture hooks consumed by the page-table engine and spinlock.
pub trait Hal {
    /// Flushes this hart's entire TLB.
    fn tlb_flush_all();

    /// Flushes this hart's TLB entry for `va`.
    fn tlb_flush(va: VirtAddr);

    /// Requests that every other hart flush its entire TLB, and waits for
    /// acknowledgement.
    fn remote_tlb_flush_all();

    /// Requests that every other hart flush `[va, va + len)`, and waits
    /// for acknowledgement.
    fn remote_tlb_flush(va: VirtAddr, len: usize);

    /// Reads the physical address of the currently installed page-table
    /// root.
    fn pagetable_base() -> PhysAddr;

    /// Installs `root` as the active page-table root (e.g. writes SATP)
    /// and flushes this hart's TLB.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid Sv39 root table that
    /// maps at least the currently executing code and stack.
    unsafe fn set_pagetable_base(root: PhysAddr);

    /// Returns whether this hart currently has interrupts enabled.
    fn is_interrupt_enabled() -> bool;

    /// Enables interrupts on this hart.
    fn enable_interrupt();

    /// Disables interrupts on this hart.
    fn disable_interrupt();

    /// Handles a Rust panic originating anywhere in this crate: logs
    /// `info` and halts or idles this hart forever.
    ///
    /// The embedding kernel's own `#[panic_handler]` is expected to
    /// delegate here (after whatever cross-hart shutdown signaling it
    /// needs) rather than this crate defining one itself, since a
    /// `#[panic_handler]` may only be defined once in the final binary.
    fn panic_handler(info: &core::panic::PanicInfo<'_>) -> !;
}
