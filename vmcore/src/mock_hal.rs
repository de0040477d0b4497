//! A [`Hal`] backed by atomics, used by this crate's own unit tests and
//! made available to embedders under the `test-util` feature, mirroring
//! the way the teacher keeps its allocator crates `#[cfg(not(test))
//! no_std]` with host-backed `#[cfg(test)]` tests.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::{
    addr::{PhysAddr, VirtAddr},
    hal::Hal,
};

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);
static PAGETABLE_BASE: AtomicUsize = AtomicUsize::new(0);
static TLB_FLUSH_COUNT: AtomicU64 = AtomicU64::new(0);
static REMOTE_FLUSH_COUNT: AtomicU64 = AtomicU64::new(0);

/// A [`Hal`] implementation backed by process-wide atomics, for host tests.
///
/// Not thread-isolated: tests that care about exact counts should call
/// [`MockHal::reset`] and avoid running concurrently with other tests that
/// touch it.
pub struct MockHal;

impl MockHal {
    /// Resets all recorded counters and state.
    pub fn reset() {
        INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
        PAGETABLE_BASE.store(0, Ordering::SeqCst);
        TLB_FLUSH_COUNT.store(0, Ordering::SeqCst);
        REMOTE_FLUSH_COUNT.store(0, Ordering::SeqCst);
    }

    /// Number of local TLB flushes recorded since the last [`Self::reset`].
    pub fn tlb_flush_count() -> u64 {
        TLB_FLUSH_COUNT.load(Ordering::SeqCst)
    }

    /// Number of remote flush requests recorded since the last
    /// [`Self::reset`].
    pub fn remote_flush_count() -> u64 {
        REMOTE_FLUSH_COUNT.load(Ordering::SeqCst)
    }
}

impl Hal for MockHal {
    fn tlb_flush_all() {
        TLB_FLUSH_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    fn tlb_flush(_va: VirtAddr) {
        TLB_FLUSH_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    fn remote_tlb_flush_all() {
        REMOTE_FLUSH_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    fn remote_tlb_flush(_va: VirtAddr, _len: usize) {
        REMOTE_FLUSH_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    fn pagetable_base() -> PhysAddr {
        PhysAddr::new(PAGETABLE_BASE.load(Ordering::SeqCst))
    }

    unsafe fn set_pagetable_base(root: PhysAddr) {
        PAGETABLE_BASE.store(root.as_usize(), Ordering::SeqCst);
    }

    fn is_interrupt_enabled() -> bool {
        INTERRUPTS_ENABLED.load(Ordering::SeqCst)
    }

    fn enable_interrupt() {
        INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
    }

    fn disable_interrupt() {
        INTERRUPTS_ENABLED.store(false, Ordering::SeqCst);
    }

    fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
        panic!("{info}");
    }
}
