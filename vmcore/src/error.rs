//! Recoverable error conditions.
//!
//! Invariant violations (misaligned addresses passed to an aligned
//! interface, double-mapping, unmapping something unmapped, freeing an
//! unknown vmalloc region, destroying a singleton allocator, a corrupted
//! page-table walk) are bugs, not values: they `panic!`/`assert!` rather
//! than returning through this type.

/// A recoverable failure from the allocators or page-table engine.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The page allocator has no run of the requested length.
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    /// No gap of the requested size exists in the vmalloc window.
    #[error("no vmalloc gap large enough for the request")]
    GapNotFound,
    /// A zero-size allocation was requested.
    #[error("zero-size allocation requested")]
    ZeroSizeRequest,
}
