//! Sv39 virtual memory core: a page-table engine and the tiered kernel
//! allocators built on top of it.
//!
//! This crate owns no boot or trap surface. It is parameterized over a
//! small [`hal::Hal`] trait for the architecture-specific register touches
//! (TLB invalidation, SATP installation, interrupt masking) so that the
//! page-table and allocator logic can be unit-tested on the host as well as
//! cross-compiled to `riscv64imac-unknown-none-elf`.

#![cfg_attr(not(test), no_std)]
#![feature(allocator_api)]

extern crate alloc;

pub mod addr;
pub mod alloc_core;
pub mod error;
pub mod hal;
pub mod init;
pub mod layout;
pub mod page_table;
pub mod sbi;
pub mod sync;

#[cfg(any(test, feature = "test-util"))]
pub mod mock_hal;

pub use addr::{PhysAddr, VirtAddr};
pub use error::VmError;
/// Re-exported so embedders can park a [`init::KernelMemory`] (or any
/// other tier) in their own `'static` storage without a direct
/// dependency on `once_init` themselves.
pub use once_init::OnceInit;
