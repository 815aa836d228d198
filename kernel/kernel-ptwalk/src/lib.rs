//! # Page-Table Walker
//!
//! Software traversal of the x86-64 4-level paging structures: one-shot
//! virtual-to-physical translation, an incremental cursor for scanning
//! consecutive pages, and free-range search over a virtual address space.
//!
//! ## The walk
//!
//! ```text
//! CR3 ──► L4 (PML4) ──► L3 (PDPT) ──► L2 (PD) ──► L1 (PT) ──► 4 KiB page
//!                         │             │
//!                         │             └── PS=1: 2 MiB leaf
//!                         └──────────────── PS=1: 1 GiB leaf
//! ```
//!
//! Every level is a 4 KiB table of 512 [`PageTableEntry`]s indexed by a
//! 9-bit slice of the virtual address. A walk ends at the first not-present
//! entry, or at a leaf: an L1 entry, or an L3/L2 entry with the PS bit set.
//!
//! ## Incremental scanning
//!
//! Scanning a range one lookup at a time re-reads three intermediate tables
//! per page. [`PageWalk`] keeps those tables cached and
//! [`advance_to`](PageWalk::advance_to) drops only the ones invalidated by
//! the address change, so a linear 4 KiB scan does one table read per page,
//! re-reading upper levels only when a 2 MiB / 1 GiB / 512 GiB boundary is
//! crossed.
//!
//! Table frames are dereferenced through a
//! [`PhysMapper`](kernel_addresses::PhysMapper), never through a hardcoded
//! direct-map offset, which keeps the walker testable on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod entry;
pub mod walker;

pub use entry::{PageTable, PageTableEntry};
pub use walker::{
    PageWalk, Translation, find_free_range, free_run_length_coarse, walk_page_tables,
};

/// The granularity of the leaf entry that terminated a successful walk.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum LeafSize {
    /// Mapped by an L1 (PT) entry.
    Size4K,
    /// Mapped by an L2 (PD) entry with PS set.
    Size2M,
    /// Mapped by an L3 (PDPT) entry with PS set.
    Size1G,
}

impl LeafSize {
    /// The page size in bytes.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 4096,
            Self::Size2M => 2 * 1024 * 1024,
            Self::Size1G => 1024 * 1024 * 1024,
        }
    }
}
