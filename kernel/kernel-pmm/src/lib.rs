//! # Physical Memory Manager
//!
//! Tracks every 4 KiB frame of physical RAM in a bitmap and hands out
//! single frames, contiguous runs, and aligned 2 MiB / 1 GiB huge frames.
//!
//! ## Layers
//!
//! | Layer | Type | Role |
//! |-------|------|------|
//! | Bit store | [`Bitmap`] | Raw set/clear/scan over borrowed bytes. |
//! | Allocator | [`FrameAllocator`] | Memory-map aware frame accounting. |
//! | Facade | [`PhysicalMemoryManager`] | Spin-locked shared handle. |
//!
//! The allocator never owns heap memory; its bitmap is carved out of the
//! boot memory map itself and reached through a
//! [`PhysMapper`](kernel_addresses::PhysMapper). This keeps the crate fully
//! testable on the host with fake physical RAM.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bitmap;
pub mod frame;
pub mod memory_map;

pub use bitmap::Bitmap;
pub use frame::{FRAMES_PER_1G, FRAMES_PER_2M, FrameAllocator, FrameInitError};
pub use memory_map::{MemoryRegion, RegionKind, log_memory_map};

use kernel_addresses::{PhysMapper, PhysicalAddress};
use kernel_sync::SpinLock;

/// Spin-locked [`FrameAllocator`] for shared use across cores.
///
/// Every method takes the lock for the duration of a single allocator
/// operation; nothing is held across calls.
pub struct PhysicalMemoryManager {
    inner: SpinLock<FrameAllocator>,
}

impl PhysicalMemoryManager {
    /// Build the allocator from the platform memory map and wrap it.
    ///
    /// # Safety
    /// See [`FrameAllocator::init`].
    pub unsafe fn init<M: PhysMapper>(
        regions: &[MemoryRegion],
        mapper: &M,
    ) -> Result<Self, FrameInitError> {
        let allocator = unsafe { FrameAllocator::init(regions, mapper)? };
        Ok(Self {
            inner: SpinLock::new(allocator),
        })
    }

    /// Allocate a single 4 KiB frame.
    pub fn alloc_frame(&self) -> Option<PhysicalAddress> {
        self.inner.lock().alloc_frames(1)
    }

    /// Allocate `count` contiguous 4 KiB frames.
    pub fn alloc_frames(&self, count: usize) -> Option<PhysicalAddress> {
        self.inner.lock().alloc_frames(count)
    }

    /// Allocate `count` contiguous 2 MiB-aligned huge frames.
    pub fn alloc_frames_2m(&self, count: usize) -> Option<PhysicalAddress> {
        self.inner.lock().alloc_frames_2m(count)
    }

    /// Allocate `count` contiguous 1 GiB-aligned huge frames.
    pub fn alloc_frames_1g(&self, count: usize) -> Option<PhysicalAddress> {
        self.inner.lock().alloc_frames_1g(count)
    }

    /// Free a single 4 KiB frame.
    pub fn free_frame(&self, addr: PhysicalAddress) {
        self.inner.lock().free_frame(addr);
    }

    /// Free `count` contiguous frames starting at `addr`.
    pub fn free_frames(&self, addr: PhysicalAddress, count: usize) {
        self.inner.lock().free_frames(addr, count);
    }

    /// Free one 2 MiB huge allocation.
    pub fn free_frames_2m(&self, addr: PhysicalAddress) {
        self.inner.lock().free_frames_2m(addr);
    }

    /// Free one 1 GiB huge allocation.
    pub fn free_frames_1g(&self, addr: PhysicalAddress) {
        self.inner.lock().free_frames_1g(addr);
    }

    /// Frames currently free.
    pub fn usable_frames(&self) -> usize {
        self.inner.lock().usable_frames()
    }

    /// Usable frames discovered at init.
    pub fn origin_frames(&self) -> usize {
        self.inner.lock().origin_frames()
    }

    /// End address of the highest usable region.
    pub fn memory_size(&self) -> u64 {
        self.inner.lock().memory_size()
    }

    /// Run `f` with the allocator locked, for compound operations that must
    /// not interleave with other cores.
    pub fn with_allocator<R>(&self, f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
        self.inner.with_lock(f)
    }
}
