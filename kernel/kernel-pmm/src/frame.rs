//! Bitmap-indexed physical frame allocator.
//!
//! One bit per 4 KiB frame, 1 = free. Built once at boot from the platform
//! memory map; the bitmap's own backing bytes are carved out of the first
//! usable region large enough to host them and are reached through the
//! injected [`PhysMapper`].
//!
//! The allocator has no internal locking; callers serialize access (see
//! [`PhysicalMemoryManager`](crate::PhysicalMemoryManager)).

use core::ptr::NonNull;

use kernel_addresses::{PageSize, PhysMapper, PhysicalAddress, Size1G, Size2M, Size4K};

use crate::bitmap::Bitmap;
use crate::memory_map::MemoryRegion;

/// 4 KiB frames per 2 MiB huge page.
pub const FRAMES_PER_2M: usize = (Size2M::SIZE / Size4K::SIZE) as usize;
/// 4 KiB frames per 1 GiB huge page.
pub const FRAMES_PER_1G: usize = (Size1G::SIZE / Size4K::SIZE) as usize;

const _: () = assert!(FRAMES_PER_2M == 512);
const _: () = assert!(FRAMES_PER_1G == 262_144);

/// Failure to bring up the frame allocator from the boot memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameInitError {
    #[error("memory map contains no usable region")]
    NoUsableMemory,
    #[error("no usable region can host the {0}-byte frame bitmap")]
    BitmapDoesNotFit(usize),
}

/// Physical frame allocator over a free-frame bitmap.
///
/// Frame 0 is never handed out; it is reserved as the "no frame" sentinel so
/// a zero physical address can never be a live allocation.
#[derive(Debug)]
pub struct FrameAllocator {
    bitmap: Bitmap,
    /// Usable frames discovered at init, before reservations.
    origin_frames: usize,
    /// Frames currently free. Always equals the number of set bits within
    /// the originally-usable region.
    usable_frames: usize,
    /// End address of the highest usable region.
    memory_size: u64,
}

impl FrameAllocator {
    /// Build the allocator from the platform memory map.
    ///
    /// The bitmap covers every frame up to the end of the highest usable
    /// region. All usable frames are marked free first; only then are the
    /// bitmap's own backing frames (and frame 0) re-marked allocated, so the
    /// bitmap storage can never be handed out. The ordering of the two
    /// passes is load-bearing.
    ///
    /// # Safety
    /// - `mapper` must give access to the physical range that ends up
    ///   hosting the bitmap, and that memory must be otherwise unused.
    /// - Must be called at most once per physical address space.
    pub unsafe fn init<M: PhysMapper>(
        regions: &[MemoryRegion],
        mapper: &M,
    ) -> Result<Self, FrameInitError> {
        let memory_size = regions
            .iter()
            .filter(|r| r.is_usable())
            .map(MemoryRegion::end)
            .max()
            .ok_or(FrameInitError::NoUsableMemory)?;

        let frame_count = (memory_size / Size4K::SIZE) as usize;
        let bitmap_bytes = frame_count.div_ceil(8);

        // First fit: the bitmap lives at the base of the first usable region
        // that can hold it.
        let host = regions
            .iter()
            .find(|r| r.is_usable() && r.length >= bitmap_bytes as u64)
            .ok_or(FrameInitError::BitmapDoesNotFit(bitmap_bytes))?;
        let bitmap_addr = host.base;
        debug_assert!(bitmap_addr.is_aligned::<Size4K>());
        log::debug!("frame: bitmap at {bitmap_addr} ({bitmap_bytes} bytes, {frame_count} frames tracked)");

        let buffer = unsafe {
            // Safety: PhysMapper guarantees a valid, non-null pointer for
            // mapped physical memory.
            NonNull::new_unchecked(mapper.phys_to_ptr(bitmap_addr))
        };
        let mut bitmap = unsafe { Bitmap::from_raw(buffer, bitmap_bytes) };

        let mut origin_frames = 0usize;
        for region in regions.iter().filter(|r| r.is_usable()) {
            let start = region.first_frame();
            let count = region.frame_count();
            origin_frames += count;
            bitmap.set_range(start, start + count, true);
            log::debug!(
                "frame: marked {count:#x} frames from {} as usable",
                region.base
            );
        }

        // Reserve only bits actually flipped: a host region whose length is
        // not a whole number of frames marks fewer frames free than the
        // bitmap occupies, and the partial trailing frame was never free.
        let bitmap_frame_start = bitmap_addr.frame_index();
        let bitmap_frame_count = bitmap_bytes.div_ceil(Size4K::SIZE as usize);
        let bitmap_frame_end = (bitmap_frame_start + bitmap_frame_count).min(bitmap.len());
        let mut reserved_frames = 0usize;
        for frame in bitmap_frame_start..bitmap_frame_end {
            if bitmap.get(frame) {
                bitmap.set(frame, false);
                reserved_frames += 1;
            }
        }
        log::debug!("frame: reserved {reserved_frames:#x} frames for the bitmap at {bitmap_addr}");

        // Frame 0 doubles as the "no frame" sentinel and is never issued.
        if !bitmap.is_empty() && bitmap.get(0) {
            bitmap.set(0, false);
            reserved_frames += 1;
        }

        let usable_frames = origin_frames - reserved_frames;
        log::info!(
            "frame: {origin_frames:#x} usable frames total, {usable_frames:#x} free after reservations"
        );

        Ok(Self {
            bitmap,
            origin_frames,
            usable_frames,
            memory_size,
        })
    }

    /// Usable frames discovered at init, before any reservation.
    #[inline]
    #[must_use]
    pub const fn origin_frames(&self) -> usize {
        self.origin_frames
    }

    /// Frames currently free.
    #[inline]
    #[must_use]
    pub const fn usable_frames(&self) -> usize {
        self.usable_frames
    }

    /// End address of the highest usable region.
    #[inline]
    #[must_use]
    pub const fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// Allocate `count` contiguous 4 KiB frames.
    ///
    /// Returns the base address of the run, or `None` when no run of that
    /// length is free. No alignment beyond 4 KiB is guaranteed; use the
    /// huge-page variants for 2 MiB / 1 GiB alignment.
    pub fn alloc_frames(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        let index = self.bitmap.find_range(count, true)?;
        self.bitmap.set_range(index, index + count, false);
        self.usable_frames -= count;
        Some(PhysicalAddress::from_frame_index(index))
    }

    /// Allocate `count` contiguous 2 MiB-aligned huge frames.
    pub fn alloc_frames_2m(&mut self, count: usize) -> Option<PhysicalAddress> {
        self.alloc_aligned(count, FRAMES_PER_2M)
    }

    /// Allocate `count` contiguous 1 GiB-aligned huge frames.
    pub fn alloc_frames_1g(&mut self, count: usize) -> Option<PhysicalAddress> {
        self.alloc_aligned(count, FRAMES_PER_1G)
    }

    /// Search aligned windows of `stride` frames for `count * stride` free
    /// frames. A plain first-fit scan cannot guarantee the alignment the
    /// hardware requires for huge pages, hence the dedicated stride walk.
    fn alloc_aligned(&mut self, count: usize, stride: usize) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        let total = count * stride;
        let mut window = 0usize;
        while window + total <= self.bitmap.len() {
            if self.bitmap.range_all(window, window + total, true) {
                self.bitmap.set_range(window, window + total, false);
                self.usable_frames -= total;
                return Some(PhysicalAddress::from_frame_index(window));
            }
            window += stride;
        }
        None
    }

    /// Free a single 4 KiB frame. Address 0 (the sentinel) is a no-op.
    pub fn free_frame(&mut self, addr: PhysicalAddress) {
        self.free_frames(addr, 1);
    }

    /// Free `count` contiguous frames starting at `addr`.
    ///
    /// The frames must come from a matching allocation; double frees are not
    /// detected. Address 0 and zero counts are no-ops.
    pub fn free_frames(&mut self, addr: PhysicalAddress, count: usize) {
        if addr.is_zero() || count == 0 {
            return;
        }
        let frame = addr.frame_index();
        if frame == 0 {
            return;
        }
        debug_assert!(frame + count <= self.bitmap.len());
        self.bitmap.set_range(frame, frame + count, true);
        self.usable_frames += count;
    }

    /// Free one 2 MiB huge allocation.
    pub fn free_frames_2m(&mut self, addr: PhysicalAddress) {
        debug_assert!(addr.is_aligned::<Size2M>());
        self.free_frames(addr, FRAMES_PER_2M);
    }

    /// Free one 1 GiB huge allocation.
    pub fn free_frames_1g(&mut self, addr: PhysicalAddress) {
        debug_assert!(addr.is_aligned::<Size1G>());
        self.free_frames(addr, FRAMES_PER_1G);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::RegionKind;

    /// Fake physical RAM: backs `[base, base + len)` with host memory so the
    /// allocator can place its bitmap there.
    struct TestRam {
        base: u64,
        bytes: Vec<u8>,
    }

    impl TestRam {
        fn new(base: u64, len: usize) -> Self {
            Self {
                base,
                bytes: vec![0u8; len],
            }
        }
    }

    impl PhysMapper for TestRam {
        unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let off = (pa.as_u64() - self.base) as usize;
            assert!(off < self.bytes.len(), "unmapped test address {pa}");
            unsafe { self.bytes.as_ptr().add(off) as *mut u8 }
        }
    }

    const MIB: u64 = 1024 * 1024;

    /// One usable 16 MiB region at 1 MiB, everything else reserved.
    fn simple_map() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion::new(0, 0x1000, RegionKind::Reserved),
            MemoryRegion::new(0x10_0000, 16 * MIB, RegionKind::Usable),
        ]
    }

    fn simple_allocator(ram: &TestRam) -> FrameAllocator {
        unsafe { FrameAllocator::init(&simple_map(), ram).expect("init") }
    }

    /// The number of free bits within the originally-usable region.
    fn live_free_bits(alloc: &FrameAllocator) -> usize {
        (0..alloc.bitmap.len()).filter(|&i| alloc.bitmap.get(i)).count()
    }

    #[test]
    fn init_scenario_bookkeeping() {
        let ram = TestRam::new(0x10_0000, 16 * MIB as usize);
        let alloc = simple_allocator(&ram);

        // 16 MiB of usable frames; the 544-byte bitmap costs one frame.
        assert_eq!(alloc.origin_frames(), 4096);
        assert_eq!(alloc.usable_frames(), 4095);
        assert_eq!(alloc.memory_size(), 0x110_0000);
        assert_eq!(live_free_bits(&alloc), 4095);
    }

    #[test]
    fn alloc_and_free_restore_counts() {
        let ram = TestRam::new(0x10_0000, 16 * MIB as usize);
        let mut alloc = simple_allocator(&ram);

        let addr = alloc.alloc_frames(1).expect("one frame");
        assert!((0x10_0000..0x110_0000).contains(&addr.as_u64()));
        assert_eq!(alloc.usable_frames(), 4094);
        assert_eq!(live_free_bits(&alloc), 4094);

        alloc.free_frame(addr);
        assert_eq!(alloc.usable_frames(), 4095);
        assert_eq!(live_free_bits(&alloc), 4095);
    }

    #[test]
    fn interleaved_allocations_never_overlap() {
        let ram = TestRam::new(0x10_0000, 16 * MIB as usize);
        let mut alloc = simple_allocator(&ram);

        let a = alloc.alloc_frames(4).unwrap();
        let b = alloc.alloc_frames(2).unwrap();
        alloc.free_frames(a, 4);
        let c = alloc.alloc_frames(3).unwrap();
        let d = alloc.alloc_frames(5).unwrap();

        let live = [(b, 2usize), (c, 3), (d, 5)];
        for (i, &(base, count)) in live.iter().enumerate() {
            for &(other, other_count) in &live[i + 1..] {
                let end = base.as_u64() + (count as u64) * 4096;
                let other_end = other.as_u64() + (other_count as u64) * 4096;
                assert!(
                    end <= other.as_u64() || other_end <= base.as_u64(),
                    "overlap between {base} and {other}"
                );
            }
        }
        assert_eq!(alloc.usable_frames(), 4095 - 2 - 3 - 5);
        assert_eq!(live_free_bits(&alloc), alloc.usable_frames());
    }

    #[test]
    fn exhaustion_returns_none_and_keeps_counts() {
        let ram = TestRam::new(0x10_0000, 16 * MIB as usize);
        let mut alloc = simple_allocator(&ram);

        assert!(alloc.alloc_frames(5000).is_none());
        assert_eq!(alloc.usable_frames(), 4095);
        assert!(alloc.alloc_frames(0).is_none());
    }

    #[test]
    fn huge_2m_allocations_are_aligned() {
        let ram = TestRam::new(0x10_0000, 16 * MIB as usize);
        let mut alloc = simple_allocator(&ram);

        let addr = alloc.alloc_frames_2m(1).expect("2M window");
        assert_eq!(addr.as_u64() % Size2M::SIZE, 0);
        assert_eq!(alloc.usable_frames(), 4095 - FRAMES_PER_2M);

        alloc.free_frames_2m(addr);
        assert_eq!(alloc.usable_frames(), 4095);
        assert_eq!(live_free_bits(&alloc), 4095);
    }

    #[test]
    fn huge_1g_allocations_are_aligned() {
        // 1 GiB of claimed RAM at 1 GiB; only the bitmap host region needs
        // real backing bytes.
        let bitmap_host = MemoryRegion::new(0x10_0000, 128 * 1024, RegionKind::Usable);
        let regions = vec![
            bitmap_host,
            MemoryRegion::new(0x4000_0000, 0x4000_0000, RegionKind::Usable),
        ];
        let ram = TestRam::new(0x10_0000, 128 * 1024);
        let mut alloc = unsafe { FrameAllocator::init(&regions, &ram).expect("init") };

        let addr = alloc.alloc_frames_1g(1).expect("1G window");
        assert_eq!(addr.as_u64() % Size1G::SIZE, 0);
        assert_eq!(addr.as_u64(), 0x4000_0000);

        alloc.free_frames_1g(addr);
        assert_eq!(live_free_bits(&alloc), alloc.usable_frames());
    }

    #[test]
    fn huge_alloc_fails_without_aligned_window() {
        // Usable memory never covers a whole aligned 2 MiB window.
        let regions = vec![MemoryRegion::new(0x10_0000, MIB, RegionKind::Usable)];
        let ram = TestRam::new(0x10_0000, MIB as usize);
        let mut alloc = unsafe { FrameAllocator::init(&regions, &ram).expect("init") };

        assert!(alloc.alloc_frames_2m(1).is_none());
        assert!(alloc.alloc_frames(1).is_some());
    }

    #[test]
    fn frame_zero_is_never_issued() {
        // Usable RAM starting at physical 0: the sentinel frame must stay
        // reserved even after the bitmap takes its own frames.
        let regions = vec![MemoryRegion::new(0, 64 * 1024, RegionKind::Usable)];
        let ram = TestRam::new(0, 64 * 1024);
        let mut alloc = unsafe { FrameAllocator::init(&regions, &ram).expect("init") };

        while let Some(addr) = alloc.alloc_frames(1) {
            assert_ne!(addr.as_u64(), 0);
        }
        // Freeing the sentinel is a no-op.
        let before = alloc.usable_frames();
        alloc.free_frame(PhysicalAddress::zero());
        assert_eq!(alloc.usable_frames(), before);
    }

    #[test]
    fn unaligned_host_region_keeps_counts_consistent() {
        // The host region is 8500 bytes: enough for the 8500-byte bitmap,
        // but only two whole frames, while the bitmap's bytes span three.
        // The reservation must count the bits it flips, not the frames the
        // bitmap touches, or `usable_frames` drifts from the bitmap.
        let host_len = 8500u64;
        let regions = vec![
            MemoryRegion::new(0x10_0000, host_len, RegionKind::Usable),
            MemoryRegion::new(0x1000_0000, 0x9A_0000, RegionKind::Usable),
        ];
        let ram = TestRam::new(0x10_0000, 3 * 4096);
        let alloc = unsafe { FrameAllocator::init(&regions, &ram).expect("init") };

        // memory_size 0x109A_0000 -> 68000 frames -> exactly 8500 bitmap
        // bytes. The host contributes 2 usable frames, both reserved.
        assert_eq!(alloc.origin_frames(), 2 + 0x9A0);
        assert_eq!(alloc.usable_frames(), 0x9A0);
        assert_eq!(live_free_bits(&alloc), alloc.usable_frames());
    }

    #[test]
    fn init_errors() {
        let ram = TestRam::new(0, 4096);
        let no_usable = vec![MemoryRegion::new(0, 4 * MIB, RegionKind::Reserved)];
        assert_eq!(
            unsafe { FrameAllocator::init(&no_usable, &ram).unwrap_err() },
            FrameInitError::NoUsableMemory
        );

        // A huge claimed memory size with only a tiny usable region: the
        // bitmap cannot be hosted anywhere.
        let tiny = vec![
            MemoryRegion::new(0x1000, 0x1000, RegionKind::Usable),
            MemoryRegion::new(0x40_0000_0000, 0x1000, RegionKind::Usable),
        ];
        assert!(matches!(
            unsafe { FrameAllocator::init(&tiny, &ram) },
            Err(FrameInitError::BitmapDoesNotFit(_))
        ));
    }
}
