//! # Typed Memory Addresses
//!
//! Strongly typed wrappers for raw memory addresses used by the physical
//! memory manager and the page-table walker.
//!
//! ## Overview
//!
//! Zero-cost newtypes over `u64` that prevent mixing virtual and physical
//! addresses at compile time:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | An address on the physical bus (RAM / MMIO). |
//! | [`VirtualAddress`] | A page-table translated address. |
//! | [`TableIndex`] | A 9-bit index into a 512-entry page table. |
//!
//! [`VirtualAddress`] knows how an x86-64 address decomposes for the 4-level
//! walk:
//!
//! ```text
//! | 47..39 | 38..30 | 29..21 | 20..12 | 11..0  |
//! |   L4   |   L3   |   L2   |   L1   | Offset |
//! ```
//!
//! ## Page Sizes
//!
//! The three x86-64 leaf granularities are expressed as marker types
//! implementing [`PageSize`]: [`Size4K`], [`Size2M`] and [`Size1G`]. The
//! trait's [`SIZE`](PageSize::SIZE) and [`SHIFT`](PageSize::SHIFT) constants
//! drive all alignment arithmetic.
//!
//! ## Physical-to-virtual translation
//!
//! Code that must dereference physical memory (page-table frames, the frame
//! bitmap) does so through the [`PhysMapper`] capability instead of a global
//! offset. [`HhdmMapper`] is the standard fixed-offset (higher-half direct
//! map) implementation.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 2 MiB page (`2_097_152` bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;

    fn as_str() -> &'static str {
        "2M"
    }
}

/// 1 GiB page (`1_073_741_824` bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;
impl sealed::Sealed for Size1G {}
impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;

    fn as_str() -> &'static str {
        "1G"
    }
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size2M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size1G {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; no runtime checks are performed.
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two. `x + (a - 1)` must not overflow;
/// use [`checked_align_up`] near the top of the address space.
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Overflow-aware variant of [`align_up`].
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// A 9-bit index into a 512-entry page table.
///
/// Strongly typed so a level's index cannot accidentally be used as a raw
/// address. Range is `0..512` (checked in debug builds).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    /// Return the index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A **virtual** memory address (process/kernel address space).
///
/// Newtype over `u64` to prevent mixing with physical addresses. Carries the
/// named accessors for the four table indices and the 12-bit page offset so
/// the walker never masks bits by hand.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Extract the level-4 (PML4) index, bits `[47:39]`.
    #[inline]
    #[must_use]
    pub const fn l4_index(self) -> TableIndex {
        TableIndex::new(((self.0 >> 39) & 0x1FF) as u16)
    }

    /// Extract the level-3 (PDPT) index, bits `[38:30]`.
    #[inline]
    #[must_use]
    pub const fn l3_index(self) -> TableIndex {
        TableIndex::new(((self.0 >> 30) & 0x1FF) as u16)
    }

    /// Extract the level-2 (PD) index, bits `[29:21]`.
    #[inline]
    #[must_use]
    pub const fn l2_index(self) -> TableIndex {
        TableIndex::new(((self.0 >> 21) & 0x1FF) as u16)
    }

    /// Extract the level-1 (PT) index, bits `[20:12]`.
    #[inline]
    #[must_use]
    pub const fn l1_index(self) -> TableIndex {
        TableIndex::new(((self.0 >> 12) & 0x1FF) as u16)
    }

    /// The byte offset within a 4 KiB page, bits `[11:0]`.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & 0xFFF
    }

    /// The byte offset within a page of size `S`.
    #[inline]
    #[must_use]
    pub const fn offset_in<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Align down to a page boundary of size `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(align_down(self.0, S::SIZE))
    }

    /// Overflow-aware addition.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u64` to prevent mixing with virtual addresses. No alignment
/// guarantees by itself; values returned from `align_down::<S>()` are
/// `S`-aligned.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The 4 KiB frame number containing this address.
    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> usize {
        (self.0 >> Size4K::SHIFT) as usize
    }

    /// The base address of frame number `index`.
    #[inline]
    #[must_use]
    pub const fn from_frame_index(index: usize) -> Self {
        Self((index as u64) << Size4K::SHIFT)
    }

    /// Align down to a page boundary of size `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(align_down(self.0, S::SIZE))
    }

    /// Whether the address is a multiple of `S::SIZE`.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g., via identity map or a higher-half direct map, HHDM).
///
/// The mapping strategy differs between loader, kernel and tests, so the
/// capability is injected wherever physical memory must be dereferenced
/// instead of relying on a global offset.
///
/// # Safety
/// - Implementations must return pointers into memory that is mapped for the
///   whole lifetime the caller uses them.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a physical address to a raw byte pointer in the current
    /// address space.
    ///
    /// # Safety
    /// `pa` must be mapped and stay mapped while the pointer is in use.
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Convert a physical address to a shared typed reference.
    ///
    /// # Safety
    /// Same as [`phys_to_ptr`](Self::phys_to_ptr); additionally the bytes at
    /// `pa` must be a valid `T` and not concurrently mutated.
    #[inline]
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        unsafe { &*self.phys_to_ptr(pa).cast() }
    }

    /// Convert a physical address to an exclusive typed reference.
    ///
    /// # Safety
    /// Same as [`phys_to_ref`](Self::phys_to_ref); additionally the caller
    /// must hold the only reference to the bytes at `pa`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast() }
    }
}

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM):
/// every physical address is reachable at `base + pa`.
#[derive(Copy, Clone, Debug)]
pub struct HhdmMapper {
    base: u64,
}

impl HhdmMapper {
    /// Create a mapper for the direct map rooted at `base`.
    #[inline]
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    /// The virtual base address of the direct map.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl PhysMapper for HhdmMapper {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (self.base + pa.as_u64()) as *mut u8
    }
}
