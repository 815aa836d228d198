//! Raw x86-64 page-table entry and table layouts.

use bitfield_struct::bitfield;
use kernel_addresses::{PhysicalAddress, TableIndex};

/// A single 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// Models the common superset of fields across all four paging levels
/// (PML4E, PDPTE, PDE, PTE). An entry either points to the next-level table
/// or, with the `huge` (PS) bit set at L3/L2, directly maps a 1 GiB or
/// 2 MiB page.
///
/// ### Bit layout
///
/// | Bits   | Mnemonic | Meaning |
/// |--------|----------|---------|
/// | 0      | `P`      | Valid entry if set |
/// | 1      | `RW`     | Writable if set |
/// | 2      | `US`     | User-mode accessible if set |
/// | 3      | `PWT`    | Write-through caching |
/// | 4      | `PCD`    | Disable caching |
/// | 5      | `A`      | Accessed |
/// | 6      | `D`      | Dirty (leaf only) |
/// | 7      | `PS`     | Huge-page leaf (valid in L3/L2 only) |
/// | 8      | `G`      | Global (leaf only) |
/// | 9-11   | OS low   | Reserved for OS use |
/// | 12-51  | `addr`   | Physical frame bits [51:12] |
/// | 52-58  | OS high  | Reserved for OS use |
/// | 59-62  | `PKU`    | Protection key, or OS use |
/// | 63     | `NX`     | Execute disable |
#[bitfield(u64)]
pub struct PageTableEntry {
    /// Present (P, bit 0). Clear implies a not-present entry; the walk stops.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow user-mode access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access through the entry.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// When set on an L3 entry the entry maps a 1 GiB page; on an L2 entry a
    /// 2 MiB page. Must be clear in L4 and L1 entries (in a 4 KiB PTE the
    /// architectural position is PAT, treated as 0 here).
    pub huge: bool,

    /// Global (G, bit 8), leaf only. TLB entry survives CR3 reloads.
    pub global_translation: bool,

    /// OS-available (bits 9..=11). Ignored by hardware.
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical frame bits [51:12]. Reconstruct the address as `bits << 12`.
    #[bits(40)]
    frame_bits_51_12: u64,

    /// OS-available (bits 52..=58). Ignored by hardware.
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    /// The physical frame this entry points at (next-level table base or
    /// leaf page base, depending on level and `huge`).
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits_51_12() << 12)
    }

    /// Store the frame address; bits [51:12] only, low 12 bits must be zero.
    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalAddress) {
        self.set_frame_bits_51_12(frame.as_u64() >> 12);
    }

    /// Builder form of [`set_frame`](Self::set_frame).
    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalAddress) -> Self {
        self.with_frame_bits_51_12(frame.as_u64() >> 12)
    }
}

/// A 4 KiB-aligned table of 512 entries, the in-memory shape of every level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    /// An all-not-present table.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); 512],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: TableIndex) -> PageTableEntry {
        self.entries[index.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, index: TableIndex, entry: PageTableEntry) {
        self.entries[index.as_usize()] = entry;
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}
