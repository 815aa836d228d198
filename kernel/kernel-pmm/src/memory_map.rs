//! Physical memory map input types.
//!
//! The boot collaborator (bootloader protocol glue) hands the PMM an ordered
//! slice of [`MemoryRegion`]s exactly once at init. Only
//! [`RegionKind::Usable`] regions are ever allocated from; the remaining
//! kinds are carried so the boot-time summary can name them.

use kernel_addresses::{PageSize, PhysicalAddress, Size4K};

/// Classification of a firmware/bootloader memory region.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RegionKind {
    /// Free conventional RAM.
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}

impl RegionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "ACPI reclaimable",
            Self::AcpiNvs => "ACPI NVS",
            Self::BadMemory => "bad memory",
            Self::BootloaderReclaimable => "bootloader reclaimable",
            Self::KernelAndModules => "kernel and modules",
            Self::Framebuffer => "framebuffer",
        }
    }
}

/// One contiguous physical region reported by the platform.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.length
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }

    /// Index of the first 4 KiB frame in the region.
    #[inline]
    #[must_use]
    pub const fn first_frame(&self) -> usize {
        self.base.frame_index()
    }

    /// Number of whole 4 KiB frames covered.
    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        (self.length / Size4K::SIZE) as usize
    }
}

/// Log the physical RAM map the way the platform reported it.
pub fn log_memory_map(regions: &[MemoryRegion]) {
    log::info!("physical RAM map:");
    for region in regions {
        log::info!(
            "  [mem {}-0x{:016X}] ({:9} KiB) {}",
            region.base,
            region.end().saturating_sub(1),
            region.length / 1024,
            region.kind.as_str()
        );
    }
}
