//! Incremental 4-level page-table walker.

use kernel_addresses::{
    PhysMapper, PhysicalAddress, Size1G, Size2M, Size4K, TableIndex, VirtualAddress,
    checked_align_up, PageSize,
};

use crate::LeafSize;
use crate::entry::{PageTable, PageTableEntry};

/// A successful translation: the physical address and the leaf granularity
/// that produced it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Translation {
    pub physical: PhysicalAddress,
    pub size: LeafSize,
}

impl Translation {
    /// Whether the mapping came from a 2 MiB or 1 GiB leaf.
    #[inline]
    #[must_use]
    pub const fn is_huge(&self) -> bool {
        !matches!(self.size, LeafSize::Size4K)
    }
}

/// Walk cursor over one 4-level table tree.
///
/// Caches the physical base of each intermediate table it has visited, so
/// translating a neighbouring address only re-reads the levels whose indices
/// actually changed. [`advance_to`](Self::advance_to) compares old and new
/// address via XOR; a cached table at level N stays valid exactly while the
/// indices above it are unchanged.
///
/// The cursor assumes the table tree is not modified while it is in use;
/// create a fresh cursor after any mapping change.
pub struct PageWalk<'m, M: PhysMapper> {
    mapper: &'m M,
    /// Physical base of the root (L4) table.
    root: PhysicalAddress,
    vaddr: VirtualAddress,
    l4_index: TableIndex,
    l3_index: TableIndex,
    l2_index: TableIndex,
    l1_index: TableIndex,
    page_offset: u64,
    /// Cached physical bases of the intermediate tables for the current
    /// index path, deepest-first validity: `l1_table` implies `l2_table`.
    l3_table: Option<PhysicalAddress>,
    l2_table: Option<PhysicalAddress>,
    l1_table: Option<PhysicalAddress>,
    translation: Option<Translation>,
}

impl<'m, M: PhysMapper> PageWalk<'m, M> {
    /// Create a cursor positioned at `vaddr`.
    ///
    /// # Safety
    /// `root` must be the physical base of a live, well-formed 4-level page
    /// table tree, and `mapper` must map every table frame reachable from it
    /// for the lifetime of the cursor.
    #[must_use]
    pub unsafe fn new(mapper: &'m M, root: PhysicalAddress, vaddr: VirtualAddress) -> Self {
        Self {
            mapper,
            root,
            vaddr,
            l4_index: vaddr.l4_index(),
            l3_index: vaddr.l3_index(),
            l2_index: vaddr.l2_index(),
            l1_index: vaddr.l1_index(),
            page_offset: vaddr.page_offset(),
            l3_table: None,
            l2_table: None,
            l1_table: None,
            translation: None,
        }
    }

    /// The address the cursor currently points at.
    #[inline]
    #[must_use]
    pub const fn virtual_address(&self) -> VirtualAddress {
        self.vaddr
    }

    /// The result of the last successful [`execute`](Self::execute), cleared
    /// by every reposition.
    #[inline]
    #[must_use]
    pub const fn translation(&self) -> Option<Translation> {
        self.translation
    }

    fn entry(&self, table: PhysicalAddress, index: TableIndex) -> PageTableEntry {
        // Safety: table is the root or came out of a present entry; the
        // constructor contract guarantees the mapper covers it.
        let table: &PageTable = unsafe { self.mapper.phys_to_ref(table) };
        table.get(index)
    }

    /// Resolve the current address.
    ///
    /// Resumes from the deepest cached table, so repeated executions after
    /// small [`advance_to`](Self::advance_to) steps touch one table in the
    /// common case. Returns `true` and records a [`Translation`] when a
    /// present leaf is reached at any level; `false` on the first
    /// not-present entry.
    pub fn execute(&mut self) -> bool {
        self.translation = None;

        let l1_table = if let Some(table) = self.l1_table {
            table
        } else {
            let l2_table = if let Some(table) = self.l2_table {
                table
            } else {
                let l3_table = if let Some(table) = self.l3_table {
                    table
                } else {
                    let e4 = self.entry(self.root, self.l4_index);
                    if !e4.present() {
                        return false;
                    }
                    *self.l3_table.insert(e4.frame())
                };

                let e3 = self.entry(l3_table, self.l3_index);
                if !e3.present() {
                    return false;
                }
                if e3.huge() {
                    let base = e3.frame().align_down::<Size1G>();
                    self.translation = Some(Translation {
                        physical: PhysicalAddress::new(
                            base.as_u64() | self.vaddr.offset_in::<Size1G>(),
                        ),
                        size: LeafSize::Size1G,
                    });
                    return true;
                }
                *self.l2_table.insert(e3.frame())
            };

            let e2 = self.entry(l2_table, self.l2_index);
            if !e2.present() {
                return false;
            }
            if e2.huge() {
                let base = e2.frame().align_down::<Size2M>();
                self.translation = Some(Translation {
                    physical: PhysicalAddress::new(
                        base.as_u64() | self.vaddr.offset_in::<Size2M>(),
                    ),
                    size: LeafSize::Size2M,
                });
                return true;
            }
            *self.l1_table.insert(e2.frame())
        };

        let e1 = self.entry(l1_table, self.l1_index);
        if !e1.present() {
            return false;
        }
        self.translation = Some(Translation {
            physical: PhysicalAddress::new(e1.frame().as_u64() | self.page_offset),
            size: LeafSize::Size4K,
        });
        true
    }

    /// Reposition the cursor without discarding still-valid table caches.
    ///
    /// The XOR of old and new address tells which levels changed: bits at or
    /// above 21 invalidate the cached L1 table, at or above 30 the L2 table,
    /// at or above 39 the L3 table. The root never changes.
    pub fn advance_to(&mut self, next: VirtualAddress) {
        let difference = self.vaddr.as_u64() ^ next.as_u64();
        self.vaddr = next;
        self.l1_index = next.l1_index();
        self.page_offset = next.page_offset();
        self.translation = None;

        if difference >> Size2M::SHIFT != 0 {
            self.l2_index = next.l2_index();
            self.l1_table = None;

            if difference >> Size1G::SHIFT != 0 {
                self.l3_index = next.l3_index();
                self.l2_table = None;

                if difference >> 39 != 0 {
                    self.l4_index = next.l4_index();
                    self.l3_table = None;
                }
            }
        }
    }

    /// Measure the unmapped run starting at the cursor, in 4 KiB steps,
    /// stopping early once `length` bytes are known free.
    ///
    /// Leaves the cursor on the first mapped page (or the last probed
    /// address). Returns the number of free bytes found, capped at `length`
    /// even when `length` is not page-aligned; the result is less than
    /// `length` only if a mapping or the top of the address space was hit.
    pub fn free_run_length(&mut self, length: u64) -> u64 {
        let mut free = 0u64;
        while free < length {
            if self.execute() {
                break;
            }
            free += Size4K::SIZE;
            let Some(next) = self.vaddr.checked_add(Size4K::SIZE) else {
                break;
            };
            self.advance_to(next);
        }
        free.min(length)
    }
}

/// One-shot translation of `vaddr` under the tree rooted at `root`.
///
/// A zero root or zero address resolves to `None`; physical address 0 is the
/// "no frame" sentinel and never a valid translation target.
///
/// # Safety
/// See [`PageWalk::new`].
#[must_use]
pub unsafe fn walk_page_tables<M: PhysMapper>(
    mapper: &M,
    root: PhysicalAddress,
    vaddr: VirtualAddress,
) -> Option<PhysicalAddress> {
    if root.is_zero() || vaddr.is_zero() {
        return None;
    }
    let mut walk = unsafe { PageWalk::new(mapper, root, vaddr) };
    if walk.execute() {
        walk.translation().map(|t| t.physical)
    } else {
        None
    }
}

/// Coarse variant of [`PageWalk::free_run_length`]: probes one address per
/// 2 MiB chunk instead of every 4 KiB page.
///
/// Fast for huge-page placement scans, but a 4 KiB mapping between probe
/// points goes unnoticed, so the result may overreport. Callers that place
/// real mappings must re-verify at page granularity.
///
/// # Safety
/// See [`PageWalk::new`].
#[must_use]
pub unsafe fn free_run_length_coarse<M: PhysMapper>(
    mapper: &M,
    root: PhysicalAddress,
    start: VirtualAddress,
    length: u64,
) -> u64 {
    let mut walk = unsafe { PageWalk::new(mapper, root, start) };
    let mut free = 0u64;
    while free < length {
        if walk.execute() {
            break;
        }
        free += Size2M::SIZE;
        let Some(next) = walk.virtual_address().checked_add(Size2M::SIZE) else {
            break;
        };
        walk.advance_to(next);
    }
    free
}

/// Find the lowest `length`-byte unmapped range at or above `start`.
///
/// Scans at 4 KiB granularity; after a too-short free run the candidate
/// jumps past the mapping that ended it. Returns `None` when the search
/// would wrap the address space.
///
/// # Safety
/// See [`PageWalk::new`].
#[must_use]
pub unsafe fn find_free_range<M: PhysMapper>(
    mapper: &M,
    root: PhysicalAddress,
    start: VirtualAddress,
    length: u64,
) -> Option<VirtualAddress> {
    if length == 0 {
        return None;
    }
    let length = checked_align_up(length, Size4K::SIZE)?;
    let mut candidate = VirtualAddress::new(checked_align_up(start.as_u64(), Size4K::SIZE)?);

    loop {
        let mut walk = unsafe { PageWalk::new(mapper, root, candidate) };
        let free = walk.free_run_length(length);
        if free >= length {
            return Some(candidate);
        }
        // Skip the free prefix plus the mapped page that terminated it.
        candidate = candidate.checked_add(free + Size4K::SIZE)?;
    }
}
