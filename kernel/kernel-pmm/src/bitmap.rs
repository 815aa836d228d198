//! Flat bit-vector with range operations.
//!
//! Foundation of the frame allocator: one bit per logical slot, packed eight
//! to a byte. The meaning of a set bit is caller-defined (the frame allocator
//! uses 1 = free). The buffer is handed over once at construction, mutated in
//! place and never resized.

use core::ptr::NonNull;

/// A packed bit array over a borrowed byte buffer.
///
/// Indexing is bit-granular; byte `i / 8`, bit `i % 8` (LSB first). All
/// accessors assume `index < len()`; out-of-range indices are the caller's
/// bug and are only caught by debug assertions.
#[derive(Debug)]
pub struct Bitmap {
    buffer: NonNull<u8>,
    size_bytes: usize,
}

// Safety: the bitmap owns its buffer exclusively for its whole lifetime; it
// is only ever used under the PMM lock.
unsafe impl Send for Bitmap {}

impl Bitmap {
    /// Take over `size_bytes` bytes at `buffer` and zero them.
    ///
    /// # Safety
    /// - `buffer` must be valid for reads and writes of `size_bytes` bytes
    ///   for the lifetime of the bitmap.
    /// - No other code may access the buffer while the bitmap is alive.
    pub unsafe fn from_raw(buffer: NonNull<u8>, size_bytes: usize) -> Self {
        unsafe {
            core::ptr::write_bytes(buffer.as_ptr(), 0, size_bytes);
        }
        Self { buffer, size_bytes }
    }

    /// Number of bits tracked.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size_bytes * 8
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    #[inline]
    fn byte(&self, byte_index: usize) -> u8 {
        debug_assert!(byte_index < self.size_bytes);
        unsafe { *self.buffer.as_ptr().add(byte_index) }
    }

    #[inline]
    fn set_byte(&mut self, byte_index: usize, value: u8) {
        debug_assert!(byte_index < self.size_bytes);
        unsafe {
            *self.buffer.as_ptr().add(byte_index) = value;
        }
    }

    /// Read bit `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        (self.byte(index / 8) >> (index % 8)) & 1 != 0
    }

    /// Write bit `index`.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        let byte_index = index / 8;
        let mask = 1u8 << (index % 8);
        let old = self.byte(byte_index);
        if value {
            self.set_byte(byte_index, old | mask);
        } else {
            self.set_byte(byte_index, old & !mask);
        }
    }

    /// Set every bit in `[start, end)` to `value`.
    ///
    /// Unaligned prefix and suffix go bit by bit; the byte-aligned middle is
    /// written with whole `0xFF`/`0x00` bytes. Observable behavior matches a
    /// naive bit loop.
    pub fn set_range(&mut self, start: usize, end: usize, value: bool) {
        if start >= end || start >= self.len() {
            return;
        }
        let end = end.min(self.len());

        let mut index = start;
        while index < end && index % 8 != 0 {
            self.set(index, value);
            index += 1;
        }

        let fill = if value { 0xFF } else { 0x00 };
        let byte_start = index / 8;
        let byte_end = end / 8;
        for byte_index in byte_start..byte_end {
            self.set_byte(byte_index, fill);
        }

        index = byte_end * 8;
        while index < end {
            self.set(index, value);
            index += 1;
        }
    }

    /// Find the first (lowest-index) run of exactly `length` consecutive bits
    /// equal to `value`, scanning byte-wise where possible.
    ///
    /// A byte equal to the complement of the target resets the running match;
    /// a byte equal to the target extends it by 8 at once when `length >= 8`;
    /// mixed bytes fall back to bit-level scanning.
    #[must_use]
    pub fn find_range(&self, length: usize, value: bool) -> Option<usize> {
        if length == 0 {
            return None;
        }
        let target: u8 = if value { 0xFF } else { 0x00 };
        let mut count = 0usize;
        let mut start_index = 0usize;

        for byte_index in 0..self.size_bytes {
            let byte = self.byte(byte_index);
            if byte == !target {
                count = 0;
            } else if byte == target && length >= 8 {
                if count == 0 {
                    start_index = byte_index * 8;
                }
                count += 8;
                if count >= length {
                    return Some(start_index);
                }
            } else {
                for bit in 0..8 {
                    if ((byte >> bit) & 1 != 0) == value {
                        if count == 0 {
                            start_index = byte_index * 8 + bit;
                        }
                        count += 1;
                        if count == length {
                            return Some(start_index);
                        }
                    } else {
                        count = 0;
                    }
                }
            }
        }
        None
    }

    /// `true` iff every bit in `[start, end)` equals `value`.
    #[must_use]
    pub fn range_all(&self, start: usize, end: usize, value: bool) -> bool {
        (start..end).all(|i| self.get(i) == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(backing: &mut Vec<u8>, size_bytes: usize) -> Bitmap {
        backing.resize(size_bytes, 0xAA); // from_raw must zero this
        unsafe { Bitmap::from_raw(NonNull::new(backing.as_mut_ptr()).unwrap(), size_bytes) }
    }

    /// Reference implementation: first index of a run of `length` bits equal
    /// to `value`.
    fn brute_force_find(bits: &Bitmap, length: usize, value: bool) -> Option<usize> {
        'outer: for start in 0..bits.len().saturating_sub(length - 1) {
            for i in start..start + length {
                if bits.get(i) != value {
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }

    #[test]
    fn starts_zeroed() {
        let mut backing = Vec::new();
        let bits = bitmap(&mut backing, 8);
        assert_eq!(bits.len(), 64);
        assert!(bits.range_all(0, 64, false));
    }

    #[test]
    fn set_get_roundtrip() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 4);
        for i in [0, 1, 7, 8, 13, 31] {
            bits.set(i, true);
            assert!(bits.get(i));
            bits.set(i, false);
            assert!(!bits.get(i));
        }
    }

    #[test]
    fn set_range_crosses_byte_boundaries() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 8);
        bits.set_range(3, 29, true);
        for i in 0..bits.len() {
            assert_eq!(bits.get(i), (3..29).contains(&i), "bit {i}");
        }
        bits.set_range(5, 11, false);
        for i in 0..bits.len() {
            let expect = (3..29).contains(&i) && !(5..11).contains(&i);
            assert_eq!(bits.get(i), expect, "bit {i}");
        }
    }

    #[test]
    fn set_range_clamps_to_length() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 2);
        bits.set_range(8, 1000, true);
        assert!(bits.range_all(0, 8, false));
        assert!(bits.range_all(8, 16, true));
    }

    #[test]
    fn find_range_picks_lowest_run() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 8);
        bits.set_range(10, 13, true);
        bits.set_range(20, 40, true);
        assert_eq!(bits.find_range(3, true), Some(10));
        assert_eq!(bits.find_range(4, true), Some(20));
        assert_eq!(bits.find_range(20, true), Some(20));
        assert_eq!(bits.find_range(21, true), None);
    }

    #[test]
    fn find_range_run_spans_byte_edge() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 4);
        // Run of 6 straddling the byte 0 / byte 1 edge.
        bits.set_range(6, 12, true);
        assert_eq!(bits.find_range(6, true), Some(6));
        assert_eq!(bits.find_range(7, true), None);
    }

    #[test]
    fn find_range_short_run_continues_into_full_byte() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 4);
        // Bits 6..16: the first full target byte is byte 1, but the run
        // starts inside byte 0. A short search must report 6, not 8.
        bits.set_range(6, 16, true);
        assert_eq!(bits.find_range(3, true), Some(6));
        assert_eq!(bits.find_range(10, true), Some(6));
    }

    #[test]
    fn find_range_matches_brute_force() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 16);
        // Deterministic scattered pattern.
        let mut state = 0x9E37_79B9_7F4A_7C15_u64;
        for i in 0..bits.len() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            bits.set(i, state >> 63 != 0);
        }
        for value in [true, false] {
            for length in 1..20 {
                assert_eq!(
                    bits.find_range(length, value),
                    brute_force_find(&bits, length, value),
                    "length {length} value {value}"
                );
            }
        }
    }

    #[test]
    fn find_range_rejects_zero_length() {
        let mut backing = Vec::new();
        let bits = bitmap(&mut backing, 4);
        assert_eq!(bits.find_range(0, false), None);
    }

    #[test]
    fn range_all_detects_mismatch() {
        let mut backing = Vec::new();
        let mut bits = bitmap(&mut backing, 4);
        bits.set_range(0, 16, true);
        bits.set(9, false);
        assert!(bits.range_all(0, 9, true));
        assert!(!bits.range_all(0, 16, true));
        assert!(bits.range_all(10, 16, true));
    }
}
