//! Physical memory range tracking and allocation.
//!
//! The manager keeps an address-ordered, non-overlapping list of typed
//! ranges partitioning (a superset of) usable memory. Allocation scans FREE
//! ranges in the bias direction, splits the chosen range and inserts the
//! typed result, coalescing contiguous neighbours of equal type. Same
//! split-and-coalesce discipline as a free-list heap, just over owned range
//! records instead of intrusive headers.

use alloc::vec::Vec;
use initium_addrs::{PAGE_SIZE, PhysicalAddress, align_down, is_pow2};
use log::debug;

/// Classification of a physical range.
///
/// `Internal` marks loader-private memory (temporary page tables, the
/// trampoline page). It is never shown to the kernel as such: finalization
/// retypes it as `Reclaimable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Free,
    Allocated,
    Reclaimable,
    Pagetables,
    Stack,
    Modules,
    Internal,
    Reserved,
}

/// Scan direction for [`MemoryManager::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocBias {
    /// Prefer the lowest suitable address.
    Low,
    /// Prefer the highest suitable address.
    High,
}

/// A half-open physical interval `[start, start + size)` with a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub size: u64,
    pub range_type: MemoryType,
}

impl MemoryRange {
    /// Address of the last byte in the range.
    #[inline]
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.start + self.size - 1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Failed to allocate {size} bytes")]
    NoSuitableRange { size: u64 },
    #[error("Range at 0x{start:x} overlaps an allocated range")]
    Overlap { start: u64 },
    #[error("Invalid allocation parameters")]
    InvalidParameters,
    #[error("Memory map already finalized")]
    Finalized,
}

/// Tracks physical memory and serves constrained allocations.
pub struct MemoryManager {
    /// Address-ordered, non-overlapping.
    ranges: Vec<MemoryRange>,
    finalized: bool,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ranges: Vec::new(),
            finalized: false,
        }
    }

    /// Build a manager from firmware-advertised usable regions.
    pub fn from_usable<I: IntoIterator<Item = (PhysicalAddress, u64)>>(regions: I) -> Self {
        let mut mm = Self::new();
        for (start, size) in regions {
            mm.add_free(start.as_u64(), size);
        }
        mm
    }

    /// Register a usable region, trimmed inward to page boundaries.
    pub fn add_free(&mut self, start: u64, size: u64) {
        let Some(end) = start.checked_add(size) else {
            return;
        };
        let start = initium_addrs::align_up(start, PAGE_SIZE);
        let end = align_down(end, PAGE_SIZE);
        if end > start {
            self.insert_range(MemoryRange {
                start,
                size: end - start,
                range_type: MemoryType::Free,
            });
        }
    }

    /// Allocate `size` bytes with the given placement constraints.
    ///
    /// `size` must be a positive page multiple; `align` a power of two of at
    /// least page size (0 selects page size); the allocation satisfies
    /// `min <= addr` and `addr + size - 1 <= max`. The scan walks FREE
    /// ranges in the bias direction and takes the first fit, splitting the
    /// surrounding range. Failure is non-fatal and leaves the map unchanged.
    pub fn alloc(
        &mut self,
        size: u64,
        align: u64,
        min: u64,
        max: u64,
        range_type: MemoryType,
        bias: AllocBias,
    ) -> Result<PhysicalAddress, MemoryError> {
        if self.finalized {
            return Err(MemoryError::Finalized);
        }
        let align = if align == 0 { PAGE_SIZE } else { align };
        if size == 0
            || size % PAGE_SIZE != 0
            || !is_pow2(align)
            || align < PAGE_SIZE
            || range_type == MemoryType::Free
        {
            return Err(MemoryError::InvalidParameters);
        }

        let indices: Vec<usize> = match bias {
            AllocBias::Low => (0..self.ranges.len()).collect(),
            AllocBias::High => (0..self.ranges.len()).rev().collect(),
        };

        for idx in indices {
            let range = self.ranges[idx];
            if range.range_type != MemoryType::Free {
                continue;
            }

            let window_start = range.start.max(min);
            let window_last = range.last().min(max);
            if window_start > window_last || window_last - window_start + 1 < size {
                continue;
            }

            let candidate = match bias {
                AllocBias::Low => {
                    let Some(a) = checked_align_up(window_start, align) else {
                        continue;
                    };
                    a
                }
                AllocBias::High => align_down(window_last - size + 1, align),
            };

            if candidate < window_start {
                continue;
            }
            let Some(candidate_last) = candidate.checked_add(size - 1) else {
                continue;
            };
            if candidate_last > window_last {
                continue;
            }

            self.carve(idx, candidate, size, range_type);
            return Ok(PhysicalAddress::new(candidate));
        }

        Err(MemoryError::NoSuitableRange { size })
    }

    /// Force a typed range at a fixed location.
    ///
    /// Overlapping FREE ranges are split around it; overlap with anything
    /// else is an error. Portions not covered by any tracked range are
    /// claimed as-is.
    pub fn insert(
        &mut self,
        start: u64,
        size: u64,
        range_type: MemoryType,
    ) -> Result<(), MemoryError> {
        if self.finalized {
            return Err(MemoryError::Finalized);
        }
        if size == 0
            || size % PAGE_SIZE != 0
            || start % PAGE_SIZE != 0
            || range_type == MemoryType::Free
        {
            return Err(MemoryError::InvalidParameters);
        }
        let Some(last) = start.checked_add(size - 1) else {
            return Err(MemoryError::InvalidParameters);
        };

        for range in &self.ranges {
            if range.start <= last
                && range.last() >= start
                && range.range_type != MemoryType::Free
            {
                return Err(MemoryError::Overlap { start });
            }
        }

        self.remove_span(start, last);
        self.insert_range(MemoryRange {
            start,
            size,
            range_type,
        });
        Ok(())
    }

    /// Add FREE coverage over the parts of `[start, start + size)` that no
    /// tracked range covers yet. Used when the final firmware map releases
    /// memory the initial map did not advertise.
    pub fn release(&mut self, start: u64, size: u64) {
        if self.finalized || size == 0 {
            return;
        }
        let start = initium_addrs::align_up(start, PAGE_SIZE);
        let Some(end) = start.checked_add(size) else {
            return;
        };
        let end = align_down(end, PAGE_SIZE);
        if end <= start {
            return;
        }

        // Collect untracked gaps inside [start, end).
        let mut gaps: Vec<(u64, u64)> = Vec::new();
        let mut cursor = start;
        for range in &self.ranges {
            let r_end = range.start + range.size;
            if r_end <= cursor {
                continue;
            }
            if range.start >= end {
                break;
            }
            if range.start > cursor {
                gaps.push((cursor, range.start.min(end)));
            }
            cursor = cursor.max(r_end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }

        for (gap_start, gap_end) in gaps {
            self.insert_range(MemoryRange {
                start: gap_start,
                size: gap_end - gap_start,
                range_type: MemoryType::Free,
            });
        }
    }

    /// Retype every `Internal` and `Reclaimable` range as `Reclaimable` and
    /// coalesce the list.
    pub fn reclaim(&mut self) {
        for range in &mut self.ranges {
            if matches!(
                range.range_type,
                MemoryType::Internal | MemoryType::Reclaimable
            ) {
                range.range_type = MemoryType::Reclaimable;
            }
        }
        self.coalesce();
    }

    /// Produce the final map: reclaim, coalesce, freeze. Subsequent
    /// allocations fail; calling again returns the identical list.
    pub fn finalize(&mut self) -> &[MemoryRange] {
        if !self.finalized {
            self.reclaim();
            self.finalized = true;
        }
        &self.ranges
    }

    /// Current range list, address-ordered.
    #[must_use]
    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    /// Log the current map to the debug console.
    pub fn dump(&self) {
        for range in &self.ranges {
            debug!(
                "  0x{:016x}-0x{:016x} {:?}",
                range.start,
                range.start + range.size,
                range.range_type
            );
        }
    }

    /// Split the FREE range at `idx` around `[start, start + size)` and
    /// insert the typed allocation.
    fn carve(&mut self, idx: usize, start: u64, size: u64, range_type: MemoryType) {
        let range = self.ranges.remove(idx);
        debug_assert_eq!(range.range_type, MemoryType::Free);
        debug_assert!(range.start <= start && start + size - 1 <= range.last());

        if start > range.start {
            self.insert_range(MemoryRange {
                start: range.start,
                size: start - range.start,
                range_type: MemoryType::Free,
            });
        }
        let alloc_end = start + size;
        let range_end = range.start + range.size;
        if range_end > alloc_end {
            self.insert_range(MemoryRange {
                start: alloc_end,
                size: range_end - alloc_end,
                range_type: MemoryType::Free,
            });
        }
        self.insert_range(MemoryRange {
            start,
            size,
            range_type,
        });
    }

    /// Remove all coverage of `[start, last]`, re-adding the outside parts
    /// of any straddling range. Callers have verified the span only touches
    /// FREE ranges.
    fn remove_span(&mut self, start: u64, last: u64) {
        let mut rebuilt: Vec<MemoryRange> = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.start > last || range.last() < start {
                rebuilt.push(range);
                continue;
            }
            if range.start < start {
                rebuilt.push(MemoryRange {
                    start: range.start,
                    size: start - range.start,
                    range_type: range.range_type,
                });
            }
            if range.last() > last {
                rebuilt.push(MemoryRange {
                    start: last + 1,
                    size: range.last() - last,
                    range_type: range.range_type,
                });
            }
        }
        self.ranges = rebuilt;
    }

    /// Insert keeping address order, merging with contiguous equal-typed
    /// neighbours.
    fn insert_range(&mut self, range: MemoryRange) {
        let pos = self
            .ranges
            .iter()
            .position(|r| r.start > range.start)
            .unwrap_or(self.ranges.len());
        self.ranges.insert(pos, range);

        // Merge with the next range first so indices stay valid.
        if pos + 1 < self.ranges.len() {
            let next = self.ranges[pos + 1];
            let cur = self.ranges[pos];
            if cur.range_type == next.range_type && cur.start + cur.size == next.start {
                self.ranges[pos].size += next.size;
                self.ranges.remove(pos + 1);
            }
        }
        if pos > 0 {
            let prev = self.ranges[pos - 1];
            let cur = self.ranges[pos];
            if prev.range_type == cur.range_type && prev.start + prev.size == cur.start {
                self.ranges[pos - 1].size += cur.size;
                self.ranges.remove(pos);
            }
        }
    }

    /// Merge every run of contiguous equal-typed ranges.
    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.ranges.len() {
            let (a, b) = (self.ranges[i], self.ranges[i + 1]);
            if a.range_type == b.range_type && a.start + a.size == b.start {
                self.ranges[i].size += b.size;
                self.ranges.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// `align_up` that reports overflow instead of wrapping.
const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
