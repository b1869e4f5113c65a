//! Reassembly bookkeeping for received file data.
//!
//! The [ExtentList] keeps the byte ranges of a file which were already received. It is always
//! maximally merged: the extents are sorted by offset and no two extents overlap or touch.
//! Inserting a new segment returns exactly the byte ranges which were not received before, so
//! the caller only writes and checksums genuinely new data.
use derive_new::new;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Contiguous range of received file data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    /// Offset one past the last byte of the extent.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Byte ranges of a segment which were not covered by any extent before the insertion.
pub type NewRanges = SmallVec<[Extent; 4]>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtentList {
    extents: Vec<Extent>,
}

impl ExtentList {
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Total amount of received bytes.
    pub fn covered_bytes(&self) -> u64 {
        self.extents.iter().map(|extent| extent.length).sum()
    }

    /// Merge the segment `[offset, offset + length)` into the list.
    ///
    /// Returns the new byte ranges in ascending order. The returned list is empty if the whole
    /// segment was received before or if the segment ends beyond [u64::MAX]. The list is left
    /// unchanged in the latter case.
    pub fn insert(&mut self, offset: u64, length: u64) -> NewRanges {
        let mut new_ranges = NewRanges::new();
        if length == 0 {
            return new_ranges;
        }
        let Some(segment_end) = offset.checked_add(length) else {
            return new_ranges;
        };
        // Write position inside the segment, everything before it is either new and already
        // recorded in new_ranges or was received before.
        let mut cursor = offset;

        // First extent which ends at or after the start of the segment.
        let idx = self
            .extents
            .partition_point(|extent| extent.end() < offset);
        let current = match self.extents.get(idx).copied() {
            Some(extent) if extent.offset <= offset => {
                if extent.end() >= segment_end {
                    return new_ranges;
                }
                cursor = extent.end();
                self.extents[idx].length = segment_end - extent.offset;
                idx
            }
            _ => {
                self.extents.insert(idx, Extent::new(offset, length));
                idx
            }
        };

        // Absorb all following extents which start inside the segment or directly after it.
        while let Some(next) = self.extents.get(current + 1).copied() {
            if next.offset > segment_end {
                break;
            }
            if next.offset > cursor {
                new_ranges.push(Extent::new(cursor, next.offset - cursor));
            }
            cursor = cursor.max(next.end());
            let merged = &mut self.extents[current];
            if next.end() > merged.end() {
                merged.length = next.end() - merged.offset;
            }
            self.extents.remove(current + 1);
        }
        if segment_end > cursor {
            new_ranges.push(Extent::new(cursor, segment_end - cursor));
        }
        new_ranges
    }

    /// Forget the range `[offset, offset + length)`, splitting extents where required.
    pub fn remove(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = offset.saturating_add(length);
        let mut kept = Vec::with_capacity(self.extents.len() + 1);
        for extent in self.extents.drain(..) {
            if extent.end() <= offset || extent.offset >= end {
                kept.push(extent);
                continue;
            }
            if extent.offset < offset {
                kept.push(Extent::new(extent.offset, offset - extent.offset));
            }
            if extent.end() > end {
                kept.push(Extent::new(end, extent.end() - end));
            }
        }
        self.extents = kept;
    }

    /// Whether the range `[0, size)` was received completely.
    pub fn is_complete(&self, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        match self.extents.first() {
            Some(first) => first.offset == 0 && first.end() >= size,
            None => false,
        }
    }
}
