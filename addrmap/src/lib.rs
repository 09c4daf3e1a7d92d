//! Per-process address-space bookkeeping.
//!
//! An [AddressMapper] tracks the set of virtual-memory ranges a process has
//! mapped, in real address order, and assigns each range a *synthetic*
//! address: a dense, stable layout starting at zero in which consecutive
//! ranges begin immediately after their predecessors. Rewriting sampled
//! addresses into synthetic space hides the process's real layout (and thus
//! ASLR offsets) while preserving, byte for byte, every offset within a
//! range.
//!
//! Ranges are keyed by an opaque `u64` id chosen by the caller (the event
//! processor uses the index of the record that created the mapping) plus the
//! byte offset of the range within its backing object, so a lookup can be
//! turned back into "which object, at which file offset".

use std::collections::BTreeMap;
use thiserror::Error;

/// The id given to ranges inserted via [AddressMapper::map], which does not
/// take an id.
pub const NO_ID: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum MapError {
    /// A zero-length range cannot be mapped.
    #[error("cannot map zero-length range at {start:#x}")]
    ZeroLength { start: u64 },
    /// The range's end would exceed the top of the address space.
    #[error("range {start:#x} (size {size:#x}) overflows the address space")]
    Overflow { start: u64, size: u64 },
    /// The range collides with an existing range and the caller asked for
    /// existing ranges to be kept.
    #[error("range {start:#x} (size {size:#x}) overlaps existing range at {existing:#x}")]
    Overlap { start: u64, size: u64, existing: u64 },
}

/// One mapped range of a process's virtual address space.
#[derive(Clone, Debug)]
pub struct MappedRange {
    /// Real virtual address of the first byte.
    start: u64,
    /// Length in bytes. Never zero; `start + size` may equal 2^64 for a
    /// range ending at the top of the address space.
    size: u64,
    /// Caller-chosen identifier of the record that created this range.
    id: u64,
    /// Offset within the backing object of the byte at `start`.
    offset: u64,
    /// JIT ranges need not be page aligned and pack densely in synthetic
    /// space.
    is_jit: bool,
    /// Assigned synthetic address of `start`. Recomputed whenever the range
    /// set changes.
    synthetic_start: u64,
}

impl MappedRange {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_jit(&self) -> bool {
        self.is_jit
    }

    pub fn synthetic_start(&self) -> u64 {
        self.synthetic_start
    }

    /// The address of the last byte in the range.
    fn end(&self) -> u64 {
        self.start + (self.size - 1)
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end()
    }

    /// Returns the range's id and the offset of `addr` within the backing
    /// object. `addr` must lie within the range.
    pub fn id_and_offset(&self, addr: u64) -> (u64, u64) {
        debug_assert!(self.contains(addr));
        (self.id, self.offset + (addr - self.start))
    }
}

/// An ordered set of disjoint [MappedRange]s with synthetic address
/// assignment.
///
/// Cloning a mapper deep-copies its ranges; a forked child's mapper starts
/// as a copy of the parent's and the two diverge from then on.
#[derive(Clone, Debug)]
pub struct AddressMapper {
    /// Ranges keyed by real start address. Pairwise disjoint.
    ranges: BTreeMap<u64, MappedRange>,
    /// Page size used to keep synthetic addresses page-offset-compatible
    /// with their real counterparts. Zero disables alignment padding
    /// entirely. Must otherwise be a power of two.
    page_alignment: u64,
}

impl AddressMapper {
    pub fn new(page_alignment: u64) -> Self {
        debug_assert!(page_alignment == 0 || page_alignment.is_power_of_two());
        Self {
            ranges: BTreeMap::new(),
            page_alignment,
        }
    }

    pub fn page_alignment(&self) -> u64 {
        self.page_alignment
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over the ranges in real address order.
    pub fn iter(&self) -> impl Iterator<Item = &MappedRange> {
        self.ranges.values()
    }

    /// Maps a range without an id or object offset.
    pub fn map(&mut self, start: u64, size: u64, remove_old_mappings: bool) -> Result<(), MapError> {
        self.map_with_id(start, size, NO_ID, 0, remove_old_mappings, false)
    }

    /// Inserts the range `[start, start + size)`.
    ///
    /// If the new range collides with existing ranges and
    /// `remove_old_mappings` is true, the overlapped portions of the
    /// existing ranges are removed: a fully-covered range disappears, a
    /// partially-covered one is truncated (with its object offset advanced
    /// by the amount cut from its front), and a range straddling the new
    /// one is split in two. A range inserted with exactly the bounds of an
    /// existing one therefore replaces it, newer id winning.
    ///
    /// If `remove_old_mappings` is false, a new range lying entirely within
    /// an existing one is accepted as a no-op (the existing range is kept);
    /// any other collision is an error.
    pub fn map_with_id(
        &mut self,
        start: u64,
        size: u64,
        id: u64,
        offset: u64,
        remove_old_mappings: bool,
        is_jit: bool,
    ) -> Result<(), MapError> {
        if size == 0 {
            return Err(MapError::ZeroLength { start });
        }
        // A range ending exactly at the top of the address space is legal,
        // so overflow is checked on the inclusive end.
        let Some(end) = start.checked_add(size - 1) else {
            return Err(MapError::Overflow { start, size });
        };

        // Ranges are disjoint and sorted, so those intersecting
        // [start, end] form one contiguous run ending at the last range
        // that starts at or below `end`.
        let hits: Vec<u64> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, r)| r.end() >= start)
            .map(|(&k, _)| k)
            .collect();

        if !remove_old_mappings {
            if let [key] = hits.as_slice() {
                let existing = &self.ranges[key];
                if existing.start <= start && existing.end() >= end {
                    return Ok(());
                }
            }
            if let Some(&key) = hits.first() {
                return Err(MapError::Overlap {
                    start,
                    size,
                    existing: key,
                });
            }
        } else {
            for key in hits {
                let old = self.ranges.remove(&key).unwrap();
                if old.start < start {
                    // Keep the part of `old` below the new range.
                    let mut left = old.clone();
                    left.size = start - old.start;
                    self.ranges.insert(left.start, left);
                }
                if old.end() > end {
                    // Keep the part of `old` above the new range, with its
                    // object offset advanced past the removed bytes.
                    let mut right = old.clone();
                    right.start = end + 1;
                    right.size = old.end() - end;
                    right.offset = old.offset + (right.start - old.start);
                    self.ranges.insert(right.start, right);
                }
            }
        }

        self.ranges.insert(
            start,
            MappedRange {
                start,
                size,
                id,
                offset,
                is_jit,
                synthetic_start: 0,
            },
        );
        self.rebuild_synthetic();
        Ok(())
    }

    /// Finds the range containing `addr` and returns the synthetic address
    /// of `addr` together with the range.
    pub fn mapped_address(&self, addr: u64) -> Option<(u64, &MappedRange)> {
        let (_, range) = self.ranges.range(..=addr).next_back()?;
        if !range.contains(addr) {
            return None;
        }
        Some((range.synthetic_start + (addr - range.start), range))
    }

    /// Reassigns synthetic addresses after a mutation.
    ///
    /// Each range starts where the previous one ended, padded just enough
    /// that a non-JIT range keeps the page offset of its real start. For
    /// page-aligned mappings the pad is zero and synthetic starts are the
    /// plain cumulative sum of lengths. JIT ranges pack densely.
    fn rebuild_synthetic(&mut self) {
        let mut next = 0u64;
        for range in self.ranges.values_mut() {
            let pad = if range.is_jit || self.page_alignment == 0 {
                0
            } else {
                range.start.wrapping_sub(next) & (self.page_alignment - 1)
            };
            range.synthetic_start = next + pad;
            next = range.synthetic_start + range.size;
        }
    }

    /// Logs every range, for post-mortem diagnosis of a failed insertion.
    pub fn dump_to_log(&self) {
        for r in self.ranges.values() {
            log::error!(
                "mapped range: [{:#x}, {:#x}) -> {:#x}, id={:#x}, offset={:#x}, jit={}",
                r.start,
                r.start.wrapping_add(r.size),
                r.synthetic_start,
                r.id,
                r.offset,
                r.is_jit,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 0x1000;

    fn mapper() -> AddressMapper {
        AddressMapper::new(PAGE)
    }

    #[test]
    fn map_and_lookup() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x2000, 7, 0x500, true, false).unwrap();
        let (synth, r) = m.mapped_address(0x1234).unwrap();
        assert_eq!(synth, 0x234);
        assert_eq!(r.id_and_offset(0x1234), (7, 0x500 + 0x234));
        // One-past-the-end misses.
        assert!(m.mapped_address(0x3000).is_none());
        assert!(m.mapped_address(0xfff).is_none());
    }

    #[test]
    fn zero_length_rejected() {
        let mut m = mapper();
        match m.map(0x1000, 0, true) {
            Err(MapError::ZeroLength { start: 0x1000 }) => (),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn overflow_rejected_but_top_of_space_ok() {
        let mut m = mapper();
        match m.map(u64::MAX - 0xfff, 0x2000, true) {
            Err(MapError::Overflow { .. }) => (),
            x => panic!("{x:?}"),
        }
        // Ends exactly at 2^64.
        m.map(u64::MAX - 0xfff, 0x1000, true).unwrap();
        assert!(m.mapped_address(u64::MAX).is_some());
    }

    #[test]
    fn synthetic_is_cumulative_for_aligned_ranges() {
        let mut m = mapper();
        m.map_with_id(0x40000, 0x3000, 0, 0, true, false).unwrap();
        m.map_with_id(0x90000, 0x1000, 1, 0, true, false).unwrap();
        m.map_with_id(0x10000, 0x2000, 2, 0, true, false).unwrap();
        let synths: Vec<u64> = m.iter().map(|r| r.synthetic_start()).collect();
        // Real-address order: 0x10000, 0x40000, 0x90000.
        assert_eq!(synths, vec![0, 0x2000, 0x5000]);
    }

    #[test]
    fn synthetic_preserves_page_offset_of_unaligned_start() {
        let mut m = mapper();
        // Mimics a normalized x86-64 kernel mapping: the start keeps its
        // sub-page offset so remapped samples stay page-compatible.
        m.map_with_id(0xffff_ffff_bcc0_0198, 0x33f_fe67, 0, 0, true, false)
            .unwrap();
        let (synth, _) = m.mapped_address(0xffff_ffff_bcc0_0198).unwrap();
        assert_eq!(synth, 0x198);
        assert_eq!(synth % PAGE, 0xffff_ffff_bcc0_0198 % PAGE);
    }

    #[test]
    fn jit_ranges_pack_densely() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x1000, 0, 0, true, false).unwrap();
        m.map_with_id(0x5550, 0x100, 1, 0, true, true).unwrap();
        let (synth, _) = m.mapped_address(0x5550).unwrap();
        // No padding after the first range's synthetic end.
        assert_eq!(synth, 0x1000);
    }

    #[test]
    fn exact_replacement_takes_new_id() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x1000, 1, 0, true, false).unwrap();
        m.map_with_id(0x1000, 0x1000, 2, 0x40, true, false).unwrap();
        assert_eq!(m.len(), 1);
        let (_, r) = m.mapped_address(0x1800).unwrap();
        assert_eq!(r.id(), 2);
        assert_eq!(r.offset(), 0x40);
    }

    #[test]
    fn contained_range_is_noop_without_removal() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x4000, 1, 0, true, false).unwrap();
        m.map_with_id(0x2000, 0x1000, 2, 0, false, false).unwrap();
        assert_eq!(m.len(), 1);
        let (_, r) = m.mapped_address(0x2500).unwrap();
        assert_eq!(r.id(), 1);
    }

    #[test]
    fn partial_overlap_errors_without_removal() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x2000, 1, 0, true, false).unwrap();
        match m.map_with_id(0x2000, 0x2000, 2, 0, false, false) {
            Err(MapError::Overlap { existing: 0x1000, .. }) => (),
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn covered_range_is_removed() {
        let mut m = mapper();
        m.map_with_id(0x2000, 0x1000, 1, 0, true, false).unwrap();
        m.map_with_id(0x1000, 0x4000, 2, 0, true, false).unwrap();
        assert_eq!(m.len(), 1);
        let (_, r) = m.mapped_address(0x2400).unwrap();
        assert_eq!(r.id(), 2);
    }

    #[test]
    fn left_overlap_truncates_tail() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x2000, 1, 0x100, true, false).unwrap();
        m.map_with_id(0x2000, 0x2000, 2, 0, true, false).unwrap();
        assert_eq!(m.len(), 2);
        // Old range survives as [0x1000, 0x2000) with its offset intact.
        let (_, r) = m.mapped_address(0x1fff).unwrap();
        assert_eq!(r.id(), 1);
        assert_eq!(r.size(), 0x1000);
        assert_eq!(r.offset(), 0x100);
        let (_, r) = m.mapped_address(0x2000).unwrap();
        assert_eq!(r.id(), 2);
    }

    #[test]
    fn right_overlap_advances_start_and_offset() {
        let mut m = mapper();
        m.map_with_id(0x2000, 0x2000, 1, 0x100, true, false).unwrap();
        m.map_with_id(0x1000, 0x2000, 2, 0, true, false).unwrap();
        assert_eq!(m.len(), 2);
        let (_, r) = m.mapped_address(0x3000).unwrap();
        assert_eq!(r.id(), 1);
        assert_eq!(r.start(), 0x3000);
        assert_eq!(r.size(), 0x1000);
        // 0x1000 bytes were cut off the front.
        assert_eq!(r.offset(), 0x1100);
    }

    #[test]
    fn straddled_range_is_split() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x5000, 1, 0, true, false).unwrap();
        m.map_with_id(0x2000, 0x1000, 2, 0, true, false).unwrap();
        assert_eq!(m.len(), 3);
        let (_, left) = m.mapped_address(0x1fff).unwrap();
        assert_eq!((left.id(), left.start(), left.size()), (1, 0x1000, 0x1000));
        let (_, mid) = m.mapped_address(0x2800).unwrap();
        assert_eq!(mid.id(), 2);
        let (_, right) = m.mapped_address(0x3000).unwrap();
        assert_eq!((right.id(), right.start(), right.size()), (1, 0x3000, 0x3000));
        // The split tail's offset skips the removed middle.
        assert_eq!(right.offset(), 0x2000);
    }

    #[test]
    fn ranges_stay_disjoint_and_synthetics_monotonic() {
        let mut m = mapper();
        m.map_with_id(0x1000, 0x5000, 1, 0, true, false).unwrap();
        m.map_with_id(0x2000, 0x1000, 2, 0, true, false).unwrap();
        m.map_with_id(0x4000, 0x3000, 3, 0, true, false).unwrap();
        let ranges: Vec<&MappedRange> = m.iter().collect();
        for pair in ranges.windows(2) {
            assert!(pair[0].start() + pair[0].size() <= pair[1].start());
            assert!(pair[0].synthetic_start() < pair[1].synthetic_start());
        }
    }

    #[test]
    fn clone_diverges() {
        let mut parent = mapper();
        parent.map_with_id(0x1000, 0x1000, 1, 0, true, false).unwrap();
        let mut child = parent.clone();
        child.map_with_id(0x8000, 0x1000, 2, 0, true, false).unwrap();
        assert_eq!(parent.len(), 1);
        assert_eq!(child.len(), 2);
        assert!(parent.mapped_address(0x8000).is_none());
    }
}
