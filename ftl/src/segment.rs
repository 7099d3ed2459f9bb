//! Segment table: per-segment valid/free page counters, the use-bitmap,
//! and the ordered list of LPNs currently valid in the segment.
//!
//! `nr_free_pages`, `nr_valid_pages`, and `is_gc` are atomics so the GC
//! readiness check and the statistics query can read them without taking
//! `mapping_mutex` (see `Ftl::free_page_ratio`); `use_bits` and `lpn_list`
//! are plain fields because every access to them already happens with
//! `mapping_mutex` held.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::bitmap::Bitmap;

/// One segment's bookkeeping record.
pub struct Segment {
    nr_free_pages: AtomicUsize,
    nr_valid_pages: AtomicUsize,
    is_gc: AtomicBool,
    /// Which pages in the segment have been programmed since the last erase.
    use_bits: Bitmap,
    /// LPNs currently valid in this segment, in write order.
    lpn_list: Vec<usize>,
}

impl Segment {
    fn new(pages_per_segment: usize) -> Self {
        Segment {
            nr_free_pages: AtomicUsize::new(pages_per_segment),
            nr_valid_pages: AtomicUsize::new(0),
            is_gc: AtomicBool::new(false),
            use_bits: Bitmap::new(pages_per_segment),
            lpn_list: Vec::new(),
        }
    }

    pub fn nr_free_pages(&self) -> usize {
        self.nr_free_pages.load(Ordering::Acquire)
    }

    pub fn nr_valid_pages(&self) -> usize {
        self.nr_valid_pages.load(Ordering::Acquire)
    }

    pub fn is_gc(&self) -> bool {
        self.is_gc.load(Ordering::Acquire)
    }

    pub fn set_is_gc(&self, value: bool) {
        self.is_gc.store(value, Ordering::Release);
    }

    /// LPNs currently valid in this segment. Only meaningful with
    /// `mapping_mutex` held.
    pub fn lpn_list(&self) -> &[usize] {
        &self.lpn_list
    }
}

/// The full per-device segment table.
pub struct SegmentTable {
    segments: Vec<Segment>,
    pages_per_segment: usize,
}

impl SegmentTable {
    /// Create `nr_segments` segments, each erased/free.
    pub fn new(nr_segments: usize, pages_per_segment: usize) -> Self {
        SegmentTable {
            segments: (0..nr_segments)
                .map(|_| Segment::new(pages_per_segment))
                .collect(),
            pages_per_segment,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, segnum: usize) -> &Segment {
        &self.segments[segnum]
    }

    /// Lowest-index free page in `segnum`, programming it and decrementing
    /// the free-page counter. Returns `None` if the segment has no free
    /// pages. Caller holds `mapping_mutex`.
    pub fn allocate_page(&mut self, segnum: usize) -> Option<usize> {
        let segment = &mut self.segments[segnum];
        let page = segment.use_bits.first_clear()?;
        segment.use_bits.set(page);
        let prev = segment.nr_free_pages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allocated a page from a full segment");
        Some(page)
    }

    /// Append `lpn` to `segnum`'s valid-LPN list (a page in `segnum` was
    /// just written for `lpn`). Caller holds `mapping_mutex`.
    pub fn append_lpn(&mut self, segnum: usize, lpn: usize) {
        let segment = &mut self.segments[segnum];
        segment.lpn_list.push(lpn);
        segment.nr_valid_pages.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove `lpn` from `segnum`'s valid-LPN list (its mapping moved
    /// elsewhere). Caller holds `mapping_mutex`.
    pub fn remove_lpn(&mut self, segnum: usize, lpn: usize) {
        let segment = &mut self.segments[segnum];
        if let Some(pos) = segment.lpn_list.iter().position(|&l| l == lpn) {
            segment.lpn_list.remove(pos);
            segment.nr_valid_pages.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Reset a segment to the erased/free state after a successful
    /// `erase_segment` device call. Caller holds `mapping_mutex`.
    pub fn reset_after_erase(&mut self, segnum: usize) {
        let segment = &mut self.segments[segnum];
        segment.use_bits.clear_all();
        segment.lpn_list.clear();
        segment
            .nr_free_pages
            .store(self.pages_per_segment, Ordering::Release);
        segment.nr_valid_pages.store(0, Ordering::Release);
        segment.is_gc.store(false, Ordering::Release);
    }

    /// Total free pages across every segment (lock-free; used for the
    /// soft-GC threshold check).
    pub fn total_free_pages(&self) -> usize {
        self.segments.iter().map(Segment::nr_free_pages).sum()
    }

    pub fn total_pages(&self) -> usize {
        self.segments.len() * self.pages_per_segment
    }

    pub fn pages_per_segment(&self) -> usize {
        self.pages_per_segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_page_walks_lowest_index_first() {
        let mut table = SegmentTable::new(1, 4);
        assert_eq!(table.allocate_page(0), Some(0));
        assert_eq!(table.allocate_page(0), Some(1));
        assert_eq!(table.get(0).nr_free_pages(), 2);
    }

    #[test]
    fn allocate_page_exhausts_to_none() {
        let mut table = SegmentTable::new(1, 2);
        assert_eq!(table.allocate_page(0), Some(0));
        assert_eq!(table.allocate_page(0), Some(1));
        assert_eq!(table.allocate_page(0), None);
        assert_eq!(table.get(0).nr_free_pages(), 0);
    }

    #[test]
    fn append_and_remove_lpn_tracks_valid_count() {
        let mut table = SegmentTable::new(1, 4);
        table.append_lpn(0, 7);
        table.append_lpn(0, 9);
        assert_eq!(table.get(0).nr_valid_pages(), 2);
        assert_eq!(table.get(0).lpn_list(), &[7, 9]);
        table.remove_lpn(0, 7);
        assert_eq!(table.get(0).nr_valid_pages(), 1);
        assert_eq!(table.get(0).lpn_list(), &[9]);
    }

    #[test]
    fn reset_after_erase_restores_free_state() {
        let mut table = SegmentTable::new(1, 4);
        table.allocate_page(0);
        table.append_lpn(0, 3);
        table.get(0).set_is_gc(true);

        table.reset_after_erase(0);

        let segment = table.get(0);
        assert_eq!(segment.nr_free_pages(), 4);
        assert_eq!(segment.nr_valid_pages(), 0);
        assert!(segment.lpn_list().is_empty());
        assert!(!segment.is_gc());
    }
}
