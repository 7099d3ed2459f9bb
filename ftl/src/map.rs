//! Logical-to-physical mapping table, the segment-local free-page
//! allocator, and the GC-candidate queue they feed.
//!
//! Everything in this module is reached only while `Ftl::mapping_mutex`
//! is held; nothing here ever calls into a [`crate::device::Device`].

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::bitmap::Bitmap;
use crate::config::PADDR_EMPTY;
use crate::device::pack_ppn;
use crate::segment::SegmentTable;

/// FIFO queue of segments whose free pages are exhausted, with an O(1)
/// membership check via a parallel bitmap.
pub struct GcList {
    queue: VecDeque<usize>,
    membership: Bitmap,
}

impl GcList {
    pub fn new(nr_segments: usize) -> Self {
        GcList {
            queue: VecDeque::new(),
            membership: Bitmap::new(nr_segments),
        }
    }

    pub fn is_queued(&self, segment: usize) -> bool {
        self.membership.get(segment)
    }

    /// Append `segment` to the tail unless it is already queued.
    pub fn enqueue(&mut self, segment: usize) {
        if !self.membership.get(segment) {
            self.membership.set(segment);
            self.queue.push_back(segment);
        }
    }

    /// Pop the head of the queue, clearing its membership bit.
    pub fn dequeue(&mut self) -> Option<usize> {
        let segment = self.queue.pop_front()?;
        self.membership.clear(segment);
        Some(segment)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Everything reachable only while the mapping lock is held: the
/// LPN-to-PPN table, the segment table, the allocator's round-robin
/// cursor, and the GC queue the allocator and the write path both feed.
pub struct Inner {
    trans_map: Vec<u32>,
    pub segments: SegmentTable,
    cursor: usize,
    pub gc_list: GcList,
    page_bits: u32,
}

impl Inner {
    /// `bound` is the `M` from `DeviceGeometry::map_entries` -- the
    /// comparand the write path's `lpn > M` check uses. `trans_map` is
    /// allocated with `M + 1` slots (valid indices `0..=M`) so that the
    /// off-by-one the `>` check deliberately admits (`lpn == M`) lands
    /// in-bounds instead of panicking.
    pub fn new(bound: usize, nr_segments: usize, pages_per_segment: usize, page_bits: u32) -> Self {
        Inner {
            trans_map: vec![PADDR_EMPTY; bound + 1],
            segments: SegmentTable::new(nr_segments, pages_per_segment),
            cursor: 0,
            gc_list: GcList::new(nr_segments),
            page_bits,
        }
    }

    /// `M`, the bound the write path's `lpn > M` check compares against
    /// (one less than `trans_map`'s actual length).
    pub fn map_entries(&self) -> usize {
        self.trans_map.len() - 1
    }

    /// `trans_map[lpn]`, or `PADDR_EMPTY` if `lpn` is out of range.
    pub fn lookup(&self, lpn: usize) -> u32 {
        self.trans_map.get(lpn).copied().unwrap_or(PADDR_EMPTY)
    }

    /// Overwrite `trans_map[lpn]`. Caller holds the mapping lock.
    pub fn set_mapping(&mut self, lpn: usize, ppn: u32) {
        self.trans_map[lpn] = ppn;
    }

    /// Round-robin lowest-index-first allocator: hands out the next free
    /// page in the current cursor segment, enqueuing it for GC and
    /// advancing the cursor when it fills. Returns `None` if every
    /// segment is full.
    pub fn get_free_page(&mut self) -> Option<u32> {
        let nr_segments = self.segments.len();
        if nr_segments == 0 {
            return None;
        }

        for step in 0..nr_segments {
            let segnum = (self.cursor + step) % nr_segments;
            if self.segments.get(segnum).nr_free_pages() == 0 {
                continue;
            }
            let page = self
                .segments
                .allocate_page(segnum)
                .expect("segment reported free pages but allocation failed");
            if self.segments.get(segnum).nr_free_pages() == 0 {
                self.gc_list.enqueue(segnum);
                self.cursor = (segnum + 1) % nr_segments;
            } else {
                self.cursor = segnum;
            }
            return Some(pack_ppn(segnum, page, self.page_bits));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_list_enqueue_is_idempotent() {
        let mut list = GcList::new(4);
        list.enqueue(2);
        list.enqueue(2);
        assert_eq!(list.len(), 1);
        assert!(list.is_queued(2));
    }

    #[test]
    fn gc_list_dequeue_clears_membership() {
        let mut list = GcList::new(4);
        list.enqueue(1);
        list.enqueue(3);
        assert_eq!(list.dequeue(), Some(1));
        assert!(!list.is_queued(1));
        assert_eq!(list.dequeue(), Some(3));
        assert_eq!(list.dequeue(), None);
    }

    #[test]
    fn lookup_out_of_range_returns_empty_sentinel() {
        let inner = Inner::new(4, 2, 4, 2);
        assert_eq!(inner.lookup(100), PADDR_EMPTY);
    }

    #[test]
    fn get_free_page_advances_cursor_and_enqueues_full_segment() {
        let mut inner = Inner::new(16, 2, 2, 1);
        let p0 = inner.get_free_page().unwrap();
        let p1 = inner.get_free_page().unwrap();
        assert_ne!(p0, p1);
        // Segment 0 (2 pages) is now full and queued for GC.
        assert!(inner.gc_list.is_queued(0));
        let p2 = inner.get_free_page().unwrap();
        let (segment, _) = crate::device::unpack_ppn(p2, 1);
        assert_eq!(segment, 1);
    }

    #[test]
    fn get_free_page_returns_none_when_device_full() {
        let mut inner = Inner::new(4, 1, 2, 1);
        inner.get_free_page().unwrap();
        inner.get_free_page().unwrap();
        assert_eq!(inner.get_free_page(), None);
    }
}
