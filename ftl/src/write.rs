//! The write and read paths: LPN/offset validation, read-modify-write for
//! partial pages, and the segment-bookkeeping update that follows a
//! successful device write.

use alloc::vec;

use log::{error, trace, warn};

use crate::config::{self, PADDR_EMPTY};
use crate::device::{unpack_ppn, Device};
use crate::error::{FtlError, Result};
use crate::Ftl;

impl<D: Device + 'static> Ftl<D> {
    /// `(lpn, offset)` for `sector`, or `InvalidArgument` if the LPN is
    /// out of range or `offset + len` overruns a page.
    fn validate_sector(&self, sector: u64, len: usize) -> Result<(usize, usize)> {
        let page_size = self.geometry.page_size as u64;
        let lpn = (sector / page_size) as usize;
        let offset = (sector % page_size) as usize;
        // `lpn > map_entries()` rather than `>=`, preserved from the
        // source's off-by-one; `lpn == map_entries()` is deliberately
        // admitted here and the mapping table (`map::Inner::new`) is
        // sized one slot larger than `map_entries()` so that admitted
        // value still indexes in-bounds instead of panicking.
        if lpn > self.geometry.map_entries() {
            return Err(FtlError::InvalidArgument);
        }
        if offset + len > self.geometry.page_size {
            return Err(FtlError::InvalidArgument);
        }
        Ok((lpn, offset))
    }

    /// Read `buf.len()` bytes at `sector`. An LPN with no mapping reads
    /// back as zeros.
    pub fn read(&self, sector: u64, buf: &mut [u8]) -> Result<usize> {
        let (lpn, offset) = self.validate_sector(sector, buf.len())?;
        let ppn = self.inner.lock().lookup(lpn);
        if ppn == PADDR_EMPTY {
            buf.fill(0);
            self.record_read();
            return Ok(buf.len());
        }
        let mut page = vec![0u8; self.geometry.page_size];
        if let Err(e) = self.device.read_page(ppn, &mut page) {
            error!("read failed at lpn {} ppn {}: {}", lpn, ppn, e);
            return Err(e);
        }
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
        self.record_read();
        Ok(buf.len())
    }

    pub fn write(&self, sector: u64, data: &[u8]) -> Result<usize> {
        self.write_with_paddr(sector, data).map(|(written, _ppn)| written)
    }

    /// Like [`Ftl::write`] but also returns the physical page the write
    /// landed on, so `submit_request` can fill `Request::paddr`.
    pub(crate) fn write_with_paddr(&self, sector: u64, data: &[u8]) -> Result<(usize, u32)> {
        let (lpn, offset) = self.validate_sector(sector, data.len())?;
        let new_ppn = self.allocate_with_gc_retry()?;
        let result = self.write_to_ppn(lpn, offset, data, new_ppn);
        if result.is_ok() {
            self.record_write();
        }
        result.map(|()| (data.len(), new_ppn))
    }

    /// Shared by the host write path and GC migration: read-modify-write
    /// `data` into page `new_ppn` for `lpn` at `offset`, then update
    /// segment bookkeeping on success.
    pub(crate) fn write_to_ppn(&self, lpn: usize, offset: usize, data: &[u8], new_ppn: u32) -> Result<()> {
        let old_ppn = self.inner.lock().lookup(lpn);
        let is_exist = old_ppn != PADDR_EMPTY;
        let mut scratch = vec![0u8; self.geometry.page_size];

        // Sub-page overwrite predicate. When `offset == 0` but the write
        // is shorter than a full page, no pre-read happens and the tail
        // of the old page is silently zero-filled instead of preserved.
        // Kept as-is rather than "corrected" underneath existing callers;
        // pinned by `tests::offset_zero_partial_write_zero_fills_tail_instead_of_preserving_it`.
        let needs_read = is_exist && !(offset == 0 || data.len() == self.geometry.page_size);
        if needs_read {
            if let Err(e) = self.device.read_page(old_ppn, &mut scratch) {
                error!("read-for-overwrite failed at lpn {} ppn {}: {}", lpn, old_ppn, e);
                return Err(e);
            }
        }
        scratch[offset..offset + data.len()].copy_from_slice(data);

        if let Err(e) = self.device.write_page(new_ppn, &scratch) {
            error!("device write failed at lpn {} ppn {}: {}", lpn, new_ppn, e);
            return Err(e);
        }

        self.update_metadata(lpn, old_ppn, new_ppn);
        Ok(())
    }

    /// Allocate a fresh PPN, forcing a GC pass and retrying once if the
    /// allocator is exhausted.
    pub(crate) fn allocate_with_gc_retry(&self) -> Result<u32> {
        if let Some(ppn) = self.inner.lock().get_free_page() {
            return Ok(ppn);
        }
        warn!("allocator exhausted, forcing gc before retrying allocation");
        let _report = self.run_gc(config::GC_RATIO_ALL);
        self.inner
            .lock()
            .get_free_page()
            .ok_or(FtlError::DeviceExhausted)
    }

    /// Bookkeeping that follows a successful write of `lpn` to `new_ppn`:
    /// invalidate the old mapping (if any), record the new one, and queue
    /// any segment that just became dirty for GC -- unless that segment is
    /// itself the active victim of an in-progress GC pass, in which case
    /// its own migration is already handling it.
    pub(crate) fn update_metadata(&self, lpn: usize, old_ppn: u32, new_ppn: u32) {
        let page_bits = self.geometry.page_bits();
        let mut inner = self.inner.lock();
        if old_ppn != PADDR_EMPTY {
            let (old_seg, _) = unpack_ppn(old_ppn, page_bits);
            inner.segments.remove_lpn(old_seg, lpn);
            // Skip the auto-enqueue while `old_seg` is itself the active
            // victim of a GC pass (its own migration is what's invalidating
            // this LPN): re-queuing a segment mid-reclaim would hand it
            // straight back to the next `dequeue` before the erase that's
            // about to free it actually runs.
            if inner.segments.get(old_seg).nr_free_pages() == 0 && !inner.segments.get(old_seg).is_gc() {
                inner.gc_list.enqueue(old_seg);
            }
            trace!("invalidated lpn {} at ppn {}", lpn, old_ppn);
        }
        let (new_seg, _) = unpack_ppn(new_ppn, page_bits);
        inner.segments.append_lpn(new_seg, lpn);
        inner.set_mapping(lpn, new_ppn);
        trace!("mapped lpn {} -> ppn {}", lpn, new_ppn);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DeviceGeometry;
    use crate::device::{pack_ppn, FaultyDevice, RamDevice};
    use crate::error::FtlError;
    use crate::Ftl;

    fn geo() -> DeviceGeometry {
        DeviceGeometry {
            page_size: 16,
            pages_per_segment: 4,
            nr_segments: 4,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let ftl = Ftl::open(RamDevice::new(geo()));
        let payload = [0xAAu8; 16];
        ftl.write(0, &payload).unwrap();
        let mut out = [0u8; 16];
        ftl.read(0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn unmapped_lpn_reads_as_zero() {
        let ftl = Ftl::open(RamDevice::new(geo()));
        let mut out = [0xFFu8; 16];
        ftl.read(16, &mut out).unwrap();
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    fn offset_plus_len_over_page_is_rejected() {
        let ftl = Ftl::open(RamDevice::new(geo()));
        let payload = [0u8; 10];
        assert_eq!(ftl.write(8, &payload), Err(FtlError::InvalidArgument));
    }

    #[test]
    fn lpn_over_bound_is_rejected() {
        let ftl = Ftl::open(RamDevice::new(geo()));
        let geometry = ftl.geometry();
        let over_bound_sector = (geometry.map_entries() as u64 + 1) * geometry.page_size as u64;
        let payload = [0u8; 16];
        assert_eq!(ftl.write(over_bound_sector, &payload), Err(FtlError::InvalidArgument));
    }

    #[test]
    fn lpn_exactly_at_bound_is_accepted_without_panicking() {
        // `lpn == map_entries()` passes `validate_sector`'s `>` check by
        // design; it must not panic indexing `trans_map` (regression test
        // for the off-by-one between the bound check and the table size).
        let ftl = Ftl::open(RamDevice::new(geo()));
        let geometry = ftl.geometry();
        let at_bound_sector = geometry.map_entries() as u64 * geometry.page_size as u64;
        let payload = [0x77u8; 16];
        ftl.write(at_bound_sector, &payload).unwrap();
        let mut out = [0u8; 16];
        ftl.read(at_bound_sector, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn sub_page_overwrite_at_nonzero_offset_preserves_the_rest_of_the_page() {
        let ftl = Ftl::open(RamDevice::new(geo()));
        ftl.write(0, &[0xAAu8; 16]).unwrap();
        ftl.write(8, &[0xBBu8; 4]).unwrap();
        let mut out = [0u8; 16];
        ftl.read(0, &mut out).unwrap();
        let mut expected = [0xAAu8; 16];
        expected[8..12].copy_from_slice(&[0xBBu8; 4]);
        assert_eq!(out, expected);
    }

    #[test]
    fn offset_zero_partial_write_zero_fills_tail_instead_of_preserving_it() {
        // Regression test pinning the sub-page-write predicate exactly as
        // specified: `offset == 0` skips the pre-read even when the
        // write is shorter than a full page, so the untouched tail comes
        // back as zero rather than the prior page's contents.
        let ftl = Ftl::open(RamDevice::new(geo()));
        ftl.write(0, &[0xAAu8; 16]).unwrap();
        ftl.write(0, &[0xBBu8; 4]).unwrap();
        let mut out = [0u8; 16];
        ftl.read(0, &mut out).unwrap();
        let mut expected = [0u8; 16];
        expected[0..4].copy_from_slice(&[0xBBu8; 4]);
        assert_eq!(out, expected);
    }

    #[test]
    fn failed_pre_read_aborts_write_leaving_old_mapping_intact() {
        let dev = FaultyDevice::new(geo());
        let ftl = Ftl::open(dev);
        ftl.write(0, &[0xAAu8; 16]).unwrap();
        let geometry = ftl.geometry();
        let (_, page) = crate::device::unpack_ppn(ftl.inner.lock().lookup(0), geometry.page_bits());
        let old_ppn = pack_ppn(0, page, geometry.page_bits());
        ftl.device.fail_next_read_from(Some(old_ppn));

        let result = ftl.write(4, &[0xBBu8; 4]);
        assert_eq!(result, Err(FtlError::DeviceIoError));

        // the mapping is untouched: a full-page read still returns the
        // original payload, not a half-written scratch buffer.
        let mut out = [0u8; 16];
        ftl.read(0, &mut out).unwrap();
        assert_eq!(out, [0xAAu8; 16]);
    }
}
