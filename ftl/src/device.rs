//! The device abstraction the FTL writes through, plus a RAM-backed
//! reference implementation used by tests.
//!
//! The concrete backend is a pluggable detail: a real zoned SSD or
//! virtio-blk driver would implement [`Device`] the way
//! `storage::driver::BlockDevice` wraps VirtIO/NVMe/AHCI; [`RamDevice`] is a
//! minimal, fully-synchronous backend good enough to drive the algorithm
//! under test.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::DeviceGeometry;
use crate::error::{FtlError, Result};

/// A physical page number, packed as `(segment << page_bits) | page`.
///
/// `page_bits = ceil(log2(pages_per_segment))`, so the low bits always
/// address a page within a segment and the high bits always address the
/// segment itself.
pub fn pack_ppn(segment: usize, page: usize, page_bits: u32) -> u32 {
    ((segment as u32) << page_bits) | (page as u32)
}

/// Inverse of [`pack_ppn`]: `(segment, page)`.
pub fn unpack_ppn(ppn: u32, page_bits: u32) -> (usize, usize) {
    let page_mask = (1u32 << page_bits) - 1;
    ((ppn >> page_bits) as usize, (ppn & page_mask) as usize)
}

/// Synchronous block-erase device the FTL programs out-of-place writes to.
///
/// Implementations must be safe to call concurrently from multiple
/// threads (the write path and the GC worker both call through this
/// trait); the FTL itself never holds `mapping_mutex` across any of
/// these calls.
pub trait Device: Send + Sync {
    /// Fixed geometry of this device.
    fn geometry(&self) -> DeviceGeometry;

    /// Program a full physical page at `ppn`. `buf.len()` must equal
    /// `geometry().page_size`.
    fn write_page(&self, ppn: u32, buf: &[u8]) -> Result<()>;

    /// Read a full physical page from `ppn` into `buf`.
    fn read_page(&self, ppn: u32, buf: &mut [u8]) -> Result<()>;

    /// Erase every page in `segment`, returning it to the all-zero state.
    fn erase_segment(&self, segment: usize) -> Result<()>;
}

/// A flat, in-memory device backend: a single contiguous buffer guarded
/// by one [`spin::Mutex`].
pub struct RamDevice {
    geometry: DeviceGeometry,
    storage: Mutex<Vec<u8>>,
}

impl RamDevice {
    /// Allocate a zero-filled RAM device with the given geometry.
    pub fn new(geometry: DeviceGeometry) -> Self {
        let len = geometry.page_size * geometry.pages_per_segment * geometry.nr_segments;
        RamDevice {
            geometry,
            storage: Mutex::new(vec![0u8; len]),
        }
    }

    fn page_offset(&self, ppn: u32) -> Option<usize> {
        let page_bits = self.geometry.page_bits();
        let (segment, page) = unpack_ppn(ppn, page_bits);
        if segment >= self.geometry.nr_segments || page >= self.geometry.pages_per_segment {
            return None;
        }
        let page_index = segment * self.geometry.pages_per_segment + page;
        Some(page_index * self.geometry.page_size)
    }
}

impl Device for RamDevice {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn write_page(&self, ppn: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != self.geometry.page_size {
            return Err(FtlError::InvalidArgument);
        }
        let offset = self.page_offset(ppn).ok_or(FtlError::InvalidArgument)?;
        let mut storage = self.storage.lock();
        storage[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn read_page(&self, ppn: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.geometry.page_size {
            return Err(FtlError::InvalidArgument);
        }
        let offset = self.page_offset(ppn).ok_or(FtlError::InvalidArgument)?;
        let storage = self.storage.lock();
        buf.copy_from_slice(&storage[offset..offset + buf.len()]);
        Ok(())
    }

    fn erase_segment(&self, segment: usize) -> Result<()> {
        if segment >= self.geometry.nr_segments {
            return Err(FtlError::InvalidArgument);
        }
        let seg_bytes = self.geometry.page_size * self.geometry.pages_per_segment;
        let start = segment * seg_bytes;
        let mut storage = self.storage.lock();
        storage[start..start + seg_bytes].fill(0);
        Ok(())
    }
}

/// Injectable failure wrapper for tests that need to observe the write
/// path's behavior when a device I/O call fails partway through (the read
/// path failing during read-modify-write in particular).
#[cfg(test)]
pub struct FaultyDevice {
    inner: RamDevice,
    fail_write_ppn: Mutex<Option<u32>>,
    fail_read_ppn: Mutex<Option<u32>>,
}

#[cfg(test)]
impl FaultyDevice {
    pub fn new(geometry: DeviceGeometry) -> Self {
        FaultyDevice {
            inner: RamDevice::new(geometry),
            fail_write_ppn: Mutex::new(None),
            fail_read_ppn: Mutex::new(None),
        }
    }

    pub fn fail_next_write_to(&self, ppn: Option<u32>) {
        *self.fail_write_ppn.lock() = ppn;
    }

    pub fn fail_next_read_from(&self, ppn: Option<u32>) {
        *self.fail_read_ppn.lock() = ppn;
    }
}

#[cfg(test)]
impl Device for FaultyDevice {
    fn geometry(&self) -> DeviceGeometry {
        self.inner.geometry()
    }

    fn write_page(&self, ppn: u32, buf: &[u8]) -> Result<()> {
        let mut guard = self.fail_write_ppn.lock();
        if *guard == Some(ppn) {
            *guard = None;
            return Err(FtlError::DeviceIoError);
        }
        drop(guard);
        self.inner.write_page(ppn, buf)
    }

    fn read_page(&self, ppn: u32, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.fail_read_ppn.lock();
        if *guard == Some(ppn) {
            *guard = None;
            return Err(FtlError::DeviceIoError);
        }
        drop(guard);
        self.inner.read_page(ppn, buf)
    }

    fn erase_segment(&self, segment: usize) -> Result<()> {
        self.inner.erase_segment(segment)
    }
}
