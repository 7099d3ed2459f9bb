#![cfg_attr(not(any(test, feature = "std")), no_std)]
//! Page-level flash translation layer: maintains a logical-to-physical
//! page mapping over a [`device::Device`], coalesces sub-page writes via
//! read-modify-write, and reclaims space with a FIFO garbage collector.
//!
//! The host-facing surface is [`Ftl::read`]/[`Ftl::write`]/[`Ftl::ioctl`],
//! or [`Ftl::submit_request`] for callers that prefer the flag-dispatched
//! [`Request`] record.

extern crate alloc;

pub mod bitmap;
pub mod config;
pub mod device;
pub mod error;
pub mod map;
pub mod segment;
pub mod worker;

mod gc;
mod write;

#[cfg(test)]
mod proptests;

pub use gc::{GcReport, MigrationOutcome};

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};
use spin::Mutex;

pub use error::{FtlError, Result};

use config::DeviceGeometry;
use device::Device;
use map::Inner;
use worker::{GcSpawner, JoinHandle};

/// Per-segment diagnostic snapshot returned by [`Ftl::segment_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    pub nr_free_pages: usize,
    pub nr_valid_pages: usize,
    pub is_gc: bool,
}

/// Outcome a completed [`Request`] is reported with via `end_rq`.
pub struct RequestOutcome {
    pub sector: u64,
    /// Physical page the write landed on. `config::PADDR_EMPTY` for reads
    /// and ioctls.
    pub paddr: u32,
    pub rq_private: usize,
    pub result: Result<usize>,
}

/// Which operation a [`Request`] dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFlag {
    Read,
    Write,
    Ioctl(IoctlCmd),
}

/// Supported `ioctl` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Synchronously reclaim every dirty segment.
    Trim,
}

/// A host I/O request. `data` is the caller's buffer; on a write only
/// `data[..data_len]` is consumed, on a read only `data[..data_len]` is
/// filled. `end_rq`, if present, is invoked exactly once with the
/// request's outcome and is responsible for freeing any host-owned
/// buffer attached via `rq_private`.
pub struct Request<'a> {
    pub flag: RequestFlag,
    pub sector: u64,
    pub data: &'a mut [u8],
    pub data_len: usize,
    pub paddr: u32,
    pub rq_private: usize,
    pub end_rq: Option<Box<dyn FnOnce(RequestOutcome) + 'a>>,
}

impl<'a> Request<'a> {
    pub fn new(flag: RequestFlag, sector: u64, data: &'a mut [u8], data_len: usize) -> Self {
        Request {
            flag,
            sector,
            data,
            data_len,
            paddr: config::PADDR_EMPTY,
            rq_private: 0,
            end_rq: None,
        }
    }
}

/// A page-level FTL over device `D`.
pub struct Ftl<D: Device> {
    device: D,
    geometry: DeviceGeometry,
    inner: Mutex<Inner>,
    gc_mutex: Mutex<()>,
    worker: Mutex<Option<Box<dyn JoinHandle>>>,
    nr_writes: AtomicUsize,
    nr_reads: AtomicUsize,
}

impl<D: Device + 'static> Ftl<D> {
    /// Open an FTL over `device` with no background GC worker; GC only
    /// runs synchronously (from the write path on exhaustion, or via
    /// `ioctl(Trim)`).
    pub fn open(device: D) -> Arc<Self> {
        let geometry = device.geometry();
        let inner = Inner::new(
            geometry.map_entries(),
            geometry.nr_segments,
            geometry.pages_per_segment,
            geometry.page_bits(),
        );
        debug!(
            "ftl open: page_size={} pages_per_segment={} nr_segments={} map_entries={}",
            geometry.page_size,
            geometry.pages_per_segment,
            geometry.nr_segments,
            inner.map_entries()
        );
        Arc::new(Ftl {
            device,
            geometry,
            inner: Mutex::new(inner),
            gc_mutex: Mutex::new(()),
            worker: Mutex::new(None),
            nr_writes: AtomicUsize::new(0),
            nr_reads: AtomicUsize::new(0),
        })
    }

    /// Open an FTL and launch a background GC worker via `spawner`.
    pub fn open_with_gc(device: D, spawner: &dyn GcSpawner<D>) -> Arc<Self> {
        let ftl = Self::open(device);
        let handle = spawner.spawn(ftl.clone());
        *ftl.worker.lock() = Some(handle);
        ftl
    }

    /// Signal and join the background GC worker, if one was launched.
    /// Does not flush or quiesce in-flight device I/O beyond what the
    /// caller has already issued.
    pub fn close(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.join();
        }
        debug!("ftl close");
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    /// Fraction of total pages currently free, across every segment.
    pub fn free_page_ratio(&self) -> f64 {
        let inner = self.inner.lock();
        let total = inner.segments.total_pages();
        if total == 0 {
            return 1.0;
        }
        inner.segments.total_free_pages() as f64 / total as f64
    }

    pub fn nr_writes(&self) -> usize {
        self.nr_writes.load(Ordering::Relaxed)
    }

    pub fn nr_reads(&self) -> usize {
        self.nr_reads.load(Ordering::Relaxed)
    }

    /// Per-segment counters, read without taking `mapping_mutex` (the
    /// same atomics the soft-GC threshold check and `free_page_ratio`
    /// read from).
    pub fn segment_stats(&self, segnum: usize) -> SegmentStats {
        let inner = self.inner.lock();
        let segment = inner.segments.get(segnum);
        SegmentStats {
            nr_free_pages: segment.nr_free_pages(),
            nr_valid_pages: segment.nr_valid_pages(),
            is_gc: segment.is_gc(),
        }
    }

    /// The physical page `sector`'s LPN currently maps to, or `None` if
    /// unmapped.
    pub fn ppn_for_sector(&self, sector: u64) -> Option<u32> {
        let lpn = (sector / self.geometry.page_size as u64) as usize;
        let ppn = self.inner.lock().lookup(lpn);
        if ppn == config::PADDR_EMPTY {
            None
        } else {
            Some(ppn)
        }
    }

    /// The segment component of a physical page number, per this FTL's geometry.
    pub fn segment_of(&self, ppn: u32) -> usize {
        device::unpack_ppn(ppn, self.geometry.page_bits()).0
    }

    fn record_write(&self) {
        self.nr_writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_read(&self) {
        self.nr_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Dispatch `request` by its flag, fill `paddr` on a successful
    /// write, and invoke `end_rq` with the outcome.
    pub fn submit_request(&self, mut request: Request<'_>) -> Result<usize> {
        trace!("submit_request: flag={:?} sector={}", request.flag, request.sector);
        let result = match request.flag {
            RequestFlag::Read => {
                let len = request.data_len;
                self.read(request.sector, &mut request.data[..len])
            }
            RequestFlag::Write => {
                let len = request.data_len;
                match self.write_with_paddr(request.sector, &request.data[..len]) {
                    Ok((written, ppn)) => {
                        request.paddr = ppn;
                        Ok(written)
                    }
                    Err(e) => Err(e),
                }
            }
            RequestFlag::Ioctl(cmd) => self.ioctl(cmd).map(|()| 0),
        };
        if let Some(end_rq) = request.end_rq.take() {
            end_rq(RequestOutcome {
                sector: request.sector,
                paddr: request.paddr,
                rq_private: request.rq_private,
                result,
            });
        }
        result
    }
}
