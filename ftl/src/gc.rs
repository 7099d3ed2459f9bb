//! Garbage collection: victim selection from the GC FIFO, per-victim
//! migration of live pages, and segment erase/reset.

use alloc::vec;

use log::{debug, error, warn};

use crate::bitmap::Bitmap;
use crate::config;
use crate::device::{unpack_ppn, Device};
use crate::error::Result;
use crate::{Ftl, IoctlCmd};

/// What happened to one LPN during victim migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Copied to a fresh page in a different segment.
    Migrated,
    /// The mapping no longer pointed into the victim by the time it was
    /// read; nothing to do.
    Stale,
    /// The device failed to read the page. The LPN is dropped from the
    /// victim's list and its data is lost.
    ReadError,
    /// The device failed to write (or allocate a page for) the migrated
    /// copy. The LPN's old mapping is left untouched.
    WriteError,
}

/// Summary of one GC pass, useful for tests and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcReport {
    pub segments_reclaimed: usize,
    pub pages_migrated: usize,
    pub stale_skipped: usize,
    pub read_errors: usize,
    /// Victims that still held live, unmigrated pages when their budget
    /// ran out -- too little free space existed anywhere on the device to
    /// move them. Left on the GC list for a later pass rather than erased.
    pub segments_deferred: usize,
}

impl<D: Device + 'static> Ftl<D> {
    /// `ioctl(Trim)`: synchronously reclaim every dirty segment.
    pub fn ioctl(&self, cmd: IoctlCmd) -> Result<()> {
        match cmd {
            IoctlCmd::Trim => {
                self.run_gc(config::GC_RATIO_ALL);
                Ok(())
            }
        }
    }

    /// Run the background worker's periodic pass: reclaim only if the
    /// free-page ratio has dropped below the soft-GC threshold, and only
    /// a bounded fraction of the dirty list.
    pub fn run_soft_gc(&self) -> GcReport {
        if self.free_page_ratio() >= config::GC_THRESHOLD {
            return GcReport::default();
        }
        self.run_gc(config::GC_RATIO)
    }

    /// Reclaim a `ratio` fraction of the current dirty-list length
    /// (rounded up, at least one segment), or the whole list when
    /// `ratio >= 1.0`. Serialized by `gc_mutex` so only one reclaimer
    /// runs at a time.
    pub(crate) fn run_gc(&self, ratio: f64) -> GcReport {
        let _guard = self.gc_mutex.lock();
        let mut report = GcReport::default();

        let budget = if ratio >= 1.0 {
            usize::MAX
        } else {
            let dirty = self.inner.lock().gc_list.len();
            if dirty == 0 {
                return report;
            }
            core::cmp::max(1, (dirty as f64 * ratio).ceil() as usize)
        };

        // Victims that come out of this pass still holding live pages (no
        // destination page existed anywhere) are collected here rather
        // than re-enqueued immediately: re-enqueuing mid-pass would hand
        // them straight back to `dequeue` on the very next iteration and
        // spin forever when the whole device is this starved.
        let mut deferred = alloc::vec::Vec::new();

        // Segments this pass has already victimized once. A migration's
        // destination segment can itself fill up and get re-queued before
        // this pass ends; without this guard a fully-live device could
        // ping-pong the same pages back and forth between two segments
        // for as long as `budget` allows (unbounded under forced GC)
        // without ever making net progress. Once a segment has been
        // migrated out of this pass, any further appearance on the queue
        // this pass is deferred rather than reprocessed.
        let nr_segments = self.inner.lock().segments.len();
        let mut seen = Bitmap::new(nr_segments);
        let mut migrations_attempted = 0usize;

        loop {
            if migrations_attempted >= budget {
                break;
            }
            let victim = match self.inner.lock().gc_list.dequeue() {
                Some(v) => v,
                None => break,
            };
            if seen.get(victim) {
                deferred.push(victim);
                continue;
            }
            seen.set(victim);
            migrations_attempted += 1;
            if !self.migrate_victim(victim, &mut report) {
                deferred.push(victim);
            }
        }

        if !deferred.is_empty() {
            report.segments_deferred = deferred.len();
            let mut inner = self.inner.lock();
            for victim in deferred {
                inner.segments.get(victim).set_is_gc(false);
                inner.gc_list.enqueue(victim);
            }
        }

        if report.segments_reclaimed > 0 || report.segments_deferred > 0 {
            debug!(
                "gc pass: reclaimed={} migrated={} stale={} read_errors={} deferred={}",
                report.segments_reclaimed,
                report.pages_migrated,
                report.stale_skipped,
                report.read_errors,
                report.segments_deferred
            );
        }
        report
    }

    /// Migrate every live LPN out of `victim`, then erase it -- but only
    /// if every live LPN actually found a new home. Erasing a segment
    /// that still has a live, unmigrated LPN pointing into it would wipe
    /// that LPN's only copy out from under its still-valid mapping
    /// (invariant 1), so instead the victim is left in place for the
    /// caller to re-queue. Returns whether the victim was reclaimed.
    fn migrate_victim(&self, victim: usize, report: &mut GcReport) -> bool {
        self.inner.lock().segments.get(victim).set_is_gc(true);

        let lpns: alloc::vec::Vec<usize> = self.inner.lock().segments.get(victim).lpn_list().to_vec();
        for lpn in lpns {
            match self.migrate_lpn(lpn, victim) {
                MigrationOutcome::Migrated => report.pages_migrated += 1,
                MigrationOutcome::Stale => report.stale_skipped += 1,
                MigrationOutcome::ReadError => report.read_errors += 1,
                MigrationOutcome::WriteError => {
                    warn!("gc: failed to migrate lpn {} out of segment {}, leaving in place", lpn, victim);
                }
            }
        }

        if self.inner.lock().segments.get(victim).nr_valid_pages() > 0 {
            warn!("gc: segment {} still has live pages after migration, deferring erase", victim);
            return false;
        }

        match self.device.erase_segment(victim) {
            Ok(()) => {
                self.inner.lock().segments.reset_after_erase(victim);
                report.segments_reclaimed += 1;
                true
            }
            Err(e) => {
                error!("gc: erase of segment {} failed: {}, leaving queued for retry", victim, e);
                false
            }
        }
    }

    /// Migrate a single LPN out of `victim`, or report why it couldn't be.
    fn migrate_lpn(&self, lpn: usize, victim: usize) -> MigrationOutcome {
        let page_bits = self.geometry.page_bits();
        let current_ppn = self.inner.lock().lookup(lpn);
        let (current_seg, _) = unpack_ppn(current_ppn, page_bits);
        if current_seg != victim {
            return MigrationOutcome::Stale;
        }

        let mut scratch = vec![0u8; self.geometry.page_size];
        if let Err(e) = self.device.read_page(current_ppn, &mut scratch) {
            error!("gc: read of lpn {} at ppn {} failed: {}, dropping", lpn, current_ppn, e);
            self.inner.lock().segments.remove_lpn(victim, lpn);
            self.inner.lock().set_mapping(lpn, config::PADDR_EMPTY);
            return MigrationOutcome::ReadError;
        }

        let new_ppn = match self.inner.lock().get_free_page() {
            Some(ppn) => ppn,
            None => return MigrationOutcome::WriteError,
        };
        match self.write_to_ppn(lpn, 0, &scratch, new_ppn) {
            Ok(()) => MigrationOutcome::Migrated,
            Err(_) => MigrationOutcome::WriteError,
        }
    }
}
