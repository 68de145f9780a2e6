//! Tracker: the write-filter bound to one source device.
//!
//! Every write to a tracked device runs `Tracker::filter` before it is
//! allowed onto the device queue. Grounded on
//! `original_source/module/tracker.c`'s `tracker_submit_bio` three-step
//! sequence (mark CBT, check armed, CoW-copy) and on the
//! `BlockDevice` request path (`kernel/block.rs`) for the
//! split-into-sub-requests / refcount idiom.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cbt::CbtMap;
use crate::diff_area::DiffArea;
use crate::error::Error;
use crate::types::DeviceId;

/// What the write-filter tells the caller to do with the bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Let the write proceed to the device queue.
    Pass,
    /// Complete the bio now without forwarding it; the `nowait` caller
    /// resubmits once the in-flight copy it raced settles.
    Complete,
}

/// One write-filter instance, bound to a single source device for its
/// whole lifetime.
pub struct Tracker {
    device_id: DeviceId,
    cbt: CbtMap,
    diff_area: std::sync::Mutex<Option<Arc<DiffArea>>>,
    armed: AtomicBool,
    refcount: AtomicUsize,
}

impl Tracker {
    pub fn new(device_id: DeviceId, capacity_sectors: u64) -> Self {
        Self {
            device_id,
            cbt: CbtMap::new(capacity_sectors),
            diff_area: std::sync::Mutex::new(None),
            armed: AtomicBool::new(false),
            refcount: AtomicUsize::new(0),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn cbt(&self) -> &CbtMap {
        &self.cbt
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Step 3 of `take`: binds the diff area this tracker will CoW into
    /// and flips the armed flag. Called once the device's queue is
    /// quiesced.
    pub fn arm(&self, diff_area: Arc<DiffArea>) {
        *self.diff_area.lock().unwrap() = Some(diff_area);
        self.armed.store(true, Ordering::Release);
    }

    /// Tears down the binding to a diff area once the snapshot holding
    /// it is destroyed. Tracking (CBT) continues independent of arming.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        *self.diff_area.lock().unwrap() = None;
    }

    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_busy(&self) -> bool {
        self.refcount.load(Ordering::Acquire) > 0 || self.is_armed()
    }

    /// The write-filter itself: called for every write that reaches this
    /// device before it is allowed to proceed.
    ///
    /// 1. Marks the CBT map dirty for `[sector, sector+count)` — never
    ///    blocks, never fails the write.
    /// 2. If unarmed, the write passes through untouched.
    /// 3. If armed, preserves the original contents via the diff area
    ///    before letting the write proceed. A successful or failed copy
    ///    both result in `Pass`: a CoW failure poisons the diff area
    ///    (corruption surfaces on later image reads and on the event
    ///    queue) but never blocks or fails the write itself. Only a
    ///    `nowait` caller racing an in-flight copy of the same chunk
    ///    gets `Complete`, to resubmit once it settles.
    pub fn filter(&self, sector: u64, count: u64, nowait: bool) -> FilterOutcome {
        self.cbt.set(sector, count);

        if !self.is_armed() {
            return FilterOutcome::Pass;
        }

        let diff_area = self.diff_area.lock().unwrap().clone();
        let Some(diff_area) = diff_area else {
            debug!(device = %self.device_id, "armed flag set with no diff area bound");
            return FilterOutcome::Pass;
        };

        match diff_area.copy(sector, count, nowait) {
            Ok(()) => FilterOutcome::Pass,
            Err(Error::Retryable) => FilterOutcome::Complete,
            Err(err) => {
                warn!(device = %self.device_id, ?err, "CoW copy failed, write proceeding uncovered");
                FilterOutcome::Pass
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::DiffBufferPool;
    use crate::event_queue::EventQueue;
    use crate::io_engine::{BlockBackend, DiffIoEngine, MemBackend};
    use crate::storage::DiffStorage;
    use crate::worker_pool::WorkerPool;

    fn armed_tracker(capacity: u64) -> (Tracker, Arc<MemBackend>) {
        let tracker = Tracker::new(DeviceId::new(8, 0), capacity);
        let source = Arc::new(MemBackend::new(capacity));
        let diff_store: Arc<dyn BlockBackend> = Arc::new(MemBackend::new(capacity));
        let (events, _handle) = EventQueue::new(16);
        let storage = Arc::new(DiffStorage::new(0, events.clone()));
        storage.append(DeviceId::new(9, 0), 0, capacity).unwrap();
        let pool = Arc::new(WorkerPool::new(2));
        let diff_area = Arc::new(DiffArea::new(
            8,
            source.clone(),
            diff_store,
            storage,
            DiffBufferPool::new(capacity),
            DiffIoEngine::new(pool),
            events,
        ));
        tracker.arm(diff_area);
        (tracker, source)
    }

    #[test]
    fn unarmed_filter_only_marks_cbt_and_never_touches_a_diff_area() {
        let tracker = Tracker::new(DeviceId::new(8, 0), 1 << 20);
        assert_eq!(tracker.filter(0, 8, false), FilterOutcome::Pass);
        assert_eq!(tracker.cbt().snap_numbers(), (0, 1));
    }

    #[test]
    fn armed_filter_preserves_original_contents_before_the_write_proceeds() {
        let (tracker, source) = armed_tracker(64);
        source.write_at(0, &[0x42u8; 4096]).unwrap();

        assert_eq!(tracker.filter(0, 8, false), FilterOutcome::Pass);
        // In a real device the caller would now perform the actual write;
        // the filter only guarantees the original was preserved first.
        source.write_at(0, &[0x99u8; 4096]).unwrap();

        let mut out = vec![0u8; 4096];
        tracker.diff_area.lock().unwrap().as_ref().unwrap().read(0, 8, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn disarm_reverts_to_pass_through_but_keeps_cbt_tracking() {
        let (tracker, _source) = armed_tracker(64);
        tracker.disarm();
        assert!(!tracker.is_armed());
        assert_eq!(tracker.filter(0, 8, false), FilterOutcome::Pass);
        assert_eq!(tracker.cbt().snap_numbers(), (0, 1));
    }

    #[test]
    fn busy_tracks_refcount_and_armed_state() {
        let tracker = Tracker::new(DeviceId::new(8, 0), 1 << 20);
        assert!(!tracker.is_busy());
        tracker.acquire();
        assert!(tracker.is_busy());
        tracker.release();
        assert!(!tracker.is_busy());
    }
}
