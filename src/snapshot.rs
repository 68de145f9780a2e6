//! Snapshot lifecycle: multi-device atomic capture and image
//! publishing.
//!
//! `FreezeGuard` is grounded on `prelude.rs`'s `PreemptGuard`: acquire
//! in `new`, release in `Drop`, so every device frozen during `take`
//! is guaranteed to thaw on every exit path, including an early `?`
//! return or a panic unwind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use uuid::Uuid;

use crate::buffer_pool::DiffBufferPool;
use crate::config::Config;
use crate::diff_area::DiffArea;
use crate::error::{Error, KResult};
use crate::event_queue::{EventQueue, EventQueueHandle, EventRecord};
use crate::image::SnapshotImage;
use crate::io_engine::{BlockBackend, DiffIoEngine};
use crate::storage::DiffStorage;
use crate::tracker::Tracker;
use crate::types::DeviceId;
use crate::worker_pool::WorkerPool;

/// Best-effort filesystem quiesce for one device. Real filesystem
/// freeze/thaw is out of scope for this crate; this is the minimal
/// trait the lifecycle needs so it can be exercised without one.
pub trait FreezeControl: Send + Sync {
    fn freeze(&self) -> KResult<()>;
    fn thaw(&self) -> KResult<()>;
}

/// A `FreezeControl` that always succeeds immediately — used where the
/// caller has no filesystem to quiesce (test doubles, devices with no
/// mounted filesystem).
pub struct NullFreeze;

impl FreezeControl for NullFreeze {
    fn freeze(&self) -> KResult<()> {
        Ok(())
    }
    fn thaw(&self) -> KResult<()> {
        Ok(())
    }
}

struct FreezeGuard {
    control: Arc<dyn FreezeControl>,
}

impl FreezeGuard {
    fn new(control: Arc<dyn FreezeControl>) -> KResult<Self> {
        control.freeze()?;
        Ok(Self { control })
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        let _ = self.control.thaw();
    }
}

static NEXT_IMAGE_MINOR: AtomicU16 = AtomicU16::new(0);

/// One multi-device capture: a set of Trackers sharing one Diff Storage
/// and Event Queue.
pub struct Snapshot {
    id: Uuid,
    trackers: Vec<Arc<Tracker>>,
    freeze_controls: Vec<Arc<dyn FreezeControl>>,
    diff_storage: Arc<DiffStorage>,
    buffer_pool: DiffBufferPool,
    worker_pool: Arc<WorkerPool>,
    chunk_size_sectors: u64,
    events: EventQueue,
    event_handle: EventQueueHandle,
    images: RwLock<Vec<Arc<SnapshotImage>>>,
    taken: AtomicBool,
}

impl Snapshot {
    pub fn new(
        config: &Config,
        trackers: Vec<Arc<Tracker>>,
        freeze_controls: Vec<Arc<dyn FreezeControl>>,
    ) -> Self {
        let (events, event_handle) = EventQueue::new(64);
        Self {
            id: Uuid::new_v4(),
            trackers,
            freeze_controls,
            diff_storage: Arc::new(DiffStorage::new(config.diff_storage_minimum_sectors, events.clone())),
            buffer_pool: DiffBufferPool::new(config.buffer_pool_max_sectors),
            worker_pool: Arc::new(WorkerPool::new(config.worker_threads)),
            chunk_size_sectors: config.diff_area_chunk_size / crate::types::SECTOR_SIZE,
            events,
            event_handle,
            images: RwLock::new(Vec::new()),
            taken: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn trackers(&self) -> &[Arc<Tracker>] {
        &self.trackers
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }

    /// Forwards appended storage to this snapshot's Diff Storage.
    pub fn append_storage(&self, device_id: DeviceId, start: u64, count: u64) -> KResult<()> {
        self.diff_storage.append(device_id, start, count)
    }

    /// The atomic capture. All-or-nothing: on any failure, every
    /// tracker armed so far is disarmed, every frozen device is thawed,
    /// and no images are published.
    pub fn take(
        &self,
        source_backends: &HashMap<DeviceId, Arc<dyn BlockBackend>>,
        diff_store_backend: Arc<dyn BlockBackend>,
    ) -> KResult<()> {
        if self.taken.load(Ordering::Acquire) {
            return Err(Error::Invalid);
        }

        // Phase 1: one Diff Area per tracker, sharing this snapshot's
        // Diff Storage and buffer pool.
        let mut diff_areas = Vec::with_capacity(self.trackers.len());
        for tracker in &self.trackers {
            let source = source_backends
                .get(&tracker.device_id())
                .ok_or(Error::NotFound)?
                .clone();
            diff_areas.push(Arc::new(DiffArea::new(
                self.chunk_size_sectors,
                source,
                diff_store_backend.clone(),
                self.diff_storage.clone(),
                self.buffer_pool.clone(),
                DiffIoEngine::new(self.worker_pool.clone()),
                self.events.clone(),
            )));
        }

        // Phase 2: freeze every device in order. Any failure thaws
        // what's already frozen, in reverse, and fails the capture.
        let mut guards = Vec::with_capacity(self.freeze_controls.len());
        for control in &self.freeze_controls {
            match FreezeGuard::new(control.clone()) {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    thaw_reverse(guards);
                    return Err(err);
                }
            }
        }

        // Phase 3: per tracker, quiesce (the device queue is modeled as
        // already stopped inside the freeze above), switch the CBT
        // generation, bind the diff area, arm.
        let mut armed = Vec::with_capacity(self.trackers.len());
        for (tracker, diff_area) in self.trackers.iter().zip(diff_areas.iter()) {
            match tracker.cbt().switch() {
                Ok(()) => {
                    tracker.arm(diff_area.clone());
                    armed.push(tracker.clone());
                }
                Err(err) => {
                    for armed_tracker in &armed {
                        armed_tracker.disarm();
                    }
                    thaw_reverse(guards);
                    return Err(err);
                }
            }
        }

        // Phase 4: thaw every device, reverse of freeze order.
        thaw_reverse(guards);

        // Phase 5: publish one image per tracker.
        let mut images = Vec::with_capacity(self.trackers.len());
        for (tracker, diff_area) in self.trackers.iter().zip(diff_areas.into_iter()) {
            let capacity = source_backends[&tracker.device_id()].capacity_sectors();
            let minor = NEXT_IMAGE_MINOR.fetch_add(1, Ordering::Relaxed);
            images.push(Arc::new(SnapshotImage::new(
                tracker.device_id(),
                DeviceId::new(250, minor),
                capacity,
                diff_area,
            )));
        }
        *self.images.write().unwrap() = images;
        self.taken.store(true, Ordering::Release);
        Ok(())
    }

    /// Freezes devices, disarms every tracker, tears down images,
    /// thaws devices. Idempotent.
    pub fn destroy(&self) {
        let mut guards = Vec::with_capacity(self.freeze_controls.len());
        for control in &self.freeze_controls {
            if let Ok(guard) = FreezeGuard::new(control.clone()) {
                guards.push(guard);
            }
        }

        for tracker in &self.trackers {
            tracker.disarm();
        }
        self.images.write().unwrap().clear();
        self.taken.store(false, Ordering::Release);

        thaw_reverse(guards);
    }

    pub fn wait_event(&self, timeout: Duration) -> Option<EventRecord> {
        self.event_handle.wait(timeout)
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn collect_images(&self) -> Vec<(DeviceId, DeviceId)> {
        self.images
            .read()
            .unwrap()
            .iter()
            .map(|image| (image.original_device_id(), image.image_device_id()))
            .collect()
    }

    pub fn images(&self) -> Vec<Arc<SnapshotImage>> {
        self.images.read().unwrap().clone()
    }
}

fn thaw_reverse(mut guards: Vec<FreezeGuard>) {
    guards.reverse();
    drop(guards);
}
