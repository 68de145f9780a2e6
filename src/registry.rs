//! Registry: a single object created at init and passed explicitly to
//! every entry point, plus the in-process command surface.
//!
//! Grounded on `kernel/block.rs`'s `BLOCK_DEVICE_LIST` and
//! `kernel/chardev.rs`'s `CHAR_DEVICES` statics, generalized from
//! module-load-time globals into an owned struct a caller constructs
//! and threads through explicitly — there is no kernel module to hang
//! a `static` off of here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, KResult};
use crate::event_queue::EventRecord;
use crate::io_engine::BlockBackend;
use crate::snapshot::{FreezeControl, NullFreeze, Snapshot};
use crate::tracker::Tracker;
use crate::types::DeviceId;

/// Everything `track_collect` reports for one tracked device.
#[derive(Debug, Clone, Copy)]
pub struct TrackedDeviceInfo {
    pub device_id: DeviceId,
    pub capacity_sectors: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub snap_number: u8,
    pub generation_id: Uuid,
}

/// The request enum for the control-surface command table.
pub enum Command {
    TrackAdd { device_id: DeviceId },
    TrackRemove { device_id: DeviceId },
    TrackCollect,
    CbtRead { device_id: DeviceId, offset: usize, length: usize },
    CbtMarkDirty { device_id: DeviceId, ranges: Vec<(u64, u64)> },
    SnapshotCreate { device_ids: Vec<DeviceId> },
    SnapshotAppendStorage { snapshot_id: Uuid, device_id: DeviceId, start: u64, count: u64 },
    SnapshotTake { snapshot_id: Uuid, diff_store_backend: Arc<dyn BlockBackend> },
    SnapshotWaitEvent { snapshot_id: Uuid, timeout: Duration },
    SnapshotCollectImages { snapshot_id: Uuid },
    SnapshotDestroy { snapshot_id: Uuid },
}

/// The matching response enum. Commands with no payload return `Unit`.
#[derive(Debug)]
pub enum Response {
    Unit,
    TrackCollect(Vec<TrackedDeviceInfo>),
    CbtRead(Vec<u8>),
    SnapshotCreate(Uuid),
    SnapshotWaitEvent(Option<EventRecord>),
    SnapshotCollectImages(Vec<(DeviceId, DeviceId)>),
}

struct Inner {
    trackers: HashMap<DeviceId, Arc<Tracker>>,
    snapshots: HashMap<Uuid, Arc<Snapshot>>,
    snapshot_order: Vec<Uuid>,
    backends: HashMap<DeviceId, Arc<dyn BlockBackend>>,
}

/// Process-wide state: every tracker and snapshot, plus the backend
/// registry `take` resolves source devices through. One instance is
/// created at startup and passed to every command dispatch.
pub struct Registry {
    config: Config,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                trackers: HashMap::new(),
                snapshots: HashMap::new(),
                snapshot_order: Vec::new(),
                backends: HashMap::new(),
            }),
        }
    }

    /// Registers the backend a tracked device's reads/writes are
    /// performed against — stands in for kernel block-device
    /// registration, which is out of scope for this crate.
    pub fn register_backend(&self, device_id: DeviceId, backend: Arc<dyn BlockBackend>) {
        self.inner.write().unwrap().backends.insert(device_id, backend);
    }

    fn tracker_for(&self, device_id: DeviceId) -> KResult<Arc<Tracker>> {
        self.inner
            .read()
            .unwrap()
            .trackers
            .get(&device_id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Runs `f` against the tracker bound to `device_id` — the glue a
    /// real host's write path would use to invoke the filter before
    /// letting a write proceed. Exposed directly since driving the
    /// filter itself is out of this crate's scope; only looking the
    /// tracker up is registry responsibility.
    pub fn with_tracker<R>(&self, device_id: DeviceId, f: impl FnOnce(&Tracker) -> KResult<R>) -> KResult<R> {
        let tracker = self.tracker_for(device_id)?;
        f(&tracker)
    }

    fn snapshot_for(&self, id: Uuid) -> KResult<Arc<Snapshot>> {
        self.inner
            .read()
            .unwrap()
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub fn dispatch(&self, command: Command) -> KResult<Response> {
        match command {
            Command::TrackAdd { device_id } => self.track_add(device_id).map(|_| Response::Unit),
            Command::TrackRemove { device_id } => {
                self.track_remove(device_id).map(|_| Response::Unit)
            }
            Command::TrackCollect => Ok(Response::TrackCollect(self.track_collect())),
            Command::CbtRead { device_id, offset, length } => {
                self.cbt_read(device_id, offset, length).map(Response::CbtRead)
            }
            Command::CbtMarkDirty { device_id, ranges } => {
                self.cbt_mark_dirty(device_id, &ranges).map(|_| Response::Unit)
            }
            Command::SnapshotCreate { device_ids } => {
                self.snapshot_create(&device_ids).map(Response::SnapshotCreate)
            }
            Command::SnapshotAppendStorage { snapshot_id, device_id, start, count } => self
                .snapshot_append_storage(snapshot_id, device_id, start, count)
                .map(|_| Response::Unit),
            Command::SnapshotTake { snapshot_id, diff_store_backend } => self
                .snapshot_take(snapshot_id, diff_store_backend)
                .map(|_| Response::Unit),
            Command::SnapshotWaitEvent { snapshot_id, timeout } => self
                .snapshot_wait_event(snapshot_id, timeout)
                .map(Response::SnapshotWaitEvent),
            Command::SnapshotCollectImages { snapshot_id } => self
                .snapshot_collect_images(snapshot_id)
                .map(Response::SnapshotCollectImages),
            Command::SnapshotDestroy { snapshot_id } => {
                self.snapshot_destroy(snapshot_id).map(|_| Response::Unit)
            }
        }
    }

    fn track_add(&self, device_id: DeviceId) -> KResult<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(backend) = inner.backends.get(&device_id) else {
            return Err(Error::NotFound);
        };
        let capacity_sectors = backend.capacity_sectors();
        inner
            .trackers
            .entry(device_id)
            .or_insert_with(|| Arc::new(Tracker::new(device_id, capacity_sectors)));
        Ok(())
    }

    fn track_remove(&self, device_id: DeviceId) -> KResult<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(tracker) = inner.trackers.get(&device_id) else {
            return Err(Error::NotFound);
        };
        if tracker.is_busy() {
            return Err(Error::Busy);
        }
        inner.trackers.remove(&device_id);
        Ok(())
    }

    fn track_collect(&self) -> Vec<TrackedDeviceInfo> {
        self.inner
            .read()
            .unwrap()
            .trackers
            .values()
            .map(|tracker| {
                let cbt = tracker.cbt();
                let (previous, _active) = cbt.snap_numbers();
                TrackedDeviceInfo {
                    device_id: tracker.device_id(),
                    capacity_sectors: cbt.device_capacity(),
                    block_size: cbt.block_size(),
                    block_count: cbt.block_count(),
                    snap_number: previous,
                    generation_id: cbt.generation_id(),
                }
            })
            .collect()
    }

    fn cbt_read(&self, device_id: DeviceId, offset: usize, length: usize) -> KResult<Vec<u8>> {
        let tracker = self.tracker_for(device_id)?;
        if !tracker.is_armed() {
            return Err(Error::NotSnapshotted);
        }
        let mut buf = vec![0u8; length];
        let n = tracker.cbt().read_to_user(offset, length, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn cbt_mark_dirty(&self, device_id: DeviceId, ranges: &[(u64, u64)]) -> KResult<()> {
        let tracker = self.tracker_for(device_id)?;
        tracker.cbt().mark_dirty(ranges);
        Ok(())
    }

    fn snapshot_create(&self, device_ids: &[DeviceId]) -> KResult<Uuid> {
        let mut inner = self.inner.write().unwrap();

        let mut trackers = Vec::with_capacity(device_ids.len());
        let mut newly_created = Vec::new();
        for &device_id in device_ids {
            if let Some(tracker) = inner.trackers.get(&device_id) {
                trackers.push(tracker.clone());
                continue;
            }
            let Some(backend) = inner.backends.get(&device_id) else {
                // Roll back any trackers this call itself created.
                for device_id in newly_created {
                    inner.trackers.remove(&device_id);
                }
                return Err(Error::NotFound);
            };
            let tracker = Arc::new(Tracker::new(device_id, backend.capacity_sectors()));
            inner.trackers.insert(device_id, tracker.clone());
            newly_created.push(device_id);
            trackers.push(tracker);
        }

        let freeze_controls: Vec<Arc<dyn FreezeControl>> =
            device_ids.iter().map(|_| Arc::new(NullFreeze) as Arc<dyn FreezeControl>).collect();

        let snapshot = Arc::new(Snapshot::new(&self.config, trackers, freeze_controls));
        let id = snapshot.id();
        inner.snapshots.insert(id, snapshot);
        inner.snapshot_order.push(id);
        info!(%id, "snapshot created");
        Ok(id)
    }

    fn snapshot_append_storage(
        &self,
        snapshot_id: Uuid,
        device_id: DeviceId,
        start: u64,
        count: u64,
    ) -> KResult<()> {
        self.snapshot_for(snapshot_id)?.append_storage(device_id, start, count)
    }

    fn snapshot_take(&self, snapshot_id: Uuid, diff_store_backend: Arc<dyn BlockBackend>) -> KResult<()> {
        let snapshot = self.snapshot_for(snapshot_id)?;
        let backends = self.inner.read().unwrap().backends.clone();
        snapshot.take(&backends, diff_store_backend)
    }

    fn snapshot_wait_event(&self, snapshot_id: Uuid, timeout: Duration) -> KResult<Option<EventRecord>> {
        Ok(self.snapshot_for(snapshot_id)?.wait_event(timeout))
    }

    fn snapshot_collect_images(&self, snapshot_id: Uuid) -> KResult<Vec<(DeviceId, DeviceId)>> {
        Ok(self.snapshot_for(snapshot_id)?.collect_images())
    }

    fn snapshot_destroy(&self, snapshot_id: Uuid) -> KResult<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(snapshot) = inner.snapshots.remove(&snapshot_id) else {
            return Err(Error::NotFound);
        };
        inner.snapshot_order.retain(|id| *id != snapshot_id);
        drop(inner);
        snapshot.destroy();
        Ok(())
    }

    /// Tears down every snapshot in creation order, disarming trackers
    /// before releasing diff storage.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write().unwrap();
        let order = std::mem::take(&mut inner.snapshot_order);
        for id in order {
            if let Some(snapshot) = inner.snapshots.remove(&id) {
                drop(inner);
                snapshot.destroy();
                inner = self.inner.write().unwrap();
            }
        }
        if !inner.trackers.is_empty() {
            warn!(count = inner.trackers.len(), "trackers still registered at shutdown");
        }
    }
}
