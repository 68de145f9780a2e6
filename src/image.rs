//! Snapshot Image: a read-only virtual device presenting a
//! point-in-time view of one tracked device.
//!
//! Grounded on `driver/virtio/virtio_blk.rs`'s block-device trait
//! implementation, narrowed to read-only and backed by a `DiffArea`
//! instead of a real queue.

use std::sync::Arc;

use crate::diff_area::DiffArea;
use crate::error::{Error, KResult};
use crate::io_engine::BlockBackend;
use crate::types::DeviceId;

/// Composes the original device with its Diff Area to present the
/// contents as they were at arming time.
pub struct SnapshotImage {
    original_device_id: DeviceId,
    image_device_id: DeviceId,
    capacity_sectors: u64,
    diff_area: Arc<DiffArea>,
}

impl SnapshotImage {
    pub fn new(
        original_device_id: DeviceId,
        image_device_id: DeviceId,
        capacity_sectors: u64,
        diff_area: Arc<DiffArea>,
    ) -> Self {
        Self {
            original_device_id,
            image_device_id,
            capacity_sectors,
            diff_area,
        }
    }

    pub fn original_device_id(&self) -> DeviceId {
        self.original_device_id
    }

    pub fn image_device_id(&self) -> DeviceId {
        self.image_device_id
    }

    pub fn is_corrupted(&self) -> bool {
        self.diff_area.is_corrupted()
    }
}

impl BlockBackend for SnapshotImage {
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> KResult<()> {
        let count = buf.len() as u64 / crate::types::SECTOR_SIZE;
        self.diff_area.read(sector, count, buf)
    }

    /// Snapshot images are read-only: every write fails.
    fn write_at(&self, _sector: u64, _buf: &[u8]) -> KResult<()> {
        Err(Error::Invalid)
    }

    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::DiffBufferPool;
    use crate::event_queue::EventQueue;
    use crate::io_engine::{DiffIoEngine, MemBackend};
    use crate::storage::DiffStorage;
    use crate::worker_pool::WorkerPool;

    #[test]
    fn image_read_reflects_preserved_original_even_after_overwrite() {
        let source = Arc::new(MemBackend::new(64));
        let diff_store: Arc<dyn BlockBackend> = Arc::new(MemBackend::new(64));
        let (events, _handle) = EventQueue::new(16);
        let storage = Arc::new(DiffStorage::new(0, events.clone()));
        storage.append(DeviceId::new(9, 0), 0, 64).unwrap();
        let pool = Arc::new(WorkerPool::new(2));
        let diff_area = Arc::new(DiffArea::new(
            8,
            source.clone(),
            diff_store,
            storage,
            DiffBufferPool::new(64),
            DiffIoEngine::new(pool),
            events,
        ));

        source.write_at(0, &[0x11u8; 4096]).unwrap();
        diff_area.copy(0, 8, false).unwrap();
        source.write_at(0, &[0x22u8; 4096]).unwrap();

        let image = SnapshotImage::new(DeviceId::new(8, 0), DeviceId::new(250, 0), 64, diff_area);
        let mut out = vec![0u8; 4096];
        image.read_at(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn image_writes_are_rejected() {
        let source = Arc::new(MemBackend::new(64));
        let diff_store: Arc<dyn BlockBackend> = Arc::new(MemBackend::new(64));
        let (events, _handle) = EventQueue::new(16);
        let storage = Arc::new(DiffStorage::new(0, events.clone()));
        storage.append(DeviceId::new(9, 0), 0, 64).unwrap();
        let pool = Arc::new(WorkerPool::new(1));
        let diff_area = Arc::new(DiffArea::new(
            8,
            source,
            diff_store,
            storage,
            DiffBufferPool::new(64),
            DiffIoEngine::new(pool),
            events,
        ));

        let image = SnapshotImage::new(DeviceId::new(8, 0), DeviceId::new(250, 0), 64, diff_area);
        assert_eq!(image.write_at(0, &[0u8; 512]), Err(Error::Invalid));
    }
}
