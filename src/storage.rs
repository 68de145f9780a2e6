//! Diff Storage: FIFO extent allocator shared across every Diff Area
//! belonging to one snapshot.
//!
//! Grounded on `kernel/block/mbr.rs`'s plain, non-interior-mutable
//! partition-table parsing (extents here are similarly inert data) and
//! on the `Entry`-based registry idiom elsewhere in the kernel for the
//! "never return a consumed region" invariant.

use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, KResult};
use crate::event_queue::{Event, EventQueue};
use crate::types::{DeviceId, Extent};

struct Inner {
    free_extents: Vec<Extent>,
    free_sectors: u64,
    low_water_sectors: u64,
    low_space_raised: bool,
}

/// Ordered list of free extents contributed by user space, plus a
/// free-sector watermark.
pub struct DiffStorage {
    inner: Mutex<Inner>,
    events: EventQueue,
}

impl DiffStorage {
    pub fn new(low_water_sectors: u64, events: EventQueue) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free_extents: Vec::new(),
                free_sectors: 0,
                low_water_sectors,
                low_space_raised: false,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Appends an extent contributed by user space. Rejects extents
    /// that overlap one already on file: extents never overlap.
    pub fn append(&self, device_id: DeviceId, start: u64, count: u64) -> KResult<()> {
        if count == 0 {
            return Err(Error::Invalid);
        }
        let extent = Extent::new(device_id, start, count);

        let mut inner = self.lock();
        if inner.free_extents.iter().any(|e| e.overlaps(&extent)) {
            return Err(Error::Invalid);
        }

        inner.free_extents.push(extent);
        inner.free_sectors += count;
        Ok(())
    }

    /// Hands out a sector-granular region in FIFO order across the
    /// extents appended so far.
    pub fn allocate(&self, sectors: u64) -> KResult<Extent> {
        if sectors == 0 {
            return Err(Error::Invalid);
        }

        let mut inner = self.lock();

        let idx = inner
            .free_extents
            .iter()
            .position(|e| e.sector_count >= sectors);

        let Some(idx) = idx else {
            self.events.publish(Event::OutOfFreeSpace);
            return Err(Error::NoSpace);
        };

        let source = inner.free_extents[idx];
        let allocated = Extent::new(source.device_id, source.start_sector, sectors);

        if source.sector_count == sectors {
            inner.free_extents.remove(idx);
        } else {
            inner.free_extents[idx] = Extent::new(
                source.device_id,
                source.start_sector + sectors,
                source.sector_count - sectors,
            );
        }
        inner.free_sectors -= sectors;

        if inner.free_sectors < inner.low_water_sectors && !inner.low_space_raised {
            inner.low_space_raised = true;
            self.events.publish(Event::LowFreeSpace);
        }

        Ok(allocated)
    }

    pub fn free_sectors(&self) -> u64 {
        self.lock().free_sectors
    }
}
