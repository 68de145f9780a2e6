//! Diff Area: the per-device CoW map.
//!
//! Per-chunk state is guarded by one `Mutex` plus one shared `Condvar`
//! for waiters, ported to a hosted target from a spinlock-plus-condvar
//! design, grounded on `sync/condvar.rs`'s waiter-queue `CondVar`
//! (reimplemented atop `std::sync::Condvar` since there is no kernel
//! scheduler to hand waiters back to here).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{trace, warn};

use crate::buffer_pool::DiffBufferPool;
use crate::error::{Error, KResult};
use crate::event_queue::{Event, EventQueue};
use crate::io_engine::{BlockBackend, DiffIoEngine};
use crate::storage::DiffStorage;
use crate::types::Extent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Unchanged,
    Copying,
    Copied { diff_store: Extent },
    Failed,
}

struct Inner {
    chunks: HashMap<u64, ChunkState>,
}

/// Owns the CoW map for one source device.
pub struct DiffArea {
    chunk_size_sectors: u64,
    source: Arc<dyn BlockBackend>,
    diff_store: Arc<dyn BlockBackend>,
    storage: Arc<DiffStorage>,
    buffers: DiffBufferPool,
    io: DiffIoEngine,
    inner: Mutex<Inner>,
    waiters: Condvar,
    corrupted: AtomicBool,
    events: EventQueue,
}

impl DiffArea {
    pub fn new(
        chunk_size_sectors: u64,
        source: Arc<dyn BlockBackend>,
        diff_store: Arc<dyn BlockBackend>,
        storage: Arc<DiffStorage>,
        buffers: DiffBufferPool,
        io: DiffIoEngine,
        events: EventQueue,
    ) -> Self {
        Self {
            chunk_size_sectors,
            source,
            diff_store,
            storage,
            buffers,
            io,
            inner: Mutex::new(Inner {
                chunks: HashMap::new(),
            }),
            waiters: Condvar::new(),
            corrupted: AtomicBool::new(false),
            events,
        }
    }

    fn chunk_index(&self, sector: u64) -> u64 {
        sector / self.chunk_size_sectors
    }

    fn chunk_range(&self, index: u64) -> (u64, u64) {
        (index * self.chunk_size_sectors, self.chunk_size_sectors)
    }

    fn chunks_for(&self, sector: u64, count: u64) -> std::ops::RangeInclusive<u64> {
        let first = self.chunk_index(sector);
        let last = self.chunk_index(sector + count - 1);
        first..=last
    }

    /// Preserves the original contents of every chunk intersecting
    /// `[sector, sector+count)` before a write is allowed to proceed.
    ///
    /// Exactly one caller wins the `Unchanged -> Copying` transition per
    /// chunk and performs the CoW I/O; losers wait on the shared condvar
    /// (or return `Retryable` immediately under `nowait`) until the
    /// winner reaches `Copied` or `Failed`.
    pub fn copy(&self, sector: u64, count: u64, nowait: bool) -> KResult<()> {
        if self.corrupted.load(Ordering::Acquire) {
            return Err(Error::Corrupted);
        }

        for chunk in self.chunks_for(sector, count) {
            self.copy_one_chunk(chunk, nowait)?;
        }
        Ok(())
    }

    fn copy_one_chunk(&self, chunk: u64, nowait: bool) -> KResult<()> {
        loop {
            let mut guard = self.inner.lock().unwrap();

            match guard.chunks.get(&chunk).copied() {
                None | Some(ChunkState::Unchanged) => {
                    guard.chunks.insert(chunk, ChunkState::Copying);
                    drop(guard);
                    self.perform_copy(chunk);
                    return self.outcome_of(chunk);
                }
                Some(ChunkState::Copied { .. }) => return Ok(()),
                Some(ChunkState::Failed) => return Err(Error::Corrupted),
                Some(ChunkState::Copying) => {
                    if nowait {
                        return Err(Error::Retryable);
                    }
                    guard = self
                        .waiters
                        .wait_while(guard, |g| {
                            matches!(g.chunks.get(&chunk), Some(ChunkState::Copying))
                        })
                        .unwrap();
                    drop(guard);
                    // Re-check: the chunk may now be Copied/Failed, or
                    // (if we raced a corrupted reset) Unchanged again.
                }
            }
        }
    }

    fn outcome_of(&self, chunk: u64) -> KResult<()> {
        let guard = self.inner.lock().unwrap();
        match guard.chunks.get(&chunk) {
            Some(ChunkState::Copied { .. }) => Ok(()),
            Some(ChunkState::Failed) => Err(Error::Corrupted),
            other => unreachable!("chunk {chunk} left in unexpected state {other:?}"),
        }
    }

    /// Runs the actual CoW I/O for one chunk the caller just won the
    /// race to copy, and transitions it to `Copied`/`Failed`.
    fn perform_copy(&self, chunk: u64) {
        let (start, count) = self.chunk_range(chunk);
        let result = self.try_copy_chunk(start, count);

        let mut guard = self.inner.lock().unwrap();
        match result {
            Ok(diff_store_extent) => {
                trace!(chunk, "chunk preserved to diff store");
                guard
                    .chunks
                    .insert(chunk, ChunkState::Copied { diff_store: diff_store_extent });
            }
            Err(err) => {
                warn!(chunk, ?err, "CoW copy failed, poisoning diff area");
                guard.chunks.insert(chunk, ChunkState::Failed);
                drop(guard);
                self.mark_corrupted();
                self.waiters.notify_all();
                return;
            }
        }
        drop(guard);
        self.waiters.notify_all();
    }

    fn try_copy_chunk(&self, start: u64, count: u64) -> KResult<Extent> {
        let extent = self.storage.allocate(count).map_err(|e| e.downgrade_on_hot_path())?;

        let mut buffer = self
            .buffers
            .acquire(count, false)
            .map_err(|_| Error::NoMemory)?;

        self.io
            .submit_sync(self.source.as_ref(), start, count, &mut buffer, false)
            .map_err(|_| Error::IoFailure)?;

        self.io
            .submit_sync(
                self.diff_store.as_ref(),
                extent.start_sector,
                count,
                &mut buffer,
                true,
            )
            .map_err(|_| Error::IoFailure)?;

        Ok(extent)
    }

    /// Services a read from the Snapshot Image: `Copied` chunks read
    /// from the diff store, others from the original device. `Copying`
    /// chunks block the reader until they settle.
    pub fn read(&self, sector: u64, count: u64, out: &mut [u8]) -> KResult<()> {
        if self.corrupted.load(Ordering::Acquire) {
            return Err(Error::IoFailure);
        }

        let mut filled = 0usize;
        for chunk in self.chunks_for(sector, count) {
            let state = self.wait_for_settled(chunk);
            let (chunk_start, chunk_len) = self.chunk_range(chunk);

            let want_start = sector.max(chunk_start);
            let want_end = (sector + count).min(chunk_start + chunk_len);
            let want_count = want_end - want_start;
            let byte_len = (want_count * 512) as usize;
            let dst = &mut out[filled..filled + byte_len];

            match state {
                ChunkState::Copied { diff_store } => {
                    let offset_into_chunk = want_start - chunk_start;
                    self.diff_store
                        .read_at(diff_store.start_sector + offset_into_chunk, dst)
                        .map_err(|_| Error::IoFailure)?;
                }
                _ => {
                    self.source
                        .read_at(want_start, dst)
                        .map_err(|_| Error::IoFailure)?;
                }
            }
            filled += byte_len;
        }
        Ok(())
    }

    fn wait_for_settled(&self, chunk: u64) -> ChunkState {
        let mut guard = self.inner.lock().unwrap();
        loop {
            match guard.chunks.get(&chunk).copied() {
                Some(ChunkState::Copying) => {
                    guard = self.waiters.wait(guard).unwrap();
                }
                Some(other) => return other,
                None => return ChunkState::Unchanged,
            }
        }
    }

    /// Poisons the entire Diff Area. Sticky: once corrupted, every
    /// subsequent read fails and Snapshot reports the diff area
    /// corrupted.
    pub fn mark_corrupted(&self) {
        self.corrupted.store(true, Ordering::Release);
        self.events.publish(Event::Corrupted);
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_engine::MemBackend;
    use crate::types::DeviceId;
    use std::sync::Barrier;

    fn make_area(capacity_sectors: u64) -> (Arc<DiffArea>, Arc<MemBackend>) {
        let source = Arc::new(MemBackend::new(capacity_sectors));
        let diff_store_backend: Arc<dyn BlockBackend> = Arc::new(MemBackend::new(capacity_sectors));
        let (events, _handle) = crate::event_queue::EventQueue::new(16);
        let storage = Arc::new(DiffStorage::new(0, events.clone()));
        storage.append(DeviceId::new(9, 0), 0, capacity_sectors).unwrap();

        let pool = Arc::new(crate::worker_pool::WorkerPool::new(2));
        let area = DiffArea::new(
            8, // one chunk = 8 sectors = 4096 bytes
            source.clone(),
            diff_store_backend,
            storage,
            DiffBufferPool::new(capacity_sectors),
            DiffIoEngine::new(pool),
            events,
        );
        (Arc::new(area), source)
    }

    #[test]
    fn copy_then_overwrite_preserves_original_for_image_reads() {
        let (area, source) = make_area(64);
        source.write_at(0, &[0xAAu8; 4096]).unwrap();

        area.copy(0, 8, false).unwrap();
        source.write_at(0, &[0xBBu8; 4096]).unwrap();

        let mut out = vec![0u8; 4096];
        area.read(0, 8, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn repeated_copy_of_already_copied_chunk_is_a_noop_ok() {
        let (area, _source) = make_area(64);
        area.copy(0, 8, false).unwrap();
        assert_eq!(area.copy(0, 8, false), Ok(()));
        assert_eq!(area.copy(0, 8, true), Ok(()));
    }

    #[test]
    fn concurrent_copies_of_the_same_chunk_exactly_one_does_io() {
        let (area, source) = make_area(64);
        source.write_at(0, &[0x11u8; 4096]).unwrap();

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let area = area.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    area.copy(0, 8, false)
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(()));
        }

        let mut out = vec![0u8; 4096];
        area.read(0, 8, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn nowait_copy_on_a_copying_chunk_returns_retryable_without_blocking() {
        let (area, _source) = make_area(64);
        // Pre-seed the chunk as Copying by grabbing the lock directly,
        // simulating another thread mid-copy.
        {
            let mut guard = area.inner.lock().unwrap();
            guard.chunks.insert(0, ChunkState::Copying);
        }
        assert_eq!(area.copy(0, 8, true), Err(Error::Retryable));
        area.waiters.notify_all();
    }

    #[test]
    fn out_of_space_during_copy_poisons_the_whole_area() {
        let (area, _source) = make_area(64);
        // Drain the backing diff storage so the next chunk can't allocate.
        let (tiny, tiny_events) = {
            let source = Arc::new(MemBackend::new(8));
            let diff_store_backend: Arc<dyn BlockBackend> = Arc::new(MemBackend::new(8));
            let (events, handle) = crate::event_queue::EventQueue::new(16);
            let storage = Arc::new(DiffStorage::new(0, events.clone()));
            storage.append(DeviceId::new(9, 1), 0, 8).unwrap();
            let pool = Arc::new(crate::worker_pool::WorkerPool::new(1));
            let area = DiffArea::new(
                8,
                source,
                diff_store_backend,
                storage,
                DiffBufferPool::new(8),
                DiffIoEngine::new(pool),
                events,
            );
            (area, handle)
        };

        assert_eq!(tiny.copy(0, 8, false), Ok(()));
        assert_eq!(tiny.copy(8, 8, false), Err(Error::Corrupted));
        assert!(tiny.is_corrupted());

        let mut out = vec![0u8; 4096];
        assert_eq!(tiny.read(0, 8, &mut out), Err(Error::IoFailure));
        assert_eq!(tiny_events.try_recv(), Some(crate::event_queue::Event::Corrupted));
        let _ = area; // keep first area alive for borrow checker clarity
    }
}
