//! Diff I/O Engine: scatter-gather read/write against a
//! `(backing_device, start_sector, sector_count)` region.
//!
//! Grounded on `kernel/block.rs`'s `BlockDevice::commit_request` /
//! `read_some`, which splits a request into page-sized sub-requests and
//! tracks completion with a shared counter, and on
//! `driver/virtio/virtio_blk.rs`'s async `submit` path. Both the sync
//! and async entry points are the same operation parameterized by a
//! `Completion` strategy instead of duplicated state machines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::buffer_pool::Buffer;
use crate::error::{Error, KResult};
use crate::worker_pool::WorkerPool;

/// Maximum number of pages covered by one sub-request, mirroring
/// `bio_max_segs`.
pub const BIO_MAX_SEGS: u64 = 32;
const SECTORS_PER_PAGE: u64 = 8; // 4096 / 512

/// Splits `(start, count)` into batches of at most `max_batch`,
/// mirroring the chunked submission loop in `BlockDevice::read_some`.
pub struct Chunks {
    start: u64,
    remaining: u64,
    max_batch: u64,
}

impl Chunks {
    pub fn new(start: u64, count: u64, max_batch: u64) -> Self {
        Self {
            start,
            remaining: count,
            max_batch: max_batch.max(1),
        }
    }
}

impl Iterator for Chunks {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let batch = self.remaining.min(self.max_batch);
        let start = self.start;
        self.start += batch;
        self.remaining -= batch;
        Some((start, batch))
    }
}

/// The pluggable backing store a region is read from / written to.
/// Kernel block-device registration is out of scope for this crate;
/// this is the minimal trait the Diff I/O Engine needs from it.
pub trait BlockBackend: Send + Sync {
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> KResult<()>;
    fn write_at(&self, sector: u64, buf: &[u8]) -> KResult<()>;
    fn capacity_sectors(&self) -> u64;
}

/// An in-memory backend used by tests and as the default diff-store
/// medium; other backends (file, real device) plug in behind the same
/// trait.
pub struct MemBackend {
    data: Mutex<Vec<u8>>,
}

impl MemBackend {
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; (capacity_sectors * 512) as usize]),
        }
    }
}

impl BlockBackend for MemBackend {
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> KResult<()> {
        let data = self.data.lock().unwrap();
        let offset = (sector * 512) as usize;
        if offset + buf.len() > data.len() {
            return Err(Error::Invalid);
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> KResult<()> {
        let mut data = self.data.lock().unwrap();
        let offset = (sector * 512) as usize;
        if offset + buf.len() > data.len() {
            return Err(Error::Invalid);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn capacity_sectors(&self) -> u64 {
        self.data.lock().unwrap().len() as u64 / 512
    }
}

enum Completion {
    /// Caller blocks until every sub-request completes.
    Sync { done: Arc<(Mutex<bool>, Condvar)> },
    /// Caller is notified exactly once, on the worker pool, after every
    /// sub-request completes. Ordering across concurrent async calls is
    /// not guaranteed.
    Async {
        callback: Arc<dyn Fn(KResult<()>) + Send + Sync>,
        pool: Arc<WorkerPool>,
    },
}

struct Operation {
    outstanding: AtomicUsize,
    error: Mutex<Option<Error>>,
    completion: Completion,
}

impl Operation {
    fn complete_one(self: &Arc<Self>, result: KResult<()>) {
        if let Err(e) = result {
            *self.error.lock().unwrap() = Some(e);
        }

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Last completer: any sub-request error poisons the whole operation.
        let result = match self.error.lock().unwrap().clone() {
            Some(_) => Err(Error::IoFailure),
            None => Ok(()),
        };

        match &self.completion {
            Completion::Sync { done } => {
                let (lock, cvar) = &**done;
                *lock.lock().unwrap() = true;
                cvar.notify_all();
            }
            Completion::Async { callback, pool } => {
                let callback = callback.clone();
                pool.spawn(move || callback(result));
            }
        }
    }
}

/// Performs scatter-gather I/O against one backend, splitting the
/// region into `BIO_MAX_SEGS`-page sub-requests.
pub struct DiffIoEngine {
    worker_pool: Arc<WorkerPool>,
}

impl DiffIoEngine {
    pub fn new(worker_pool: Arc<WorkerPool>) -> Self {
        Self { worker_pool }
    }

    fn validate(start_sector: u64, sector_count: u64, buffer: &Buffer) -> KResult<()> {
        if start_sector % SECTORS_PER_PAGE != 0 {
            return Err(Error::Invalid);
        }
        if sector_count > buffer.sector_count() {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// Blocking read/write; returns once every sub-request completes.
    pub fn submit_sync(
        &self,
        backend: &dyn BlockBackend,
        start_sector: u64,
        sector_count: u64,
        buffer: &mut Buffer,
        is_write: bool,
    ) -> KResult<()> {
        Self::validate(start_sector, sector_count, buffer)?;

        let chunks: Vec<(u64, u64)> =
            Chunks::new(start_sector, sector_count, BIO_MAX_SEGS * SECTORS_PER_PAGE).collect();

        let op = Arc::new(Operation {
            outstanding: AtomicUsize::new(chunks.len().max(1)),
            error: Mutex::new(None),
            completion: Completion::Sync {
                done: Arc::new((Mutex::new(false), Condvar::new())),
            },
        });

        if chunks.is_empty() {
            op.complete_one(Ok(()));
        }

        let mut offset_sectors = 0u64;
        for (start, count) in &chunks {
            let byte_len = (*count * 512) as usize;
            let byte_offset = (offset_sectors * 512) as usize;
            let result = if is_write {
                backend.write_at(*start, &buffer.as_bytes()[byte_offset..byte_offset + byte_len])
            } else {
                backend.read_at(
                    *start,
                    &mut buffer.as_bytes_mut()[byte_offset..byte_offset + byte_len],
                )
            };
            op.complete_one(result);
            offset_sectors += count;
        }

        if let Completion::Sync { done } = &op.completion {
            let (lock, cvar) = &**done;
            let guard = lock.lock().unwrap();
            let _ = cvar.wait_while(guard, |done| !*done).unwrap();
        }

        match op.error.lock().unwrap().clone() {
            Some(_) => Err(Error::IoFailure),
            None => Ok(()),
        }
    }

    /// Non-blocking read/write; `callback` is invoked exactly once, on
    /// the worker pool, after every sub-request finishes.
    pub fn submit_async(
        &self,
        backend: Arc<dyn BlockBackend>,
        start_sector: u64,
        sector_count: u64,
        buffer: Buffer,
        is_write: bool,
        callback: impl Fn(KResult<()>) + Send + Sync + 'static,
    ) -> KResult<()> {
        Self::validate(start_sector, sector_count, &buffer)?;

        let chunks: Vec<(u64, u64)> =
            Chunks::new(start_sector, sector_count, BIO_MAX_SEGS * SECTORS_PER_PAGE).collect();

        let op = Arc::new(Operation {
            outstanding: AtomicUsize::new(chunks.len().max(1)),
            error: Mutex::new(None),
            completion: Completion::Async {
                callback: Arc::new(callback),
                pool: self.worker_pool.clone(),
            },
        });

        if chunks.is_empty() {
            op.complete_one(Ok(()));
            return Ok(());
        }

        // The buffer moves into the worker pool shared by all sub-requests
        // of this call; each sub-request only ever touches its own disjoint
        // byte range, so sharing it behind a `Mutex` adds no contention on
        // the steady-state path (each lock is held only for one copy).
        let buffer = Arc::new(Mutex::new(buffer));

        let mut offset_sectors = 0u64;
        for (start, count) in chunks {
            let op = op.clone();
            let backend = backend.clone();
            let buffer = buffer.clone();
            let byte_len = (count * 512) as usize;
            let byte_offset = (offset_sectors * 512) as usize;
            offset_sectors += count;

            self.worker_pool.spawn(move || {
                let result = {
                    let mut buf = buffer.lock().unwrap();
                    if is_write {
                        backend.write_at(start, &buf.as_bytes()[byte_offset..byte_offset + byte_len])
                    } else {
                        backend.read_at(
                            start,
                            &mut buf.as_bytes_mut()[byte_offset..byte_offset + byte_len],
                        )
                    }
                };
                op.complete_one(result);
            });
        }

        Ok(())
    }
}
