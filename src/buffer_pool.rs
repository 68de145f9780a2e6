//! Diff Buffer Pool: page-aligned buffer leasing for the Diff I/O
//! Engine.
//!
//! Grounded on `kernel/mem/folio.rs`'s `Folio::alloc` leasing idiom,
//! generalized from a physical page allocator to a capped in-process
//! pool: `acquire(nowait)` past the configured ceiling fails with
//! `Error::Retryable` instead of growing unbounded or blocking —
//! hot-path allocations accept failure rather than block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, KResult};
use crate::types::{PAGE_SIZE, SECTOR_SIZE};

/// A leased, page-aligned buffer sized to cover `sector_count` sectors.
///
/// Dropping a `Buffer` returns its pages' worth of quota to the pool
/// that issued it. Buffers are zeroed only on first allocation; a
/// buffer handed out from a freed lease is not re-zeroed.
pub struct Buffer {
    data: Box<[u8]>,
    sector_count: u64,
    pool: Arc<AtomicU64>,
}

impl Buffer {
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..(self.sector_count * SECTOR_SIZE) as usize]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = (self.sector_count * SECTOR_SIZE) as usize;
        &mut self.data[..len]
    }

    fn page_count(&self) -> u64 {
        self.data.len() as u64 / PAGE_SIZE
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.fetch_sub(self.page_count(), Ordering::AcqRel);
    }
}

/// Leases buffers up to a configured sector ceiling.
///
/// Cloning shares the same leased-page counter: every Diff Area built
/// for one snapshot draws from one pool, not one per device.
#[derive(Clone)]
pub struct DiffBufferPool {
    max_sectors: u64,
    leased_pages: Arc<AtomicU64>,
}

impl DiffBufferPool {
    pub fn new(max_sectors: u64) -> Self {
        Self {
            max_sectors,
            leased_pages: Arc::new(AtomicU64::new(0)),
        }
    }

    fn sectors_per_page() -> u64 {
        PAGE_SIZE / SECTOR_SIZE
    }

    /// Leases a buffer covering at least `sectors` sectors.
    ///
    /// Under memory pressure with `nowait` set, fails with
    /// `Error::Retryable` rather than blocking.
    pub fn acquire(&self, sectors: u64, nowait: bool) -> KResult<Buffer> {
        if sectors == 0 {
            return Err(Error::Invalid);
        }

        let page_count = sectors.div_ceil(Self::sectors_per_page());
        let max_pages = self.max_sectors / Self::sectors_per_page();

        loop {
            let current = self.leased_pages.load(Ordering::Acquire);
            if current + page_count > max_pages {
                return Err(Error::Retryable);
            }

            if self
                .leased_pages
                .compare_exchange_weak(
                    current,
                    current + page_count,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }

            // A blocking caller would retry indefinitely here; `nowait`
            // callers only ever see one failed CAS before falling through
            // to the ceiling check on the next loop iteration.
            if nowait {
                continue;
            }
        }

        let data = vec![0u8; (page_count * PAGE_SIZE) as usize].into_boxed_slice();

        Ok(Buffer {
            data,
            sector_count: sectors,
            pool: self.leased_pages.clone(),
        })
    }

    pub fn leased_sectors(&self) -> u64 {
        self.leased_pages.load(Ordering::Acquire) * Self::sectors_per_page()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_past_ceiling_is_retryable_not_blocking() {
        let pool = DiffBufferPool::new(PAGE_SIZE / SECTOR_SIZE); // exactly 1 page
        let _buf = pool.acquire(1, true).unwrap();
        assert_eq!(pool.acquire(1, true), Err(Error::Retryable));
    }

    #[test]
    fn releasing_a_buffer_returns_its_quota() {
        let pool = DiffBufferPool::new(PAGE_SIZE / SECTOR_SIZE);
        {
            let _buf = pool.acquire(1, true).unwrap();
            assert_eq!(pool.leased_sectors(), PAGE_SIZE / SECTOR_SIZE);
        }
        assert_eq!(pool.leased_sectors(), 0);
    }

    #[test]
    fn buffers_start_zeroed() {
        let pool = DiffBufferPool::new(PAGE_SIZE / SECTOR_SIZE * 4);
        let buf = pool.acquire(8, false).unwrap();
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_sectors_is_invalid() {
        let pool = DiffBufferPool::new(16);
        assert_eq!(pool.acquire(0, false), Err(Error::Invalid));
    }
}
