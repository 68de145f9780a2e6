//! CBT Map: generation-tagged changed-block bitmap.
//!
//! The bitmap itself is a `Vec<AtomicU8>` so `set` (the hot path, called
//! from every write) never takes a lock; `switch`/`reset`/`read_to_user`
//! take an `RwLock` instead: the hot path writes bytes lock-free,
//! `switch`/`reset` hold it exclusively, `read_to_user` holds it
//! shared. Grounded on the small plain-value-type style of
//! `kernel/vfs/types/device_id.rs`, generalized to a byte array, and on
//! `original_source/module/tracker.c`'s
//! `generationId`/`snap_number_previous`/`snap_number_active` fields.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::{Error, KResult};
use crate::types::{next_pow2, PAGE_SIZE};

struct Generation {
    id: Uuid,
    snap_number_previous: u8,
    snap_number_active: u8,
    is_corrupted: bool,
}

/// Binds to one device's capacity and tracks which blocks it dirtied
/// since each snapshot.
pub struct CbtMap {
    block_size: u64,
    block_count: u64,
    device_capacity: u64,
    bitmap: Vec<AtomicU8>,
    generation: RwLock<Generation>,
}

impl CbtMap {
    /// Chooses `block_size` as the smallest power-of-two `>=
    /// ceil(capacity / 2^32)`, but never less than one page.
    fn choose_block_size(capacity_sectors: u64) -> u64 {
        let capacity_bytes = capacity_sectors * crate::types::SECTOR_SIZE;
        let min_block_size = capacity_bytes.div_ceil(1u64 << 32).max(1);
        next_pow2(min_block_size).max(PAGE_SIZE)
    }

    pub fn new(device_capacity_sectors: u64) -> Self {
        let block_size = Self::choose_block_size(device_capacity_sectors);
        let capacity_bytes = device_capacity_sectors * crate::types::SECTOR_SIZE;
        let block_count = capacity_bytes.div_ceil(block_size).max(1);

        Self {
            block_size,
            block_count,
            device_capacity: device_capacity_sectors,
            bitmap: (0..block_count).map(|_| AtomicU8::new(0)).collect(),
            generation: RwLock::new(Generation {
                id: Uuid::new_v4(),
                snap_number_previous: 0,
                snap_number_active: 1,
                is_corrupted: false,
            }),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn generation_id(&self) -> Uuid {
        self.generation.read().unwrap().id
    }

    pub fn snap_numbers(&self) -> (u8, u8) {
        let g = self.generation.read().unwrap();
        (g.snap_number_previous, g.snap_number_active)
    }

    pub fn is_corrupted(&self) -> bool {
        self.generation.read().unwrap().is_corrupted
    }

    fn block_index(&self, byte_offset: u64) -> u64 {
        (byte_offset / self.block_size).min(self.block_count - 1)
    }

    /// Marks every block intersecting `[sector, sector+count)` with the
    /// current `snap_number_active`. Hot path: a read lock only, never
    /// blocked by `switch`/`reset` in flight for longer than those calls
    /// themselves take. Never blocks or fails the caller: an overflowed
    /// snap number still records *a* dirty mark, just not a precise
    /// one, and corruption is surfaced via `is_corrupted` instead of an
    /// error return.
    pub fn set(&self, start_sector: u64, sector_count: u64) {
        let generation = self.generation.read().unwrap();
        if generation.is_corrupted {
            return;
        }
        let snap_number = generation.snap_number_active;

        let start_byte = start_sector * crate::types::SECTOR_SIZE;
        let end_byte = (start_sector + sector_count) * crate::types::SECTOR_SIZE;
        let first = self.block_index(start_byte);
        let last = self.block_index(end_byte.saturating_sub(1));

        for idx in first..=last {
            self.bitmap[idx as usize].store(snap_number, Ordering::Relaxed);
        }
    }

    /// Marks the given ranges dirty using `snap_number_active`, the same
    /// as a real write would (Design Note: manual marks conservatively
    /// over-report on the next diff).
    pub fn mark_dirty(&self, ranges: &[(u64, u64)]) {
        for &(start, count) in ranges {
            self.set(start, count);
        }
    }

    /// Called exactly once per snapshot capture while the device's queue
    /// is quiesced. Returns `Corrupted` and sets `is_corrupted` if
    /// `snap_number_active` would exceed 255.
    pub fn switch(&self) -> KResult<()> {
        let mut generation = self.generation.write().unwrap();
        if generation.is_corrupted {
            return Err(Error::Corrupted);
        }

        match generation.snap_number_active.checked_add(1) {
            Some(next) => {
                generation.snap_number_previous = generation.snap_number_active;
                generation.snap_number_active = next;
                Ok(())
            }
            None => {
                generation.is_corrupted = true;
                Err(Error::Corrupted)
            }
        }
    }

    /// Clears the bitmap, regenerates `generation_id`, resets snapshot
    /// numbers to 1, clears `is_corrupted`.
    pub fn reset(&self) {
        for byte in &self.bitmap {
            byte.store(0, Ordering::Relaxed);
        }
        let mut generation = self.generation.write().unwrap();
        generation.id = Uuid::new_v4();
        generation.snap_number_previous = 0;
        generation.snap_number_active = 1;
        generation.is_corrupted = false;
    }

    /// Copies raw bitmap bytes for the caller to diff against their last
    /// known snapshot number.
    pub fn read_to_user(&self, offset: usize, length: usize, out: &mut [u8]) -> KResult<usize> {
        let _generation = self.generation.read().unwrap();
        if offset > self.bitmap.len() {
            return Err(Error::Invalid);
        }
        let end = (offset + length).min(self.bitmap.len());
        let n = end - offset;
        for (i, byte) in self.bitmap[offset..end].iter().enumerate() {
            out[i] = byte.load(Ordering::Relaxed);
        }
        Ok(n)
    }

    pub fn device_capacity(&self) -> u64 {
        self.device_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_is_at_least_one_page() {
        let cbt = CbtMap::new(2048); // 1 MiB, well under 2^32 bytes
        assert_eq!(cbt.block_size(), PAGE_SIZE);
    }

    #[test]
    fn set_marks_the_intersecting_block_with_active_snap_number() {
        let cbt = CbtMap::new(1 << 21); // 1 GiB capacity
        cbt.set(4, 4); // sector 4, well inside block 0
        let mut out = vec![0u8; 1];
        cbt.read_to_user(0, 1, &mut out).unwrap();
        assert_eq!(out[0], 1); // snap_number_active starts at 1
    }

    #[test]
    fn switch_bumps_active_and_records_previous() {
        let cbt = CbtMap::new(1 << 21);
        assert_eq!(cbt.snap_numbers(), (0, 1));
        cbt.switch().unwrap();
        assert_eq!(cbt.snap_numbers(), (1, 2));
    }

    #[test]
    fn generation_id_changes_iff_reset() {
        let cbt = CbtMap::new(1 << 21);
        let before = cbt.generation_id();
        cbt.switch().unwrap();
        assert_eq!(cbt.generation_id(), before);
        cbt.reset();
        assert_ne!(cbt.generation_id(), before);
    }

    #[test]
    fn overflow_past_255_corrupts_and_switch_errors() {
        let cbt = CbtMap::new(1 << 21);
        for _ in 0..254 {
            cbt.switch().unwrap();
        }
        assert_eq!(cbt.snap_numbers().1, 255);
        assert_eq!(cbt.switch(), Err(Error::Corrupted));
        assert!(cbt.is_corrupted());
    }

    #[test]
    fn reset_clears_corruption_and_bitmap() {
        let cbt = CbtMap::new(1 << 21);
        cbt.set(0, 1);
        for _ in 0..254 {
            cbt.switch().unwrap();
        }
        let _ = cbt.switch();
        assert!(cbt.is_corrupted());

        cbt.reset();
        assert!(!cbt.is_corrupted());
        assert_eq!(cbt.snap_numbers(), (0, 1));
        let mut out = vec![0u8; 1];
        cbt.read_to_user(0, 1, &mut out).unwrap();
        assert_eq!(out[0], 0);
    }

    #[test]
    fn read_to_user_is_byte_identical_without_intervening_writes() {
        let cbt = CbtMap::new(1 << 21);
        cbt.set(0, 16);
        cbt.switch().unwrap();

        let mut first = vec![0u8; 8];
        let mut second = vec![0u8; 8];
        cbt.read_to_user(0, 8, &mut first).unwrap();
        cbt.read_to_user(0, 8, &mut second).unwrap();
        assert_eq!(first, second);
    }
}
