//! Reservation-based bitmap allocator.
//!
//! A [`BlockAllocator`] owns one pool's bitmap and accounting. Space is
//! claimed in two steps: [`BlockAllocator::reserve`] sets aside a count and
//! returns a [`Reservation`], and only the reservation can turn that count
//! into concrete indices, either immediately ([`Reservation::allocate`]) or
//! staged for copy-on-write ([`Reservation::swap`], applied by
//! [`Reservation::swap_commit`]). A dropped reservation returns whatever it
//! did not consume and cancels its uncommitted swaps.
//!
//! Accounting, all under one lock:
//!
//! ```text
//! available = total - used - reserved - staged
//! ```
//!
//! where `staged` is the union of every live reservation's swap-in set.
//! Indices are handed out first-free from a rolling hint. The scan never
//! wraps: every path that clears a bit or cancels a staged index lowers
//! the hint to that index, so no free index lies below it.
//!
//! # Logging
//!
//! - `mfs::alloc` info: allocator loaded.
//! - `mfs::alloc` debug: reserve, swap commit.
//! - `mfs::alloc` trace: allocate, swap, free, cancel.

use crate::bitmap::{bitmap_clear, bitmap_count_set, bitmap_find_free_from, bitmap_get, bitmap_set};
use crate::storage::{AllocatorStorage, PoolKind, bitmap_blocks};
use mfs_block::{BlockBuffer, PendingWork};
use mfs_error::{MfsError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Point-in-time allocator accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub pool: PoolKind,
    pub total: u32,
    pub used: u32,
    pub reserved: u32,
    pub staged_swaps: u32,
    pub first_free: u32,
    pub available: u32,
}

struct AllocatorState {
    bitmap: BlockBuffer,
    used: u32,
    reserved: u32,
    first_free: u32,
    staged: BTreeSet<u32>,
}

impl AllocatorState {
    #[expect(clippy::cast_possible_truncation)]
    fn staged_count(&self) -> u32 {
        self.staged.len() as u32
    }

    fn available(&self, total: u32) -> u32 {
        total
            .saturating_sub(self.used)
            .saturating_sub(self.reserved)
            .saturating_sub(self.staged_count())
    }

    fn find_free(&self, total: u32) -> Option<u32> {
        let staged = &self.staged;
        self.bitmap.with_bytes(|bytes| {
            bitmap_find_free_from(bytes, total, self.first_free, |i| staged.contains(&i))
        })
    }

    fn is_set(&self, index: u32) -> bool {
        self.bitmap.with_bytes(|bytes| bitmap_get(bytes, index))
    }

    fn lower_hint(&mut self, index: u32) {
        self.first_free = self.first_free.min(index);
    }
}

pub struct BlockAllocator {
    storage: Box<dyn AllocatorStorage>,
    state: Mutex<AllocatorState>,
}

impl BlockAllocator {
    /// Load the pool's bitmap and check it against the persisted counter.
    pub fn create(storage: Box<dyn AllocatorStorage>) -> Result<Arc<Self>> {
        let total = storage.pool_total();
        let bitmap = BlockBuffer::new(bitmap_blocks(total, storage.block_size()), storage.block_size());
        storage.load(&bitmap)?;
        let used = bitmap.with_bytes(|bytes| bitmap_count_set(bytes, total));
        let persisted = total - storage.pool_available();
        if used != persisted {
            return Err(MfsError::Corruption {
                block: 0,
                detail: format!(
                    "{} bitmap has {used} bits set but superblock counts {persisted}",
                    storage.pool_kind()
                ),
            });
        }
        info!(target: "mfs::alloc", pool = %storage.pool_kind(), total, used, "allocator loaded");
        Ok(Arc::new(Self {
            storage,
            state: Mutex::new(AllocatorState {
                bitmap,
                used,
                reserved: 0,
                first_free: 0,
                staged: BTreeSet::new(),
            }),
        }))
    }

    #[must_use]
    pub fn pool_kind(&self) -> PoolKind {
        self.storage.pool_kind()
    }

    /// Set aside `count` items, growing the pool through storage if short.
    ///
    /// Fails with [`MfsError::NoSpace`] without touching any state when the
    /// pool cannot cover the request.
    pub fn reserve(self: &Arc<Self>, work: &mut dyn PendingWork, count: u32) -> Result<Reservation> {
        let kind = self.pool_kind();
        let mut state = self.state.lock();
        loop {
            let total = self.storage.pool_total();
            let available = state.available(total);
            if available >= count {
                break;
            }
            let bitmap = state.bitmap.clone();
            let block_size = self.storage.block_size();
            self.storage.extend(work, &bitmap, &mut |new_total| {
                bitmap.grow(bitmap_blocks(new_total, block_size));
                Ok(())
            })?;
            if self.storage.pool_total() <= total {
                return Err(MfsError::NoSpace);
            }
        }
        state.reserved += count;
        debug!(
            target: "mfs::alloc",
            pool = %kind,
            count,
            reserved = state.reserved,
            available = state.available(self.storage.pool_total()),
            "reserve"
        );
        drop(state);
        Ok(Reservation {
            allocator: Arc::clone(self),
            remaining: count,
            swap_in: Vec::new(),
            swap_out: Vec::new(),
        })
    }

    /// Clear `index` immediately and stage the bitmap and counter writes.
    pub fn free(&self, work: &mut dyn PendingWork, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        let total = self.storage.pool_total();
        if index >= total {
            return Err(MfsError::OutOfRange {
                index: u64::from(index),
                limit: u64::from(total),
            });
        }
        if !state.is_set(index) {
            return Err(MfsError::Corruption {
                block: u64::from(index),
                detail: format!("double free of {} index {index}", self.pool_kind()),
            });
        }
        state.bitmap.with_bytes_mut(|bytes| bitmap_clear(bytes, index));
        state.used -= 1;
        state.lower_hint(index);
        let bitmap = state.bitmap.clone();
        self.storage.persist_range(work, &bitmap, index, 1);
        self.storage.persist_release(work, 1)?;
        trace!(target: "mfs::alloc", pool = %self.pool_kind(), index, "free");
        Ok(())
    }

    #[must_use]
    pub fn available(&self) -> u32 {
        self.state.lock().available(self.storage.pool_total())
    }

    /// `true` when `index` is marked allocated in the committed bitmap.
    #[must_use]
    pub fn is_allocated(&self, index: u32) -> bool {
        self.state.lock().is_set(index)
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        let total = self.storage.pool_total();
        AllocatorStats {
            pool: self.pool_kind(),
            total,
            used: state.used,
            reserved: state.reserved,
            staged_swaps: state.staged_count(),
            first_free: state.first_free,
            available: state.available(total),
        }
    }

    /// Verify `set bits == used` and `used + reserved + staged <= total`.
    pub fn check_consistency(&self) -> Result<()> {
        let state = self.state.lock();
        let total = self.storage.pool_total();
        let set = state.bitmap.with_bytes(|bytes| bitmap_count_set(bytes, total));
        if set != state.used {
            return Err(MfsError::Corruption {
                block: 0,
                detail: format!("{set} bits set but {} counted used", state.used),
            });
        }
        let committed = u64::from(state.used) + u64::from(state.reserved) + u64::from(state.staged_count());
        if committed > u64::from(total) {
            return Err(MfsError::Corruption {
                block: 0,
                detail: format!("{committed} items claimed from a pool of {total}"),
            });
        }
        Ok(())
    }

    fn allocate_one(&self, work: &mut dyn PendingWork) -> Result<u32> {
        let mut state = self.state.lock();
        let total = self.storage.pool_total();
        let Some(index) = state.find_free(total) else {
            panic!(
                "{} allocator: no free bit despite outstanding reservation (used={}, reserved={}, total={total})",
                self.pool_kind(),
                state.used,
                state.reserved
            );
        };
        state.bitmap.with_bytes_mut(|bytes| bitmap_set(bytes, index));
        state.used += 1;
        state.reserved -= 1;
        state.first_free = index + 1;
        let bitmap = state.bitmap.clone();
        self.storage.persist_range(work, &bitmap, index, 1);
        self.storage.persist_allocate(work, 1)?;
        trace!(target: "mfs::alloc", pool = %self.pool_kind(), index, "allocate");
        Ok(index)
    }

    fn swap_one(&self, old: u32, swap_in: &mut Vec<u32>, swap_out: &mut Vec<u32>) -> Result<u32> {
        let mut state = self.state.lock();
        let total = self.storage.pool_total();
        if old > 0 {
            if !state.is_set(old) {
                return Err(MfsError::Corruption {
                    block: u64::from(old),
                    detail: format!("swap of unallocated {} index {old}", self.pool_kind()),
                });
            }
            if swap_out.contains(&old) {
                return Err(MfsError::Corruption {
                    block: u64::from(old),
                    detail: format!("{} index {old} already staged for release", self.pool_kind()),
                });
            }
        }
        let Some(index) = state.find_free(total) else {
            panic!(
                "{} allocator: no free bit for swap despite outstanding reservation",
                self.pool_kind()
            );
        };
        state.staged.insert(index);
        state.reserved -= 1;
        state.first_free = index + 1;
        drop(state);
        swap_in.push(index);
        if old > 0 {
            swap_out.push(old);
        }
        trace!(target: "mfs::alloc", pool = %self.pool_kind(), old, new = index, "swap");
        Ok(index)
    }

    fn swap_commit(
        &self,
        work: &mut dyn PendingWork,
        swap_in: &mut Vec<u32>,
        swap_out: &mut Vec<u32>,
    ) -> Result<()> {
        if swap_in.is_empty() && swap_out.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if let Some(bad) = swap_out.iter().find(|o| !state.is_set(**o)) {
            return Err(MfsError::Corruption {
                block: u64::from(*bad),
                detail: format!("swap-out of unallocated {} index {bad}", self.pool_kind()),
            });
        }
        let bitmap = state.bitmap.clone();
        for &index in swap_in.iter() {
            bitmap.with_bytes_mut(|bytes| bitmap_set(bytes, index));
            state.staged.remove(&index);
            self.storage.persist_range(work, &bitmap, index, 1);
        }
        for &index in swap_out.iter() {
            bitmap.with_bytes_mut(|bytes| bitmap_clear(bytes, index));
            state.lower_hint(index);
            self.storage.persist_range(work, &bitmap, index, 1);
        }
        #[expect(clippy::cast_possible_truncation)]
        let (added, removed) = (swap_in.len() as u32, swap_out.len() as u32);
        state.used = state.used + added - removed;
        if added > removed {
            self.storage.persist_allocate(work, added - removed)?;
        } else if removed > added {
            self.storage.persist_release(work, removed - added)?;
        }
        debug!(
            target: "mfs::alloc",
            pool = %self.pool_kind(),
            swapped_in = added,
            swapped_out = removed,
            used = state.used,
            "swap commit"
        );
        drop(state);
        swap_in.clear();
        swap_out.clear();
        Ok(())
    }

    fn plan_swap_commit(&self, work: &mut dyn PendingWork, swap_in: &[u32], swap_out: &[u32]) -> Result<()> {
        let bitmap = self.state.lock().bitmap.clone();
        for &index in swap_in.iter().chain(swap_out) {
            self.storage.persist_range(work, &bitmap, index, 1);
        }
        if swap_in.len() != swap_out.len() {
            // Stages the superblock write; the counter is left as is.
            self.storage.persist_allocate(work, 0)?;
        }
        Ok(())
    }

    fn cancel(&self, remaining: u32, swap_in: &[u32]) {
        let mut state = self.state.lock();
        state.reserved -= remaining;
        for &index in swap_in {
            state.staged.remove(&index);
            state.lower_hint(index);
        }
        trace!(
            target: "mfs::alloc",
            pool = %self.pool_kind(),
            returned = remaining,
            cancelled_swaps = swap_in.len(),
            "reservation released"
        );
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Right to allocate up to `remaining` items from one allocator.
///
/// Only [`BlockAllocator::reserve`] constructs one. Each reservation keeps
/// its own swap-in / swap-out staging; [`Self::swap_commit`] applies
/// exactly those.
pub struct Reservation {
    allocator: Arc<BlockAllocator>,
    remaining: u32,
    swap_in: Vec<u32>,
    swap_out: Vec<u32>,
}

impl Reservation {
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    /// Staged, uncommitted swap-in indices.
    #[must_use]
    pub fn staged_swaps(&self) -> &[u32] {
        &self.swap_in
    }

    /// Take one item and mark it allocated.
    ///
    /// # Panics
    ///
    /// When the reservation is exhausted.
    pub fn allocate(&mut self, work: &mut dyn PendingWork) -> Result<u32> {
        assert!(
            self.remaining > 0,
            "allocate from an exhausted {} reservation",
            self.allocator.pool_kind()
        );
        self.remaining -= 1;
        self.allocator.allocate_one(work)
    }

    /// Stage a replacement for `old` (0 means "no old item").
    ///
    /// The committed bitmap is untouched until [`Self::swap_commit`]. An
    /// `old` that this reservation staged itself is still uncommitted, so
    /// it is returned as is without using another item.
    ///
    /// # Panics
    ///
    /// When the reservation is exhausted.
    pub fn swap(&mut self, old: u32) -> Result<u32> {
        if old > 0 && self.swap_in.contains(&old) {
            trace!(target: "mfs::alloc", pool = %self.allocator.pool_kind(), index = old, "swap of own staged index");
            return Ok(old);
        }
        assert!(
            self.remaining > 0,
            "swap from an exhausted {} reservation",
            self.allocator.pool_kind()
        );
        let index = self
            .allocator
            .swap_one(old, &mut self.swap_in, &mut self.swap_out)?;
        self.remaining -= 1;
        Ok(index)
    }

    /// Apply staged swaps: set every swap-in bit, clear every swap-out bit.
    /// A no-op when nothing is staged.
    pub fn swap_commit(&mut self, work: &mut dyn PendingWork) -> Result<()> {
        self.allocator
            .swap_commit(work, &mut self.swap_in, &mut self.swap_out)
    }

    /// Stage the writes [`Self::swap_commit`] would stage without applying
    /// any swap, so a caller can size its work before committing.
    pub fn plan_swap_commit(&self, work: &mut dyn PendingWork) -> Result<()> {
        self.allocator
            .plan_swap_commit(work, &self.swap_in, &self.swap_out)
    }

    /// Move `count` unused items into a new reservation.
    pub fn split(&mut self, count: u32) -> Result<Self> {
        if count > self.remaining {
            return Err(MfsError::InvalidArgument(format!(
                "cannot split {count} from a reservation of {}",
                self.remaining
            )));
        }
        self.remaining -= count;
        Ok(Self {
            allocator: Arc::clone(&self.allocator),
            remaining: count,
            swap_in: Vec::new(),
            swap_out: Vec::new(),
        })
    }

    /// Absorb `other`, which must come from the same allocator.
    pub fn merge(&mut self, mut other: Self) -> Result<()> {
        if !Arc::ptr_eq(&self.allocator, &other.allocator) {
            return Err(MfsError::InvalidArgument(
                "cannot merge reservations from different allocators".to_owned(),
            ));
        }
        self.remaining += std::mem::take(&mut other.remaining);
        self.swap_in.append(&mut other.swap_in);
        self.swap_out.append(&mut other.swap_out);
        Ok(())
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("pool", &self.allocator.pool_kind())
            .field("remaining", &self.remaining)
            .field("swap_in", &self.swap_in)
            .field("swap_out", &self.swap_out)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.remaining > 0 || !self.swap_in.is_empty() {
            self.allocator.cancel(self.remaining, &self.swap_in);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PersistentStorage;
    use crate::superblock::SuperblockManager;
    use crate::volume::{SliceBudgetVolume, VolumeManager};
    use mfs_block::{
        ByteBlockDevice, DeviceTransactionHandler, MemoryByteDevice, TransactionHandler, WriteBatch,
    };
    use mfs_ondisk::{BLOCK_SIZE, FvmLayout, Superblock};

    const DEVICE_BLOCKS: usize = 128;

    fn handler(blocks: usize) -> Arc<dyn TransactionHandler> {
        let mem = MemoryByteDevice::new(blocks * BLOCK_SIZE as usize);
        let dev = ByteBlockDevice::new(mem, BLOCK_SIZE).expect("device");
        Arc::new(DeviceTransactionHandler::new(dev).expect("handler"))
    }

    fn block_pool(total: u32) -> (Arc<BlockAllocator>, Arc<SuperblockManager>) {
        let handler = handler(DEVICE_BLOCKS);
        let sb = Superblock::for_device(DEVICE_BLOCKS as u64, 32, Some(total)).expect("geometry");
        let sbm = Arc::new(SuperblockManager::new(sb, handler.as_ref()));
        let storage = PersistentStorage::new(PoolKind::Blocks, Arc::clone(&sbm), handler, None);
        (BlockAllocator::create(Box::new(storage)).expect("allocator"), sbm)
    }

    #[test]
    fn free_then_allocate_reuses_lowest_index() {
        let (alloc, _sbm) = block_pool(100);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 10).expect("reserve");
        for expected in 0..9 {
            assert_eq!(res.allocate(&mut work).expect("allocate"), expected);
        }
        let last = res.allocate(&mut work).expect("allocate");
        assert_eq!(last, 9);
        drop(res);

        let before = alloc.available();
        alloc.free(&mut work, 3).expect("free");
        assert_eq!(alloc.available(), before + 1);

        let mut res = alloc.reserve(&mut work, 1).expect("reserve");
        assert_eq!(res.allocate(&mut work).expect("allocate"), 3);
        alloc.check_consistency().expect("consistent");
    }

    #[test]
    fn allocation_persists_bitmap_and_counter() {
        let (alloc, sbm) = block_pool(100);
        let abm = u64::from(sbm.snapshot().abm_block);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 2).expect("reserve");
        res.allocate(&mut work).expect("allocate");
        res.allocate(&mut work).expect("allocate");

        assert_eq!(sbm.snapshot().alloc_block_count, 2);
        let (data, metadata) = work.into_parts();
        assert!(data.is_empty());
        assert!(metadata.iter().any(|m| m.op.dev_offset == abm && m.op.length == 1));
        assert!(metadata.iter().any(|m| m.op.dev_offset == 0));
        assert_eq!(metadata.len(), 2, "repeated writes of the same blocks merge");
    }

    #[test]
    fn reserve_beyond_capacity_fails_without_side_effects() {
        let (alloc, _sbm) = block_pool(10);
        let mut work = WriteBatch::new();
        let held = alloc.reserve(&mut work, 6).expect("reserve");
        assert!(matches!(alloc.reserve(&mut work, 5), Err(MfsError::NoSpace)));
        assert_eq!(alloc.available(), 4);
        drop(held);
        assert_eq!(alloc.available(), 10);
        assert!(work.is_empty());
    }

    #[test]
    fn reservations_never_run_dry_within_their_count() {
        let (alloc, _sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut a = alloc.reserve(&mut work, 7).expect("reserve");
        let mut b = alloc.reserve(&mut work, 13).expect("reserve");
        for _ in 0..7 {
            a.allocate(&mut work).expect("allocate");
        }
        for _ in 0..13 {
            b.allocate(&mut work).expect("allocate");
        }
        assert_eq!(alloc.available(), 0);
        alloc.check_consistency().expect("consistent");
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn allocating_past_reservation_panics() {
        let (alloc, _sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 1).expect("reserve");
        res.allocate(&mut work).expect("allocate");
        let _ = res.allocate(&mut work);
    }

    #[test]
    fn double_free_is_corruption() {
        let (alloc, _sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 1).expect("reserve");
        let idx = res.allocate(&mut work).expect("allocate");
        alloc.free(&mut work, idx).expect("free");
        assert!(matches!(
            alloc.free(&mut work, idx),
            Err(MfsError::Corruption { .. })
        ));
        assert!(matches!(
            alloc.free(&mut work, 500),
            Err(MfsError::OutOfRange { .. })
        ));
    }

    #[test]
    fn swap_commit_moves_allocation_and_second_commit_is_noop() {
        let (alloc, sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut res_old = alloc.reserve(&mut work, 3).expect("reserve");
        res_old.allocate(&mut work).expect("allocate index 0");
        let old = res_old.allocate(&mut work).expect("allocate");
        assert_eq!(old, 1);
        let new = res_old.swap(old).expect("swap");
        assert_ne!(new, old);
        assert!(alloc.is_allocated(old));
        assert!(!alloc.is_allocated(new));
        assert_eq!(alloc.stats().staged_swaps, 1);

        res_old.swap_commit(&mut work).expect("commit");
        assert!(!alloc.is_allocated(old));
        assert!(alloc.is_allocated(new));
        let used = alloc.stats().used;
        res_old.swap_commit(&mut work).expect("second commit");
        assert_eq!(alloc.stats().used, used);
        assert_eq!(sbm.snapshot().alloc_block_count, used);
        alloc.check_consistency().expect("consistent");
    }

    #[test]
    fn planned_swap_commit_matches_the_real_one() {
        let (alloc, sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 4).expect("reserve");
        res.allocate(&mut work).expect("allocate index 0");
        let old = res.allocate(&mut work).expect("allocate");
        res.swap(old).expect("swap");
        res.swap(0).expect("swap of hole");
        let used = alloc.stats().used;
        let counter = sbm.snapshot().alloc_block_count;

        let mut planned = WriteBatch::new();
        res.plan_swap_commit(&mut planned).expect("plan");
        assert_eq!(alloc.stats().used, used);
        assert_eq!(alloc.stats().staged_swaps, 2);
        assert_eq!(sbm.snapshot().alloc_block_count, counter);

        let mut committed = WriteBatch::new();
        res.swap_commit(&mut committed).expect("commit");
        assert_eq!(planned.block_count(), committed.block_count());
        assert_eq!(planned.metadata().len(), committed.metadata().len());
        assert_eq!(alloc.stats().used, used + 1);
    }

    #[test]
    fn dropped_swap_leaves_bitmap_untouched() {
        let (alloc, _sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 2).expect("reserve");
        res.allocate(&mut work).expect("allocate index 0");
        let old = res.allocate(&mut work).expect("allocate");
        drop(res);
        let available = alloc.available();

        let mut res = alloc.reserve(&mut work, 1).expect("reserve");
        let new = res.swap(old).expect("swap");
        drop(res);
        assert_eq!(alloc.available(), available);
        assert!(alloc.is_allocated(old));
        assert!(!alloc.is_allocated(new));
        assert_eq!(alloc.stats().staged_swaps, 0);
        assert!(alloc.stats().first_free <= new);
    }

    #[test]
    fn staged_index_is_not_handed_to_other_reservations() {
        let (alloc, _sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut swapper = alloc.reserve(&mut work, 1).expect("reserve");
        let staged = swapper.swap(0).expect("swap of hole");
        let mut other = alloc.reserve(&mut work, 1).expect("reserve");
        let got = other.allocate(&mut work).expect("allocate");
        assert_ne!(got, staged);
        swapper.swap_commit(&mut work).expect("commit");
        assert!(alloc.is_allocated(staged));
        alloc.check_consistency().expect("consistent");
    }

    #[test]
    fn swapping_an_own_staged_index_reuses_it() {
        let (alloc, _sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 2).expect("reserve");
        res.allocate(&mut work).expect("allocate index 0");
        let old = res.allocate(&mut work).expect("allocate");
        drop(res);

        let mut res = alloc.reserve(&mut work, 2).expect("reserve");
        let first = res.swap(old).expect("swap");
        let second = res.swap(first).expect("swap again");
        assert_eq!(second, first);
        assert_eq!(res.remaining(), 1, "re-swap uses no extra item");
        assert_eq!(res.staged_swaps(), &[first]);
        assert_eq!(alloc.stats().staged_swaps, 1);
        res.swap_commit(&mut work).expect("commit");
        assert!(!alloc.is_allocated(old));
        assert!(alloc.is_allocated(first));
        drop(res);
        assert_eq!(alloc.stats().reserved, 0);
        alloc.check_consistency().expect("consistent");
    }

    #[test]
    fn split_and_merge_move_counts() {
        let (alloc, _sbm) = block_pool(20);
        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 5).expect("reserve");
        let part = res.split(2).expect("split");
        assert_eq!(res.remaining(), 3);
        assert_eq!(part.remaining(), 2);
        assert!(res.split(4).is_err());
        res.merge(part).expect("merge");
        assert_eq!(res.remaining(), 5);
        assert_eq!(alloc.stats().reserved, 5);

        let (other_alloc, _other_sbm) = block_pool(20);
        let foreign = other_alloc.reserve(&mut work, 1).expect("reserve");
        assert!(res.merge(foreign).is_err());
        assert_eq!(other_alloc.stats().reserved, 0);
        drop(res);
        assert_eq!(alloc.stats().reserved, 0);
    }

    #[test]
    fn stats_serialize_to_json() {
        let (alloc, _sbm) = block_pool(20);
        let json = serde_json::to_value(alloc.stats()).expect("json");
        assert_eq!(json["pool"], "Blocks");
        assert_eq!(json["total"], 20);
    }

    #[test]
    fn volume_backed_pool_grows_on_demand() {
        let layout = FvmLayout {
            slice_blocks: 4,
            region_stride_blocks: 16,
            data_slices: 2,
        };
        let handler = handler(96);
        let sb = Superblock::for_fvm(&layout, 32).expect("geometry");
        let slice_size = sb.slice_size;
        let sbm = Arc::new(SuperblockManager::new(sb, handler.as_ref()));
        let volume = Arc::new(SliceBudgetVolume::new(slice_size, 6, 8));
        let storage = PersistentStorage::new(
            PoolKind::Blocks,
            Arc::clone(&sbm),
            handler,
            Some(Arc::clone(&volume) as Arc<dyn VolumeManager>),
        );
        let alloc = BlockAllocator::create(Box::new(storage)).expect("allocator");
        assert_eq!(alloc.stats().total, 8);

        let mut work = WriteBatch::new();
        let mut res = alloc.reserve(&mut work, 14).expect("reserve grows pool");
        assert_eq!(alloc.stats().total, 16);
        assert_eq!(sbm.snapshot().dat_slices, 4);
        assert_eq!(volume.extents(), vec![(18, 1), (19, 1)]);
        for _ in 0..14 {
            res.allocate(&mut work).expect("allocate");
        }
        assert!(matches!(alloc.reserve(&mut work, 3), Err(MfsError::NoSpace)));
        alloc.check_consistency().expect("consistent");
    }
}
