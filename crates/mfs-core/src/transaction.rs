//! Per-operation transactions.
//!
//! A [`Transaction`] bundles an inode reservation, a block reservation and
//! the ordered data and metadata writes staged while the operation runs.
//! [`Transaction::commit`] applies staged block swaps and hands everything,
//! together with the pinned vnodes, to the write-back pipeline as one unit.
//! A transaction too large for the write-back ring is refused before any
//! swap is applied. Dropping a transaction without committing returns
//! whatever its reservations did not consume and cancels their staged
//! swaps.
//!
//! # Logging
//!
//! - `mfs::txn` debug: create, commit, drop without commit.
//! - `mfs::txn` warn: creation refused because the filesystem is read-only;
//!   commit refused because the work outgrows the write-back ring.

use crate::fs::Minfs;
use crate::vnode::Vnode;
use mfs_alloc::Reservation;
use mfs_block::{PendingWork, UnbufferedOperation, WriteBatch};
use mfs_error::{MfsError, Result};
use mfs_types::TxnId;
use mfs_writeback::{CompletionCallback, Pinned, WritebackWork};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Transaction {
    id: TxnId,
    fs: Arc<Minfs>,
    inode_reservation: Option<Reservation>,
    block_reservation: Option<Reservation>,
    batch: WriteBatch,
    pinned: Vec<Pinned>,
    callbacks: Vec<CompletionCallback>,
    committed: bool,
}

impl Transaction {
    /// Reserve `inodes` inodes and `blocks` blocks for a new operation.
    ///
    /// Holds the filesystem transaction lock only while reserving. On any
    /// failure every reservation already taken is released.
    pub fn create(fs: &Arc<Minfs>, inodes: u32, blocks: u32) -> Result<Self> {
        let id = fs.next_txn_id();
        let mut batch = WriteBatch::new();
        let reserved = {
            let _serialize = fs.txn_lock.lock();
            if let Err(err) = fs.check_writable() {
                warn!(target: "mfs::txn", txn = %id, error = %err, "transaction refused");
                return Err(err);
            }
            Self::reserve(fs, &mut batch, inodes, blocks)
        };
        if !batch.is_empty() {
            // Pool growth staged superblock and bitmap writes; they stand
            // even when a later reservation failed.
            fs.writeback().enqueue(WritebackWork::from_batch(id, std::mem::take(&mut batch)))?;
        }
        let (inode_reservation, block_reservation) = reserved?;
        debug!(target: "mfs::txn", txn = %id, inodes, blocks, "create");
        Ok(Self {
            id,
            fs: Arc::clone(fs),
            inode_reservation,
            block_reservation,
            batch,
            pinned: Vec::new(),
            callbacks: Vec::new(),
            committed: false,
        })
    }

    fn reserve(
        fs: &Arc<Minfs>,
        batch: &mut WriteBatch,
        inodes: u32,
        blocks: u32,
    ) -> Result<(Option<Reservation>, Option<Reservation>)> {
        let inode_reservation = if inodes > 0 {
            Some(fs.inode_allocator().reserve(batch, inodes)?)
        } else {
            None
        };
        let block_reservation = if blocks > 0 {
            Some(fs.block_allocator().reserve(batch, blocks)?)
        } else {
            None
        };
        Ok((inode_reservation, block_reservation))
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn filesystem(&self) -> &Arc<Minfs> {
        &self.fs
    }

    /// Unused blocks left in the block reservation.
    #[must_use]
    pub fn blocks_remaining(&self) -> u32 {
        self.block_reservation.as_ref().map_or(0, Reservation::remaining)
    }

    /// Unused inodes left in the inode reservation.
    #[must_use]
    pub fn inodes_remaining(&self) -> u32 {
        self.inode_reservation.as_ref().map_or(0, Reservation::remaining)
    }

    /// Allocate one data-pool block from the block reservation.
    ///
    /// # Panics
    ///
    /// When the transaction holds no blocks or has used them all.
    pub fn allocate_block(&mut self) -> Result<u32> {
        let Some(reservation) = self.block_reservation.as_mut() else {
            panic!("{}: block allocation without a block reservation", self.id);
        };
        reservation.allocate(&mut self.batch)
    }

    /// Allocate one inode from the inode reservation.
    ///
    /// # Panics
    ///
    /// When the transaction holds no inodes or has used them all.
    pub fn allocate_inode(&mut self) -> Result<u32> {
        let Some(reservation) = self.inode_reservation.as_mut() else {
            panic!("{}: inode allocation without an inode reservation", self.id);
        };
        reservation.allocate(&mut self.batch)
    }

    /// Stage a copy-on-write replacement for data block `old` (0 for none).
    ///
    /// # Panics
    ///
    /// When the transaction holds no blocks or has used them all.
    pub fn swap_block(&mut self, old: u32) -> Result<u32> {
        let Some(reservation) = self.block_reservation.as_mut() else {
            panic!("{}: block swap without a block reservation", self.id);
        };
        reservation.swap(old)
    }

    /// Free data block `index` immediately.
    pub fn free_block(&mut self, index: u32) -> Result<()> {
        self.fs.block_allocator().free(&mut self.batch, index)
    }

    /// Free inode `index` immediately.
    pub fn free_inode(&mut self, index: u32) -> Result<()> {
        self.fs.inode_allocator().free(&mut self.batch, index)
    }

    /// Keep `vnode` alive until this transaction's writes complete.
    pub fn pin_vnode(&mut self, vnode: Arc<Vnode>) {
        self.pinned.push(vnode);
    }

    /// Run `callback` with the write-back result once this transaction's
    /// writes are durable or have failed. Dropped unrun without a commit.
    pub fn on_complete(&mut self, callback: CompletionCallback) {
        self.callbacks.push(callback);
    }

    /// Hand the unused block reservation to the caller.
    pub fn take_block_reservation(&mut self) -> Option<Reservation> {
        self.block_reservation.take()
    }

    /// Split the unused blocks off the block reservation. Staged swaps stay
    /// behind for [`Transaction::commit`].
    pub fn take_unused_blocks(&mut self) -> Result<Option<Reservation>> {
        match self.block_reservation.as_mut() {
            Some(reservation) if reservation.remaining() > 0 => {
                let unused = reservation.remaining();
                reservation.split(unused).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Add `reservation` to this transaction's block reservation.
    pub fn give_block_reservation(&mut self, reservation: Reservation) -> Result<()> {
        match self.block_reservation.as_mut() {
            Some(held) => held.merge(reservation),
            None => {
                if !Arc::ptr_eq(reservation.allocator(), self.fs.block_allocator()) {
                    return Err(MfsError::InvalidArgument(
                        "reservation does not belong to the block allocator".to_owned(),
                    ));
                }
                self.block_reservation = Some(reservation);
                Ok(())
            }
        }
    }

    /// Apply staged swaps and queue everything for write-back.
    ///
    /// Returns once the work is queued; durability is reported through
    /// [`Minfs::sync`]. Work larger than the write-back ring fails with
    /// [`MfsError::InvalidArgument`] before any staged swap is applied.
    pub fn commit(mut self) -> Result<()> {
        let capacity = self.fs.writeback().capacity_blocks();
        let mut planned = self.batch.clone();
        if let Some(reservation) = self.block_reservation.as_ref() {
            reservation.plan_swap_commit(&mut planned)?;
        }
        let blocks = planned.block_count();
        if blocks > capacity {
            warn!(target: "mfs::txn", txn = %self.id, blocks, capacity, "transaction exceeds write-back capacity");
            return Err(MfsError::InvalidArgument(format!(
                "{} of {blocks} blocks exceeds write-back capacity {capacity}",
                self.id
            )));
        }
        if let Some(reservation) = self.block_reservation.as_mut() {
            reservation.swap_commit(&mut self.batch)?;
        }
        let batch = std::mem::take(&mut self.batch);
        let mut work = WritebackWork::from_batch(self.id, batch);
        for pin in self.pinned.drain(..) {
            work.pin(pin);
        }
        for callback in self.callbacks.drain(..) {
            work.on_complete(callback);
        }
        self.committed = true;
        debug!(target: "mfs::txn", txn = %self.id, blocks = work.block_count(), "commit");
        self.fs.writeback().enqueue(work)
    }
}

impl PendingWork for Transaction {
    fn enqueue_metadata(&mut self, operation: UnbufferedOperation) {
        self.batch.enqueue_metadata(operation);
    }

    fn enqueue_data(&mut self, operation: UnbufferedOperation) {
        self.batch.enqueue_data(operation);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed {
            debug!(
                target: "mfs::txn",
                txn = %self.id,
                unused_blocks = self.blocks_remaining(),
                staged_ops = self.batch.metadata().len() + self.batch.data().len(),
                "dropped without commit"
            );
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("inode_reservation", &self.inode_reservation)
            .field("block_reservation", &self.block_reservation)
            .field("pinned", &self.pinned.len())
            .finish_non_exhaustive()
    }
}
