//! Block-transaction handler.
//!
//! The handler is the only component that touches the device write path.
//! It executes batches of [`BufferedOperation`]s in order and exposes a
//! synchronous flush. [`DeviceTransactionHandler`] runs them against any
//! [`BlockDevice`] one block at a time and keeps I/O statistics.
//!
//! # Logging
//!
//! - `mfs::storage` trace: one event per executed batch.
//! - `mfs::storage` error: device read/write/flush failures.

use crate::{BlockDevice, BufferedOperation, OperationKind};
use mfs_error::{MfsError, Result};
use mfs_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, trace};

/// Handler I/O statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStats {
    /// Blocks read from the device.
    pub blocks_read: u64,
    /// Blocks written to the device.
    pub blocks_written: u64,
    /// Flushes issued.
    pub flushes: u64,
    /// Batches executed.
    pub batches: u64,
}

/// Executes block-range transfers and flushes against the device.
pub trait TransactionHandler: Send + Sync {
    /// Filesystem block size the handler addresses the device in.
    fn block_size(&self) -> BlockSize;

    /// Device size in filesystem blocks.
    fn block_count(&self) -> u64;

    /// Execute `operations` in order. Stops at the first failure.
    fn run_requests(&self, operations: &[BufferedOperation]) -> Result<()>;

    /// Make every completed write durable.
    fn flush(&self) -> Result<()>;
}

pub struct DeviceTransactionHandler<D: BlockDevice> {
    device: D,
    block_size: BlockSize,
    stats: Mutex<HandlerStats>,
}

impl<D: BlockDevice> DeviceTransactionHandler<D> {
    pub fn new(device: D) -> Result<Self> {
        let block_size = BlockSize::new(device.block_size()).map_err(|e| {
            MfsError::Format(format!("device block size {}: {e}", device.block_size()))
        })?;
        Ok(Self {
            device,
            block_size,
            stats: Mutex::new(HandlerStats::default()),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn stats(&self) -> HandlerStats {
        self.stats.lock().clone()
    }

    fn run_one(&self, operation: &BufferedOperation) -> Result<()> {
        let op = operation.op;
        if operation.buffer.block_size() != self.block_size {
            return Err(MfsError::InvalidArgument(format!(
                "buffer block size {} does not match device block size {}",
                operation.buffer.block_size(),
                self.block_size
            )));
        }
        let end = op
            .dev_offset
            .checked_add(op.length)
            .filter(|end| *end <= self.device.block_count())
            .ok_or(MfsError::OutOfRange {
                index: op.dev_offset.saturating_add(op.length),
                limit: self.device.block_count(),
            })?;
        let vmo_start = usize::try_from(op.vmo_offset)
            .map_err(|_| MfsError::InvalidArgument("buffer offset overflows usize".to_owned()))?;

        for (i, dev_block) in (op.dev_offset..end).enumerate() {
            match op.kind {
                OperationKind::Write => {
                    let data = operation.buffer.read_blocks(vmo_start + i, 1)?;
                    self.device.write_block(BlockNumber(dev_block), &data)?;
                }
                OperationKind::Read => {
                    let block = self.device.read_block(BlockNumber(dev_block))?;
                    operation
                        .buffer
                        .write_blocks(vmo_start + i, block.as_slice())?;
                }
            }
        }

        let mut stats = self.stats.lock();
        match op.kind {
            OperationKind::Write => stats.blocks_written += op.length,
            OperationKind::Read => stats.blocks_read += op.length,
        }
        drop(stats);
        Ok(())
    }
}

impl<D: BlockDevice> std::fmt::Debug for DeviceTransactionHandler<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTransactionHandler")
            .field("block_size", &self.block_size.get())
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> TransactionHandler for DeviceTransactionHandler<D> {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.device.block_count()
    }

    fn run_requests(&self, operations: &[BufferedOperation]) -> Result<()> {
        self.stats.lock().batches += 1;
        trace!(target: "mfs::storage", ops = operations.len(), "run_requests");
        for operation in operations {
            if let Err(err) = self.run_one(operation) {
                error!(
                    target: "mfs::storage",
                    kind = ?operation.op.kind,
                    dev_offset = operation.op.dev_offset,
                    length = operation.op.length,
                    error = %err,
                    "block transfer failed"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.stats.lock().flushes += 1;
        self.device.sync().inspect_err(|err| {
            error!(target: "mfs::storage", error = %err, "device flush failed");
        })
    }
}
