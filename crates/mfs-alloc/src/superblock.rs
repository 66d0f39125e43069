//! In-memory owner of the superblock.
//!
//! Both pools' storage adapters share one manager. Counter changes are
//! applied to the in-memory copy and staged as a write of block 0 on the
//! caller's pending work; the bytes are captured when that work is enqueued.

use mfs_block::{
    BlockBuffer, BufferedOperation, Operation, PendingWork, TransactionHandler,
    UnbufferedOperation,
};
use mfs_error::{MfsError, Result};
use mfs_ondisk::{Superblock, parse_error_to_mfs};
use parking_lot::Mutex;

/// Device block holding the superblock.
pub const SUPERBLOCK_BLOCK: u64 = 0;

#[derive(Debug)]
pub struct SuperblockManager {
    superblock: Mutex<Superblock>,
    block: BlockBuffer,
}

impl SuperblockManager {
    pub fn new(superblock: Superblock, handler: &dyn TransactionHandler) -> Self {
        Self {
            superblock: Mutex::new(superblock),
            block: BlockBuffer::new(1, handler.block_size()),
        }
    }

    /// Read and validate the superblock from the device.
    pub fn load(handler: &dyn TransactionHandler) -> Result<Self> {
        let block = BlockBuffer::new(1, handler.block_size());
        handler.run_requests(&[BufferedOperation {
            buffer: block.clone(),
            op: Operation::read(0, SUPERBLOCK_BLOCK, 1),
        }])?;
        let superblock = block
            .with_bytes(Superblock::parse)
            .map_err(|e| parse_error_to_mfs(&e))?;
        superblock
            .validate(handler.block_count())
            .map_err(|e| parse_error_to_mfs(&e))?;
        Ok(Self {
            superblock: Mutex::new(superblock),
            block,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> Superblock {
        self.superblock.lock().clone()
    }

    /// Read the in-memory superblock without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&Superblock) -> R) -> R {
        f(&self.superblock.lock())
    }

    /// Mutate the in-memory superblock. Nothing is staged.
    pub fn update<R>(&self, f: impl FnOnce(&mut Superblock) -> R) -> R {
        f(&mut self.superblock.lock())
    }

    fn serialize(&self) -> Result<()> {
        let superblock = self.superblock.lock();
        self.block
            .with_bytes_mut(|bytes| superblock.serialize_into(bytes))
            .map_err(|e| MfsError::Format(format!("superblock serialization: {e}")))
    }

    /// Stage a write of the current superblock.
    pub fn stage(&self, work: &mut dyn PendingWork) -> Result<()> {
        self.serialize()?;
        work.enqueue_metadata(UnbufferedOperation {
            vmo: self.block.clone(),
            op: Operation::write(0, SUPERBLOCK_BLOCK, 1),
        });
        Ok(())
    }

    /// Write the current superblock directly, bypassing the write-back pipeline.
    ///
    /// Only valid while nothing else writes the device (format, mount).
    pub fn write_through(&self, handler: &dyn TransactionHandler) -> Result<()> {
        self.serialize()?;
        handler.run_requests(&[BufferedOperation {
            buffer: self.block.clone(),
            op: Operation::write(0, SUPERBLOCK_BLOCK, 1),
        }])?;
        handler.flush()
    }
}
