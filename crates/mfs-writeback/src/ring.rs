//! Fixed-capacity ring of device blocks.
//!
//! Regions are claimed at the head and released from the tail in the same
//! order, so only `head` and `used` are tracked. An operation that crosses
//! the end of the ring is split in two.

use mfs_block::{BlockBuffer, BufferedOperation, Operation, OperationKind, UnbufferedOperation};
use mfs_error::{MfsError, Result};
use mfs_types::BlockSize;

#[derive(Debug)]
pub struct BlockRing {
    buffer: BlockBuffer,
    capacity: u64,
    head: u64,
    used: u64,
}

impl BlockRing {
    #[must_use]
    pub fn new(capacity_blocks: usize, block_size: BlockSize) -> Self {
        Self {
            buffer: BlockBuffer::new(capacity_blocks, block_size),
            capacity: capacity_blocks as u64,
            head: 0,
            used: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub fn free(&self) -> u64 {
        self.capacity - self.used
    }

    /// Copy every operation's payload into the ring.
    ///
    /// Returns the ring-backed operations in input order. Either all
    /// operations are staged or none: ranges are validated before any
    /// block is claimed.
    pub fn stage(&mut self, operations: &[UnbufferedOperation]) -> Result<Vec<BufferedOperation>> {
        let mut groups = self.stage_groups(&[operations])?;
        Ok(groups.pop().unwrap_or_default())
    }

    /// [`Self::stage`] over several lists at once, all or nothing.
    pub fn stage_groups(
        &mut self,
        groups: &[&[UnbufferedOperation]],
    ) -> Result<Vec<Vec<BufferedOperation>>> {
        let total: u64 = groups
            .iter()
            .flat_map(|g| g.iter())
            .map(|o| o.op.length)
            .sum();
        if total > self.free() {
            return Err(MfsError::InvalidArgument(format!(
                "{total} blocks do not fit in {} free ring blocks",
                self.free()
            )));
        }
        for operation in groups.iter().flat_map(|g| g.iter()) {
            if operation.op.kind != OperationKind::Write {
                return Err(MfsError::InvalidArgument(
                    "only writes can be staged for write-back".to_owned(),
                ));
            }
            let end = operation.op.vmo_offset.saturating_add(operation.op.length);
            if end > operation.vmo.block_count() as u64 {
                return Err(MfsError::OutOfRange {
                    index: end,
                    limit: operation.vmo.block_count() as u64,
                });
            }
        }

        let mut staged_groups = Vec::with_capacity(groups.len());
        for group in groups {
            let mut staged = Vec::with_capacity(group.len());
            for operation in *group {
                self.stage_one(operation, &mut staged)?;
            }
            staged_groups.push(staged);
        }
        Ok(staged_groups)
    }

    fn stage_one(
        &mut self,
        operation: &UnbufferedOperation,
        staged: &mut Vec<BufferedOperation>,
    ) -> Result<()> {
        let mut src = operation.op.vmo_offset;
        let mut dev = operation.op.dev_offset;
        let mut left = operation.op.length;
        while left > 0 {
            let chunk = left.min(self.capacity - self.head);
            #[expect(clippy::cast_possible_truncation)]
            self.buffer
                .copy_from(self.head as usize, &operation.vmo, src as usize, chunk as usize)?;
            staged.push(BufferedOperation {
                buffer: self.buffer.clone(),
                op: Operation::write(self.head, dev, chunk),
            });
            self.head = (self.head + chunk) % self.capacity;
            self.used += chunk;
            src += chunk;
            dev += chunk;
            left -= chunk;
        }
        Ok(())
    }

    /// Release the oldest `blocks` blocks.
    pub fn release(&mut self, blocks: u64) {
        debug_assert!(blocks <= self.used, "ring release exceeds usage");
        self.used = self.used.saturating_sub(blocks);
    }
}
