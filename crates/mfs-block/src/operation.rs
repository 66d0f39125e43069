//! Block operation descriptions staged by transactions.
//!
//! All offsets and lengths are in filesystem blocks. An
//! [`UnbufferedOperation`] still points at its source [`BlockBuffer`]; the
//! write-back pipeline copies the bytes into its ring and turns it into a
//! [`BufferedOperation`] that the [`crate::TransactionHandler`] executes.

use crate::BlockBuffer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Read,
    Write,
}

/// One contiguous block range transfer between a buffer and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// First block within the source/destination buffer.
    pub vmo_offset: u64,
    /// First device block.
    pub dev_offset: u64,
    /// Number of blocks.
    pub length: u64,
}

impl Operation {
    #[must_use]
    pub fn write(vmo_offset: u64, dev_offset: u64, length: u64) -> Self {
        Self {
            kind: OperationKind::Write,
            vmo_offset,
            dev_offset,
            length,
        }
    }

    #[must_use]
    pub fn read(vmo_offset: u64, dev_offset: u64, length: u64) -> Self {
        Self {
            kind: OperationKind::Read,
            vmo_offset,
            dev_offset,
            length,
        }
    }

    /// Both operations move the same buffer block to the same device block.
    fn same_mapping(&self, other: &Self) -> bool {
        self.kind == other.kind
            && i128::from(self.vmo_offset) - i128::from(self.dev_offset)
                == i128::from(other.vmo_offset) - i128::from(other.dev_offset)
    }

    /// Union of two mapping-compatible ranges if they overlap or touch.
    fn try_union(&self, other: &Self) -> Option<Self> {
        if !self.same_mapping(other) {
            return None;
        }
        let start = self.dev_offset.min(other.dev_offset);
        let end = (self.dev_offset + self.length).max(other.dev_offset + other.length);
        let touching = self.dev_offset <= other.dev_offset + other.length
            && other.dev_offset <= self.dev_offset + self.length;
        touching.then(|| Self {
            kind: self.kind,
            vmo_offset: self.vmo_offset.min(other.vmo_offset),
            dev_offset: start,
            length: end - start,
        })
    }
}

/// Operation paired with the caller buffer it reads from or writes into.
#[derive(Debug, Clone)]
pub struct UnbufferedOperation {
    pub vmo: BlockBuffer,
    pub op: Operation,
}

/// Operation whose payload lives in a pipeline-owned buffer (the ring).
#[derive(Debug, Clone)]
pub struct BufferedOperation {
    pub buffer: BlockBuffer,
    pub op: Operation,
}

/// Sink for staged operations.
///
/// Implemented by transactions; allocator storage and the address tree
/// stage their writes through it without knowing who collects them.
pub trait PendingWork {
    fn enqueue_metadata(&mut self, operation: UnbufferedOperation);
    fn enqueue_data(&mut self, operation: UnbufferedOperation);
}

/// Two ordered operation lists: data first, then metadata.
///
/// Metadata writes of the same buffer blocks to the same device blocks are
/// merged, so touching one bitmap block twice in a transaction writes it
/// once. Data operations are kept as given.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    metadata: Vec<UnbufferedOperation>,
    data: Vec<UnbufferedOperation>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn metadata(&self) -> &[UnbufferedOperation] {
        &self.metadata
    }

    #[must_use]
    pub fn data(&self) -> &[UnbufferedOperation] {
        &self.data
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.data.is_empty()
    }

    /// Total blocks across both lists.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.metadata
            .iter()
            .chain(&self.data)
            .map(|o| o.op.length)
            .sum()
    }

    /// Consume into `(data, metadata)`.
    #[must_use]
    pub fn into_parts(self) -> (Vec<UnbufferedOperation>, Vec<UnbufferedOperation>) {
        (self.data, self.metadata)
    }
}

impl PendingWork for WriteBatch {
    fn enqueue_metadata(&mut self, operation: UnbufferedOperation) {
        if operation.op.length == 0 {
            return;
        }
        for existing in &mut self.metadata {
            if !existing.vmo.same_buffer(&operation.vmo) {
                continue;
            }
            if let Some(merged) = existing.op.try_union(&operation.op) {
                existing.op = merged;
                return;
            }
        }
        self.metadata.push(operation);
    }

    fn enqueue_data(&mut self, operation: UnbufferedOperation) {
        if operation.op.length == 0 {
            return;
        }
        self.data.push(operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_types::BlockSize;

    fn buffer() -> BlockBuffer {
        BlockBuffer::new(8, BlockSize::new(512).expect("block size"))
    }

    #[test]
    fn duplicate_metadata_write_is_merged() {
        let bitmap = buffer();
        let mut batch = WriteBatch::new();
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: bitmap.clone(),
            op: Operation::write(1, 11, 1),
        });
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: bitmap.clone(),
            op: Operation::write(1, 11, 1),
        });
        assert_eq!(batch.metadata().len(), 1);
        assert_eq!(batch.block_count(), 1);
    }

    #[test]
    fn adjacent_metadata_writes_coalesce() {
        let bitmap = buffer();
        let mut batch = WriteBatch::new();
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: bitmap.clone(),
            op: Operation::write(2, 12, 1),
        });
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: bitmap,
            op: Operation::write(3, 13, 2),
        });
        assert_eq!(batch.metadata().len(), 1);
        assert_eq!(batch.metadata()[0].op, Operation::write(2, 12, 3));
    }

    #[test]
    fn different_buffers_or_mappings_stay_separate() {
        let a = buffer();
        let b = buffer();
        let mut batch = WriteBatch::new();
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: a.clone(),
            op: Operation::write(0, 10, 1),
        });
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: b,
            op: Operation::write(0, 10, 1),
        });
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: a,
            op: Operation::write(1, 20, 1),
        });
        assert_eq!(batch.metadata().len(), 3);
    }

    #[test]
    fn data_is_kept_in_order_and_split_out_first() {
        let page = buffer();
        let mut batch = WriteBatch::new();
        batch.enqueue_data(UnbufferedOperation {
            vmo: page.clone(),
            op: Operation::write(0, 40, 1),
        });
        batch.enqueue_data(UnbufferedOperation {
            vmo: page.clone(),
            op: Operation::write(0, 40, 1),
        });
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: page,
            op: Operation::write(4, 4, 0),
        });
        let (data, metadata) = batch.into_parts();
        assert_eq!(data.len(), 2);
        assert!(metadata.is_empty());
    }
}
