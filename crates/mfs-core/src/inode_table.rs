//! In-memory copy of the inode table.
//!
//! The whole table is read at mount. Updates serialize one record into the
//! shared buffer and stage a metadata write of the block holding it. When
//! the inode pool grows, the buffer grows with it; records in new blocks
//! start zeroed, i.e. free.

use mfs_alloc::SuperblockManager;
use mfs_block::{BlockBuffer, BufferedOperation, Operation, PendingWork, TransactionHandler, UnbufferedOperation};
use mfs_error::{MfsError, Result};
use mfs_ondisk::{INODE_SIZE, INODES_PER_BLOCK, Inode, parse_error_to_mfs};
use std::fmt;
use std::sync::Arc;

pub struct InodeTable {
    table: BlockBuffer,
    start_block: u64,
    superblock: Arc<SuperblockManager>,
}

impl InodeTable {
    /// Read every table block covering the current inode pool.
    pub fn open(handler: &dyn TransactionHandler, superblock: Arc<SuperblockManager>) -> Result<Self> {
        let sb = superblock.snapshot();
        let blocks = table_blocks(sb.inode_count);
        let table = BlockBuffer::new(blocks, handler.block_size());
        handler.run_requests(&[BufferedOperation {
            buffer: table.clone(),
            op: Operation::read(0, u64::from(sb.ino_block), blocks as u64),
        }])?;
        Ok(Self {
            table,
            start_block: u64::from(sb.ino_block),
            superblock,
        })
    }

    /// Inodes currently addressable.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.superblock.with(|sb| sb.inode_count)
    }

    fn locate(&self, ino: u32) -> Result<(usize, usize)> {
        let count = self.capacity();
        if ino >= count {
            return Err(MfsError::OutOfRange {
                index: u64::from(ino),
                limit: u64::from(count),
            });
        }
        self.table.grow(table_blocks(count));
        Ok((
            (ino / INODES_PER_BLOCK) as usize,
            (ino % INODES_PER_BLOCK) as usize * INODE_SIZE,
        ))
    }

    /// Copy of record `ino`.
    pub fn load(&self, ino: u32) -> Result<Inode> {
        let (block, offset) = self.locate(ino)?;
        let bytes = self.table.read_blocks(block, 1)?;
        Inode::parse(&bytes[offset..]).map_err(|e| parse_error_to_mfs(&e))
    }

    /// Replace record `ino` and stage the write of its table block.
    pub fn update(&self, work: &mut dyn PendingWork, ino: u32, inode: &Inode) -> Result<()> {
        let (block, offset) = self.locate(ino)?;
        self.table
            .with_block_mut(block, |bytes| inode.serialize_into(&mut bytes[offset..]))?
            .map_err(|e| parse_error_to_mfs(&e))?;
        work.enqueue_metadata(UnbufferedOperation {
            vmo: self.table.clone(),
            op: Operation::write(block as u64, self.start_block + block as u64, 1),
        });
        Ok(())
    }
}

fn table_blocks(inode_count: u32) -> usize {
    inode_count.div_ceil(INODES_PER_BLOCK).max(1) as usize
}

impl fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeTable")
            .field("start_block", &self.start_block)
            .field("blocks", &self.table.block_count())
            .finish_non_exhaustive()
    }
}
