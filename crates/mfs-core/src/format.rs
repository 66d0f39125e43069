//! Writing an empty filesystem.
//!
//! Regions are written before the superblock so that a device whose
//! format was interrupted never carries a valid superblock over garbage
//! metadata.

use crate::options::FormatOptions;
use mfs_alloc::{SuperblockManager, bitmap_blocks, bitmap_set};
use mfs_block::{BlockBuffer, BufferedOperation, Operation, TransactionHandler};
use mfs_error::{MfsError, Result};
use mfs_ondisk::{BLOCK_SIZE, Superblock, parse_error_to_mfs};
use tracing::info;

/// Pool index reserved in both pools so that a zero pointer means "none".
pub const RESERVED_INDEX: u32 = 0;

/// Format the device behind `handler` and return the written superblock.
pub fn format(handler: &dyn TransactionHandler, options: &FormatOptions) -> Result<Superblock> {
    if handler.block_size().get() != BLOCK_SIZE {
        return Err(MfsError::InvalidArgument(format!(
            "device block size {} is not {BLOCK_SIZE}",
            handler.block_size()
        )));
    }
    let mut superblock = match &options.fvm {
        Some(layout) => Superblock::for_fvm(layout, options.inode_count),
        None => Superblock::for_device(handler.block_count(), options.inode_count, options.block_count),
    }
    .map_err(|e| parse_error_to_mfs(&e))?;
    superblock.alloc_block_count = 1;
    superblock.alloc_inode_count = 1;
    superblock
        .validate(handler.block_count())
        .map_err(|e| parse_error_to_mfs(&e))?;

    write_bitmap(
        handler,
        u64::from(superblock.ibm_block),
        superblock.inode_bitmap_blocks(),
        superblock.inode_count,
    )?;
    write_bitmap(
        handler,
        u64::from(superblock.abm_block),
        superblock.block_bitmap_blocks(),
        superblock.block_count,
    )?;
    let table_blocks = superblock.inode_table_blocks();
    zero_region(handler, u64::from(superblock.ino_block), table_blocks)?;
    handler.flush()?;

    SuperblockManager::new(superblock.clone(), handler).write_through(handler)?;
    info!(
        target: "mfs::mount",
        blocks = superblock.block_count,
        inodes = superblock.inode_count,
        data_start = superblock.dat_block,
        fvm = superblock.is_fvm(),
        "formatted"
    );
    Ok(superblock)
}

fn region_buffer(handler: &dyn TransactionHandler, blocks: u64) -> Result<BlockBuffer> {
    let blocks = usize::try_from(blocks)
        .map_err(|_| MfsError::InvalidArgument(format!("region of {blocks} blocks")))?;
    Ok(BlockBuffer::new(blocks, handler.block_size()))
}

fn write_region(handler: &dyn TransactionHandler, buffer: &BlockBuffer, start: u64) -> Result<()> {
    handler.run_requests(&[BufferedOperation {
        buffer: buffer.clone(),
        op: Operation::write(0, start, buffer.block_count() as u64),
    }])
}

fn write_bitmap(
    handler: &dyn TransactionHandler,
    start: u64,
    region_blocks: u64,
    items: u32,
) -> Result<()> {
    let blocks = region_blocks.max(bitmap_blocks(items, handler.block_size()) as u64);
    let bitmap = region_buffer(handler, blocks)?;
    bitmap.with_bytes_mut(|bytes| bitmap_set(bytes, RESERVED_INDEX));
    write_region(handler, &bitmap, start)
}

fn zero_region(handler: &dyn TransactionHandler, start: u64, blocks: u64) -> Result<()> {
    if blocks == 0 {
        return Ok(());
    }
    write_region(handler, &region_buffer(handler, blocks)?, start)
}
