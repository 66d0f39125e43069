//! Shared, block-granular in-memory buffers.
//!
//! A [`BlockBuffer`] is the unit every staged operation points at: bitmaps,
//! the inode table, indirect blocks, file pages and the write-back ring are
//! all block buffers. Clones share storage; bytes are copied out only when
//! the write-back pipeline takes ownership of a transaction's operations.

use mfs_error::{MfsError, Result};
use mfs_types::BlockSize;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct BlockBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
    block_size: BlockSize,
}

impl BlockBuffer {
    /// Zero-filled buffer of `block_count` blocks.
    #[must_use]
    pub fn new(block_count: usize, block_size: BlockSize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0_u8; block_count * block_size.bytes()])),
            block_size,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.bytes.read().len() / self.block_size.bytes()
    }

    /// `true` when both handles share the same storage.
    #[must_use]
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    /// Zero-extend to at least `block_count` blocks. Never shrinks.
    pub fn grow(&self, block_count: usize) {
        let wanted = block_count * self.block_size.bytes();
        let mut bytes = self.bytes.write();
        if bytes.len() < wanted {
            bytes.resize(wanted, 0);
        }
    }

    /// Run `f` over the whole buffer with shared access.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read())
    }

    /// Run `f` over the whole buffer with exclusive access.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.write())
    }

    /// Run `f` over one block with exclusive access.
    pub fn with_block_mut<R>(&self, block: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let bs = self.block_size.bytes();
        let mut bytes = self.bytes.write();
        let range = block_range(block, 1, bs, bytes.len())?;
        Ok(f(&mut bytes[range]))
    }

    /// Copy `count` blocks starting at `start` into a fresh vector.
    pub fn read_blocks(&self, start: usize, count: usize) -> Result<Vec<u8>> {
        let bs = self.block_size.bytes();
        let bytes = self.bytes.read();
        let range = block_range(start, count, bs, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    /// Overwrite blocks starting at `start` with `src` (a whole number of blocks).
    pub fn write_blocks(&self, start: usize, src: &[u8]) -> Result<()> {
        let bs = self.block_size.bytes();
        if src.len() % bs != 0 {
            return Err(MfsError::InvalidArgument(format!(
                "source length {} is not a multiple of block size {bs}",
                src.len()
            )));
        }
        let mut bytes = self.bytes.write();
        let range = block_range(start, src.len() / bs, bs, bytes.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }

    /// Copy `count` blocks from `src` at `src_start` into this buffer at `dst_start`.
    pub fn copy_from(
        &self,
        dst_start: usize,
        src: &Self,
        src_start: usize,
        count: usize,
    ) -> Result<()> {
        if self.same_buffer(src) {
            let bs = self.block_size.bytes();
            let mut bytes = self.bytes.write();
            let from = block_range(src_start, count, bs, bytes.len())?;
            let to = block_range(dst_start, count, bs, bytes.len())?;
            bytes.copy_within(from, to.start);
            return Ok(());
        }
        let data = src.read_blocks(src_start, count)?;
        self.write_blocks(dst_start, &data)
    }

    /// Zero `count` blocks starting at `start`.
    pub fn zero_blocks(&self, start: usize, count: usize) -> Result<()> {
        let bs = self.block_size.bytes();
        let mut bytes = self.bytes.write();
        let range = block_range(start, count, bs, bytes.len())?;
        bytes[range].fill(0);
        Ok(())
    }
}

fn block_range(
    start: usize,
    count: usize,
    block_size: usize,
    len: usize,
) -> Result<std::ops::Range<usize>> {
    let begin = start.checked_mul(block_size);
    let end = start
        .checked_add(count)
        .and_then(|end| end.checked_mul(block_size));
    match (begin, end) {
        (Some(begin), Some(end)) if end <= len => Ok(begin..end),
        _ => Err(MfsError::OutOfRange {
            index: (start + count) as u64,
            limit: (len / block_size) as u64,
        }),
    }
}

impl fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("block_size", &self.block_size.get())
            .field("block_count", &self.block_count())
            .finish_non_exhaustive()
    }
}
