//! Persistence adapter for one bitmap pool.
//!
//! The allocator never touches on-disk layout directly: it hands its
//! bitmap buffer to an [`AllocatorStorage`], which knows where the bitmap
//! region lives, which superblock counter tracks the pool, and how to grow
//! the pool through a [`VolumeManager`].
//!
//! # Logging
//!
//! - `mfs::storage` debug: growth refused (no volume manager, region full,
//!   slice budget exhausted).
//! - `mfs::storage` info: pool extended.

use crate::superblock::SuperblockManager;
use crate::volume::VolumeManager;
use mfs_block::{
    BlockBuffer, BufferedOperation, Operation, PendingWork, TransactionHandler,
    UnbufferedOperation,
};
use mfs_error::{MfsError, Result};
use mfs_ondisk::INODES_PER_BLOCK;
use mfs_types::BlockSize;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Which pool a storage adapter persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    Blocks,
    Inodes,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocks => f.write_str("blocks"),
            Self::Inodes => f.write_str("inodes"),
        }
    }
}

/// Bitmap blocks needed to describe `items` pool items.
#[must_use]
pub fn bitmap_blocks(items: u32, block_size: BlockSize) -> usize {
    let blocks = u64::from(items).div_ceil(block_size.bits_per_block()).max(1);
    usize::try_from(blocks).unwrap_or(usize::MAX)
}

pub trait AllocatorStorage: Send + Sync {
    fn pool_kind(&self) -> PoolKind;

    fn block_size(&self) -> BlockSize;

    /// Fill `bitmap` from the on-disk bitmap region.
    fn load(&self, bitmap: &BlockBuffer) -> Result<()>;

    /// Grow the pool. Calls `grow(new_total)` before the new range is
    /// persisted so the caller can resize its bitmap.
    fn extend(
        &self,
        work: &mut dyn PendingWork,
        bitmap: &BlockBuffer,
        grow: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<()>;

    fn pool_total(&self) -> u32;

    /// Items not yet marked allocated in the superblock counter.
    fn pool_available(&self) -> u32;

    /// Stage writes of every bitmap block covering `[index, index + count)`.
    fn persist_range(&self, work: &mut dyn PendingWork, bitmap: &BlockBuffer, index: u32, count: u32);

    /// Raise the allocated counter by `count` and stage the superblock.
    fn persist_allocate(&self, work: &mut dyn PendingWork, count: u32) -> Result<()>;

    /// Lower the allocated counter by `count` and stage the superblock.
    fn persist_release(&self, work: &mut dyn PendingWork, count: u32) -> Result<()>;
}

/// Superblock-backed storage for either pool.
pub struct PersistentStorage {
    kind: PoolKind,
    superblock: Arc<SuperblockManager>,
    handler: Arc<dyn TransactionHandler>,
    volume: Option<Arc<dyn VolumeManager>>,
}

impl PersistentStorage {
    #[must_use]
    pub fn new(
        kind: PoolKind,
        superblock: Arc<SuperblockManager>,
        handler: Arc<dyn TransactionHandler>,
        volume: Option<Arc<dyn VolumeManager>>,
    ) -> Self {
        Self {
            kind,
            superblock,
            handler,
            volume,
        }
    }

    fn bitmap_start(&self) -> u64 {
        self.superblock.with(|sb| match self.kind {
            PoolKind::Blocks => u64::from(sb.abm_block),
            PoolKind::Inodes => u64::from(sb.ibm_block),
        })
    }

    fn refuse(&self, reason: &'static str) -> MfsError {
        debug!(target: "mfs::storage", pool = %self.kind, reason, "pool growth refused");
        MfsError::NoSpace
    }
}

impl fmt::Debug for PersistentStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStorage")
            .field("kind", &self.kind)
            .field("volume_backed", &self.volume.is_some())
            .finish_non_exhaustive()
    }
}

impl AllocatorStorage for PersistentStorage {
    fn pool_kind(&self) -> PoolKind {
        self.kind
    }

    fn block_size(&self) -> BlockSize {
        self.handler.block_size()
    }

    fn load(&self, bitmap: &BlockBuffer) -> Result<()> {
        let blocks = bitmap_blocks(self.pool_total(), self.block_size());
        bitmap.grow(blocks);
        self.handler.run_requests(&[BufferedOperation {
            buffer: bitmap.clone(),
            op: Operation::read(0, self.bitmap_start(), blocks as u64),
        }])
    }

    fn extend(
        &self,
        work: &mut dyn PendingWork,
        bitmap: &BlockBuffer,
        grow: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        let Some(volume) = &self.volume else {
            return Err(self.refuse("not volume-manager backed"));
        };
        let sb = self.superblock.snapshot();
        let slice = sb.slice_blocks();
        if !sb.is_fvm() || slice == 0 {
            return Err(self.refuse("superblock has no slice layout"));
        }
        let limit_slices = sb.region_limit_blocks() / slice;

        let (pool_slices, items_per_slice, bitmap_slices, pool_start, bitmap_start, old_total) =
            match self.kind {
                PoolKind::Blocks => (
                    sb.dat_slices,
                    slice,
                    sb.abm_slices,
                    sb.dat_block,
                    sb.abm_block,
                    sb.block_count,
                ),
                PoolKind::Inodes => (
                    sb.ino_slices,
                    slice * u64::from(INODES_PER_BLOCK),
                    sb.ibm_slices,
                    sb.ino_block,
                    sb.ibm_block,
                    sb.inode_count,
                ),
            };
        if self.kind == PoolKind::Inodes && u64::from(pool_slices) + 1 > limit_slices {
            return Err(self.refuse("inode table region is full"));
        }
        let new_total = u32::try_from(u64::from(old_total) + items_per_slice)
            .map_err(|_| self.refuse("pool size would overflow"))?;

        let needed_bitmap = u64::from(new_total).div_ceil(self.block_size().bits_per_block());
        let have_bitmap = u64::from(bitmap_slices) * slice;
        let extra_bitmap_slices = needed_bitmap.saturating_sub(have_bitmap).div_ceil(slice);
        if u64::from(bitmap_slices) + extra_bitmap_slices > limit_slices {
            return Err(self.refuse("bitmap region is full"));
        }

        let info = volume.query()?;
        if info.free_slices() < 1 + extra_bitmap_slices {
            return Err(self.refuse("volume has no free slices"));
        }
        if extra_bitmap_slices > 0 {
            volume.extend(
                u64::from(bitmap_start) / slice + u64::from(bitmap_slices),
                extra_bitmap_slices,
            )?;
        }
        volume.extend(u64::from(pool_start) / slice + u64::from(pool_slices), 1)?;

        grow(new_total)?;
        #[expect(clippy::cast_possible_truncation)]
        let extra = extra_bitmap_slices as u32;
        self.superblock.update(|sb| match self.kind {
            PoolKind::Blocks => {
                sb.dat_slices += 1;
                sb.abm_slices += extra;
                sb.block_count = new_total;
            }
            PoolKind::Inodes => {
                sb.ino_slices += 1;
                sb.ibm_slices += extra;
                sb.inode_count = new_total;
            }
        });
        self.persist_range(work, bitmap, old_total, new_total - old_total);
        self.superblock.stage(work)?;
        info!(
            target: "mfs::storage",
            pool = %self.kind,
            old_total,
            new_total,
            bitmap_slices_added = extra_bitmap_slices,
            "pool extended"
        );
        Ok(())
    }

    fn pool_total(&self) -> u32 {
        self.superblock.with(|sb| match self.kind {
            PoolKind::Blocks => sb.block_count,
            PoolKind::Inodes => sb.inode_count,
        })
    }

    fn pool_available(&self) -> u32 {
        self.superblock.with(|sb| match self.kind {
            PoolKind::Blocks => sb.block_count.saturating_sub(sb.alloc_block_count),
            PoolKind::Inodes => sb.inode_count.saturating_sub(sb.alloc_inode_count),
        })
    }

    fn persist_range(&self, work: &mut dyn PendingWork, bitmap: &BlockBuffer, index: u32, count: u32) {
        if count == 0 {
            return;
        }
        let bits = self.block_size().bits_per_block();
        let first = u64::from(index) / bits;
        let last = (u64::from(index) + u64::from(count) - 1) / bits;
        work.enqueue_metadata(UnbufferedOperation {
            vmo: bitmap.clone(),
            op: Operation::write(first, self.bitmap_start() + first, last - first + 1),
        });
    }

    fn persist_allocate(&self, work: &mut dyn PendingWork, count: u32) -> Result<()> {
        let kind = self.kind;
        self.superblock.update(|sb| {
            let (allocated, total) = match kind {
                PoolKind::Blocks => (&mut sb.alloc_block_count, sb.block_count),
                PoolKind::Inodes => (&mut sb.alloc_inode_count, sb.inode_count),
            };
            match allocated.checked_add(count).filter(|n| *n <= total) {
                Some(n) => {
                    *allocated = n;
                    Ok(())
                }
                None => Err(MfsError::Corruption {
                    block: 0,
                    detail: format!("{kind} allocated counter would exceed pool size {total}"),
                }),
            }
        })?;
        self.superblock.stage(work)
    }

    fn persist_release(&self, work: &mut dyn PendingWork, count: u32) -> Result<()> {
        let kind = self.kind;
        self.superblock.update(|sb| {
            let allocated = match kind {
                PoolKind::Blocks => &mut sb.alloc_block_count,
                PoolKind::Inodes => &mut sb.alloc_inode_count,
            };
            match allocated.checked_sub(count) {
                Some(n) => {
                    *allocated = n;
                    Ok(())
                }
                None => Err(MfsError::Corruption {
                    block: 0,
                    detail: format!("{kind} allocated counter would underflow"),
                }),
            }
        })?;
        self.superblock.stage(work)
    }
}
