#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on allocation bitmaps ([`bitmap`]).
//! 2. **Storage**: where a pool's bitmap and counters live on disk and how
//!    the pool grows ([`AllocatorStorage`], [`PersistentStorage`],
//!    [`SuperblockManager`], [`VolumeManager`]).
//! 3. **Allocator**: reservation accounting, first-free search and
//!    copy-on-write swap staging ([`BlockAllocator`], [`Reservation`]).
//!
//! The same allocator serves both pools; only the storage adapter differs.

pub mod allocator;
pub mod bitmap;
pub mod storage;
pub mod superblock;
pub mod volume;

pub use allocator::{AllocatorStats, BlockAllocator, Reservation};
pub use bitmap::{bitmap_clear, bitmap_count_set, bitmap_find_free_from, bitmap_get, bitmap_set};
pub use storage::{AllocatorStorage, PersistentStorage, PoolKind, bitmap_blocks};
pub use superblock::{SUPERBLOCK_BLOCK, SuperblockManager};
pub use volume::{SliceBudgetVolume, VolumeInfo, VolumeManager};
