#![forbid(unsafe_code)]
//! On-disk format for MinFS.
//!
//! Pure parsing crate: no I/O. Layout constants, the [`Superblock`] and
//! [`Inode`] records with parse/serialize, and the arithmetic that places a
//! logical file block in the direct / indirect / doubly-indirect tree.
//!
//! | Region | Contents |
//! |--------|----------|
//! | block 0 | superblock |
//! | `ibm_block..` | inode bitmap, one bit per inode |
//! | `abm_block..` | block bitmap, one bit per data block |
//! | `ino_block..` | inode table, [`INODES_PER_BLOCK`] records per block |
//! | `dat_block..` | data blocks; bitmap index `i` is device block `dat_block + i` |

pub mod inode;
pub mod superblock;

pub use inode::Inode;
pub use superblock::{FLAG_CLEAN, FLAG_FVM, FvmLayout, Superblock};

use mfs_error::MfsError;
use mfs_types::{ParseError, read_le_u32, write_le_u32};

/// Filesystem block size in bytes.
pub const BLOCK_SIZE: u32 = 8192;
/// On-disk inode record size in bytes.
pub const INODE_SIZE: usize = 256;
/// Inode records per inode-table block.
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE as u32;
/// Bitmap bits per bitmap block.
pub const BITS_PER_BLOCK: u64 = BLOCK_SIZE as u64 * 8;

/// Direct pointer slots per inode.
pub const DIRECT: usize = 16;
/// Indirect pointer slots per inode.
pub const INDIRECT: usize = 31;
/// Doubly-indirect pointer slots per inode.
pub const DOUBLY_INDIRECT: usize = 1;
/// `u32` block pointers per indirect block.
pub const POINTERS_PER_BLOCK: u64 = BLOCK_SIZE as u64 / 4;

/// Largest number of logical blocks a file can address.
pub const MAX_FILE_BLOCKS: u64 = DIRECT as u64
    + INDIRECT as u64 * POINTERS_PER_BLOCK
    + DOUBLY_INDIRECT as u64 * POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;

/// Where a logical file block lives in the address tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPosition {
    /// `inode.dnum[slot]`.
    Direct { slot: usize },
    /// `inode.inum[slot]` -> `entry`.
    Indirect { slot: usize, entry: usize },
    /// `inode.dinum[slot]` -> `indirect` -> `entry`.
    DoublyIndirect {
        slot: usize,
        indirect: usize,
        entry: usize,
    },
}

impl BlockPosition {
    /// Place logical block `index`; `None` when it is beyond [`MAX_FILE_BLOCKS`].
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn locate(index: u64) -> Option<Self> {
        if index < DIRECT as u64 {
            return Some(Self::Direct {
                slot: index as usize,
            });
        }
        let rest = index - DIRECT as u64;
        if rest < INDIRECT as u64 * POINTERS_PER_BLOCK {
            return Some(Self::Indirect {
                slot: (rest / POINTERS_PER_BLOCK) as usize,
                entry: (rest % POINTERS_PER_BLOCK) as usize,
            });
        }
        let rest = rest - INDIRECT as u64 * POINTERS_PER_BLOCK;
        let per_slot = POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;
        if rest < DOUBLY_INDIRECT as u64 * per_slot {
            let within = rest % per_slot;
            return Some(Self::DoublyIndirect {
                slot: (rest / per_slot) as usize,
                indirect: (within / POINTERS_PER_BLOCK) as usize,
                entry: (within % POINTERS_PER_BLOCK) as usize,
            });
        }
        None
    }

    /// First logical block of the leaf pointer array holding this position.
    #[must_use]
    pub fn leaf_group_start(index: u64) -> u64 {
        if index < DIRECT as u64 {
            return 0;
        }
        let rest = index - DIRECT as u64;
        DIRECT as u64 + rest - rest % POINTERS_PER_BLOCK
    }
}

/// Read pointer `entry` from an indirect block payload.
pub fn read_pointer(block: &[u8], entry: usize) -> Result<u32, ParseError> {
    read_le_u32(block, entry * 4)
}

/// Write pointer `entry` into an indirect block payload.
pub fn write_pointer(block: &mut [u8], entry: usize, value: u32) -> Result<(), ParseError> {
    write_le_u32(block, entry * 4, value)
}

/// `true` when every pointer in the block is zero.
#[must_use]
pub fn pointers_all_zero(block: &[u8]) -> bool {
    block.iter().all(|b| *b == 0)
}

/// Convert a parse failure into the user-facing error.
#[must_use]
pub fn parse_error_to_mfs(e: &ParseError) -> MfsError {
    match e {
        ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. } => {
            MfsError::Format(e.to_string())
        }
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            MfsError::Corruption {
                block: 0,
                detail: e.to_string(),
            }
        }
    }
}
