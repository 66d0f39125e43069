#![forbid(unsafe_code)]
//! MinFS filesystem core.
//!
//! | Module | Role |
//! |--------|------|
//! | [`options`] | mount, format and assigner configuration |
//! | [`format`] | writing an empty filesystem |
//! | [`inode_table`] | in-memory inode table with staged updates |
//! | [`transaction`] | reservations plus staged writes, committed as one unit |
//! | [`tree`] | logical-to-physical block mapping per file |
//! | [`assigner`] | deferred data-block assignment worker |
//! | [`vnode`] | open files: page cache, reads, writes, truncation |
//! | [`fs`] | [`Minfs`]: mount, vnode lifecycle, sync, unmount |
//!
//! # Logging
//!
//! Targets used by this crate and the crates under it:
//!
//! | Target | Emitted by |
//! |--------|-----------|
//! | `mfs::alloc` | block and inode allocators |
//! | `mfs::storage` | allocator storage, transaction handler |
//! | `mfs::tree` | block-address tree |
//! | `mfs::txn` | transactions |
//! | `mfs::writeback` | write-back pipeline |
//! | `mfs::assigner` | data-block assigner |
//! | `mfs::vnode` | vnode lifecycle |
//! | `mfs::mount` | format, mount, unmount |

pub mod assigner;
pub mod format;
pub mod fs;
pub mod inode_table;
pub mod options;
pub mod transaction;
pub mod tree;
pub mod vnode;

pub use assigner::{AllocationTarget, AssignerState, AssignerStats, DataBlockAssigner};
pub use format::{RESERVED_INDEX, format};
pub use fs::Minfs;
pub use inode_table::InodeTable;
pub use options::{AssignerConfig, FormatOptions, MountOptions};
pub use transaction::Transaction;
pub use tree::{BlockAddressTree, IndirectCache, TreeMode};
pub use vnode::Vnode;

pub use mfs_alloc::{AllocatorStats, SliceBudgetVolume, VolumeManager};
pub use mfs_block::{
    ByteBlockDevice, DeviceTransactionHandler, FileByteDevice, MemoryByteDevice, TransactionHandler,
};
pub use mfs_error::{MfsError, Result};
pub use mfs_ondisk::{BLOCK_SIZE, FvmLayout, Inode, MAX_FILE_BLOCKS, Superblock};
pub use mfs_writeback::{PipelineState, PipelineStats, WritebackConfig};

#[cfg(test)]
pub(crate) mod testing {
    use crate::{FormatOptions, Minfs, MountOptions, format};
    use mfs_block::{ByteBlockDevice, DeviceTransactionHandler, MemoryByteDevice, TransactionHandler};
    use mfs_ondisk::BLOCK_SIZE;
    use std::sync::Arc;

    pub(crate) fn handler(blocks: usize) -> Arc<dyn TransactionHandler> {
        let mem = MemoryByteDevice::new(blocks * BLOCK_SIZE as usize);
        let dev = ByteBlockDevice::new(mem, BLOCK_SIZE).expect("device");
        Arc::new(DeviceTransactionHandler::new(dev).expect("handler"))
    }

    /// A freshly formatted 64-inode filesystem on a memory device.
    pub(crate) fn mounted(blocks: usize, options: MountOptions) -> Arc<Minfs> {
        let handler = handler(blocks);
        format(
            handler.as_ref(),
            &FormatOptions {
                inode_count: 64,
                ..FormatOptions::default()
            },
        )
        .expect("format");
        Minfs::mount(handler, options, None).expect("mount")
    }
}
