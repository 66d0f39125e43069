//! Mount and format configuration.

use mfs_ondisk::FvmLayout;
use mfs_writeback::WritebackConfig;
use serde::{Deserialize, Serialize};

/// Data-block assigner configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignerConfig {
    /// Tasks the assigner queue holds before producers block.
    /// Default: 64.
    pub queue_depth: usize,
    /// Upper bound on blocks resolved per transaction.
    /// Default: 256.
    pub max_chunk_blocks: u64,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            max_chunk_blocks: 256,
        }
    }
}

/// Options for [`crate::Minfs::mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub writeback: WritebackConfig,
    pub assigner: AssignerConfig,
    /// Defer data-block allocation to the background assigner.
    /// Default: true.
    pub dirty_cache_enabled: bool,
    /// Refuse every mutation; no worker threads are started.
    /// Default: false.
    pub readonly: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            writeback: WritebackConfig::default(),
            assigner: AssignerConfig::default(),
            dirty_cache_enabled: true,
            readonly: false,
        }
    }
}

/// Options for [`crate::format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Cap on the data pool; `None` uses every block left after metadata.
    /// Ignored when `fvm` is set.
    pub block_count: Option<u32>,
    /// Inodes to provision (rounded up to whole slices under `fvm`).
    /// Default: 1024.
    pub inode_count: u32,
    /// Lay the filesystem out on volume-manager slices.
    pub fvm: Option<FvmLayout>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_count: None,
            inode_count: 1024,
            fvm: None,
        }
    }
}
