#![forbid(unsafe_code)]
//! Error types for the MinFS space manager.
//!
//! # Error Taxonomy
//!
//! | Kind | `MfsError` Variant | errno | Raised by |
//! |------|--------------------|-------|-----------|
//! | Resource exhausted | `NoSpace` | `ENOSPC` | `Reserve`, `Extend`, transaction creation |
//! | Bad state | `BadState` | `EBADF` | double start, enqueue after unmount, reservation misuse |
//! | Bad state (degraded) | `ReadOnly` | `EROFS` | any mutation after the write-back pipeline failed |
//! | I/O | `Io` | raw errno or `EIO` | device reads and writes |
//! | I/O (deferred) | `WritebackFailed` | `EIO` | completion of work the pipeline could not persist |
//! | Invalid argument | `InvalidArgument` | `EINVAL` | bad counts, oversized work |
//! | Out of range | `OutOfRange` | `EFBIG` | logical index beyond the address tree |
//! | Corruption | `Corruption` | `EIO` | double free, bitmap/counter mismatch |
//! | Format | `Format` | `EINVAL` | bad superblock, geometry mismatch |
//! | Not found | `NotFound` | `ENOENT` | unallocated inode |
//!
//! Invariant violations that would corrupt bitmap accounting (allocating
//! from an exhausted reservation, finding no free bit while a reservation
//! is outstanding) are not represented here: they panic.
//!
//! ## Design Constraints
//!
//! - `mfs-error` MUST NOT depend on `mfs-types` or `mfs-ondisk`. Parse
//!   errors convert into `MfsError` at the `mfs-ondisk` boundary.
//! - All string payloads are owned so errors can cross the write-back
//!   worker thread boundary.

use thiserror::Error;

/// Unified error type for all MinFS space-manager operations.
#[derive(Debug, Error)]
pub enum MfsError {
    /// Operating system or device I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Work reached the write-back pipeline but could not be persisted.
    ///
    /// Reported to completion callbacks; the pipeline is read-only after
    /// the first such failure.
    #[error("write-back failed: {0}")]
    WritebackFailed(String),

    /// On-disk metadata inconsistency detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (bad magic, geometry that does not fit the device).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// No free blocks or inodes, and the pool cannot grow.
    #[error("no space left on device")]
    NoSpace,

    /// The operation is not valid in the current lifecycle state.
    #[error("bad state: {0}")]
    BadState(String),

    /// The filesystem has been degraded to read-only after an I/O failure.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Logical index beyond the maximum the address tree can map.
    #[error("index {index} out of range (limit {limit})")]
    OutOfRange { index: u64, limit: u64 },

    /// Named object (inode) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl MfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: adding a variant without assigning an
    /// errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::WritebackFailed(_) | Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::BadState(_) => libc::EBADF,
            Self::ReadOnly => libc::EROFS,
            Self::OutOfRange { .. } => libc::EFBIG,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// Whether this error means the filesystem can no longer accept writes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReadOnly | Self::WritebackFailed(_))
    }

    /// Produce an owned copy suitable for fanning one outcome out to
    /// several completion callbacks. `Io` collapses to its message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::WritebackFailed(msg) => Self::WritebackFailed(msg.clone()),
            Self::Corruption { block, detail } => Self::Corruption {
                block: *block,
                detail: detail.clone(),
            },
            Self::Format(msg) => Self::Format(msg.clone()),
            Self::NoSpace => Self::NoSpace,
            Self::BadState(msg) => Self::BadState(msg.clone()),
            Self::ReadOnly => Self::ReadOnly,
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::OutOfRange { index, limit } => Self::OutOfRange {
                index: *index,
                limit: *limit,
            },
            Self::NotFound(msg) => Self::NotFound(msg.clone()),
        }
    }
}

/// Result alias using `MfsError`.
pub type Result<T> = std::result::Result<T, MfsError>;
