#![forbid(unsafe_code)]
//! MinFS public API facade.
//!
//! Re-exports the filesystem core from `mfs-core` as the one crate
//! downstream consumers depend on.

pub use mfs_core::*;
