//! Volume-manager collaborator.
//!
//! A volume manager hands out fixed-size slices of backing storage at
//! virtual slice offsets. The allocator storage asks it for more slices
//! when a pool runs out of free items.

use mfs_error::{MfsError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    /// Slice size in bytes.
    pub slice_size: u64,
    /// Slices currently assigned to this volume.
    pub assigned_slices: u64,
    /// Slices this volume may ever hold.
    pub total_slices: u64,
}

impl VolumeInfo {
    #[must_use]
    pub fn free_slices(&self) -> u64 {
        self.total_slices.saturating_sub(self.assigned_slices)
    }
}

pub trait VolumeManager: Send + Sync {
    /// Slice size in bytes.
    fn slice_size(&self) -> u64;

    /// Assign `count` slices starting at virtual slice `offset_slices`.
    fn extend(&self, offset_slices: u64, count: u64) -> Result<()>;

    fn query(&self) -> Result<VolumeInfo>;
}

/// Volume manager that tracks slice assignment against a fixed budget.
///
/// Suitable for hosts where the backing device is already large enough to
/// cover every virtual slice and growth only has to be accounted.
#[derive(Debug)]
pub struct SliceBudgetVolume {
    slice_size: u64,
    total_slices: u64,
    state: Mutex<SliceBudgetState>,
}

#[derive(Debug, Default)]
struct SliceBudgetState {
    assigned: u64,
    extents: Vec<(u64, u64)>,
}

impl SliceBudgetVolume {
    #[must_use]
    pub fn new(slice_size: u64, assigned_slices: u64, total_slices: u64) -> Self {
        Self {
            slice_size,
            total_slices,
            state: Mutex::new(SliceBudgetState {
                assigned: assigned_slices,
                extents: Vec::new(),
            }),
        }
    }

    /// `(offset_slices, count)` of every successful extend, in call order.
    #[must_use]
    pub fn extents(&self) -> Vec<(u64, u64)> {
        self.state.lock().extents.clone()
    }
}

impl VolumeManager for SliceBudgetVolume {
    fn slice_size(&self) -> u64 {
        self.slice_size
    }

    fn extend(&self, offset_slices: u64, count: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.assigned.saturating_add(count) > self.total_slices {
            debug!(
                target: "mfs::storage",
                offset_slices,
                count,
                assigned = state.assigned,
                total = self.total_slices,
                "slice budget exhausted"
            );
            return Err(MfsError::NoSpace);
        }
        state.assigned += count;
        state.extents.push((offset_slices, count));
        drop(state);
        Ok(())
    }

    fn query(&self) -> Result<VolumeInfo> {
        Ok(VolumeInfo {
            slice_size: self.slice_size,
            assigned_slices: self.state.lock().assigned,
            total_slices: self.total_slices,
        })
    }
}
