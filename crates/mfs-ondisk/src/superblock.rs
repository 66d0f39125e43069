//! Superblock record and region geometry.
//!
//! The superblock lives in device block 0. Besides identity and geometry it
//! carries the two pool counters (`alloc_block_count`, `alloc_inode_count`)
//! the allocators persist on every allocation and release. When the volume
//! is volume-manager backed (`FLAG_FVM`), each region starts on a fixed
//! stride and its size is a whole number of slices; growing a pool appends
//! slices to its region.

use crate::{BITS_PER_BLOCK, BLOCK_SIZE, INODE_SIZE, INODES_PER_BLOCK};
use mfs_types::{ParseError, ensure_slice, read_le_u32, read_le_u64, write_le_u32, write_le_u64};
use serde::{Deserialize, Serialize};

pub const MAGIC0: u64 = 0x0021_5346_6e69_4d21;
pub const MAGIC1: u64 = 0x3850_00d3_d3d3_d304;
pub const FORMAT_VERSION: u32 = 1;

/// Filesystem was unmounted cleanly.
pub const FLAG_CLEAN: u32 = 0x1;
/// Regions are backed by volume-manager slices.
pub const FLAG_FVM: u32 = 0x2;

/// Serialized superblock size; the rest of block 0 is zero.
pub const SUPERBLOCK_SIZE: usize = 88;

/// Region placement for a volume-manager backed filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FvmLayout {
    /// Blocks per volume-manager slice.
    pub slice_blocks: u32,
    /// Distance between region starts; bounds how far each metadata region can grow.
    pub region_stride_blocks: u32,
    /// Data slices allocated at format time.
    pub data_slices: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic0: u64,
    pub magic1: u64,
    pub version: u32,
    pub flags: u32,
    pub block_size: u32,
    pub inode_size: u32,
    /// Data pool size (blocks).
    pub block_count: u32,
    /// Inode pool size.
    pub inode_count: u32,
    pub alloc_block_count: u32,
    pub alloc_inode_count: u32,
    pub ibm_block: u32,
    pub abm_block: u32,
    pub ino_block: u32,
    pub dat_block: u32,
    /// Slice size in bytes; zero unless `FLAG_FVM`.
    pub slice_size: u64,
    pub ibm_slices: u32,
    pub abm_slices: u32,
    pub ino_slices: u32,
    pub dat_slices: u32,
}

fn div_ceil_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

fn to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl Superblock {
    fn blank() -> Self {
        Self {
            magic0: MAGIC0,
            magic1: MAGIC1,
            version: FORMAT_VERSION,
            flags: FLAG_CLEAN,
            block_size: BLOCK_SIZE,
            inode_size: INODE_SIZE as u32,
            block_count: 0,
            inode_count: 0,
            alloc_block_count: 0,
            alloc_inode_count: 0,
            ibm_block: 0,
            abm_block: 0,
            ino_block: 0,
            dat_block: 0,
            slice_size: 0,
            ibm_slices: 0,
            abm_slices: 0,
            ino_slices: 0,
            dat_slices: 0,
        }
    }

    /// Geometry for a plain device of `device_blocks` blocks.
    ///
    /// The data pool takes every block left after metadata, capped at
    /// `max_data_blocks` when given.
    pub fn for_device(
        device_blocks: u64,
        inode_count: u32,
        max_data_blocks: Option<u32>,
    ) -> Result<Self, ParseError> {
        if inode_count < 2 {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "need at least two inodes",
            });
        }
        let ibm_blocks = div_ceil_u64(u64::from(inode_count), BITS_PER_BLOCK);
        let ino_blocks = div_ceil_u64(u64::from(inode_count), u64::from(INODES_PER_BLOCK));
        let fixed = 1 + ibm_blocks + ino_blocks;
        let remaining = device_blocks.saturating_sub(fixed);
        let abm_blocks = div_ceil_u64(remaining, BITS_PER_BLOCK + 1).max(1);
        let mut data_blocks = remaining.saturating_sub(abm_blocks);
        if let Some(max) = max_data_blocks {
            data_blocks = data_blocks.min(u64::from(max));
        }
        if data_blocks < 2 {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "device too small for metadata and data",
            });
        }

        let mut sb = Self::blank();
        sb.ibm_block = 1;
        sb.abm_block = to_u32(1 + ibm_blocks, "abm_block")?;
        sb.ino_block = to_u32(u64::from(sb.abm_block) + abm_blocks, "ino_block")?;
        sb.dat_block = to_u32(u64::from(sb.ino_block) + ino_blocks, "dat_block")?;
        sb.block_count = to_u32(data_blocks, "block_count")?;
        sb.inode_count = inode_count;
        Ok(sb)
    }

    /// Geometry for a volume-manager backed device.
    ///
    /// Regions start at multiples of the stride; the inode pool is rounded
    /// up to fill its slices.
    pub fn for_fvm(layout: &FvmLayout, inode_count: u32) -> Result<Self, ParseError> {
        let slice = u64::from(layout.slice_blocks);
        let stride = u64::from(layout.region_stride_blocks);
        if slice == 0 || stride < slice || stride % slice != 0 || layout.data_slices == 0 {
            return Err(ParseError::InvalidField {
                field: "fvm_layout",
                reason: "stride must be a non-zero multiple of the slice size",
            });
        }
        if inode_count < 2 {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "need at least two inodes",
            });
        }

        let ino_slices = div_ceil_u64(
            div_ceil_u64(u64::from(inode_count), u64::from(INODES_PER_BLOCK)),
            slice,
        );
        let inodes = ino_slices * slice * u64::from(INODES_PER_BLOCK);
        let ibm_slices = div_ceil_u64(div_ceil_u64(inodes, BITS_PER_BLOCK), slice);
        let data_blocks = u64::from(layout.data_slices) * slice;
        let abm_slices = div_ceil_u64(div_ceil_u64(data_blocks, BITS_PER_BLOCK), slice);
        for slices in [ibm_slices, abm_slices, ino_slices] {
            if slices * slice > stride {
                return Err(ParseError::InvalidField {
                    field: "fvm_layout",
                    reason: "metadata region does not fit in stride",
                });
            }
        }

        let mut sb = Self::blank();
        sb.flags |= FLAG_FVM;
        sb.ibm_block = to_u32(stride, "ibm_block")?;
        sb.abm_block = to_u32(stride * 2, "abm_block")?;
        sb.ino_block = to_u32(stride * 3, "ino_block")?;
        sb.dat_block = to_u32(stride * 4, "dat_block")?;
        sb.slice_size = slice * u64::from(BLOCK_SIZE);
        sb.ibm_slices = to_u32(ibm_slices, "ibm_slices")?;
        sb.abm_slices = to_u32(abm_slices, "abm_slices")?;
        sb.ino_slices = to_u32(ino_slices, "ino_slices")?;
        sb.dat_slices = layout.data_slices;
        sb.block_count = to_u32(data_blocks, "block_count")?;
        sb.inode_count = to_u32(inodes, "inode_count")?;
        Ok(sb)
    }

    #[must_use]
    pub fn is_fvm(&self) -> bool {
        self.flags & FLAG_FVM != 0
    }

    /// Blocks per slice; zero when not volume-manager backed.
    #[must_use]
    pub fn slice_blocks(&self) -> u64 {
        self.slice_size / u64::from(BLOCK_SIZE)
    }

    fn region_blocks(&self, start: u32, next: u32, slices: u32) -> u64 {
        if self.is_fvm() {
            u64::from(slices) * self.slice_blocks()
        } else {
            u64::from(next.saturating_sub(start))
        }
    }

    #[must_use]
    pub fn inode_bitmap_blocks(&self) -> u64 {
        self.region_blocks(self.ibm_block, self.abm_block, self.ibm_slices)
    }

    #[must_use]
    pub fn block_bitmap_blocks(&self) -> u64 {
        self.region_blocks(self.abm_block, self.ino_block, self.abm_slices)
    }

    #[must_use]
    pub fn inode_table_blocks(&self) -> u64 {
        self.region_blocks(self.ino_block, self.dat_block, self.ino_slices)
    }

    /// Blocks each metadata region may grow to under `FLAG_FVM`.
    #[must_use]
    pub fn region_limit_blocks(&self) -> u64 {
        u64::from(self.abm_block.saturating_sub(self.ibm_block))
    }

    /// Device block backing data-pool index `index`.
    #[must_use]
    pub fn data_block(&self, index: u32) -> u64 {
        u64::from(self.dat_block) + u64::from(index)
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, SUPERBLOCK_SIZE)?;
        let magic0 = read_le_u64(block, 0)?;
        if magic0 != MAGIC0 {
            return Err(ParseError::InvalidMagic {
                expected: MAGIC0,
                actual: magic0,
            });
        }
        let magic1 = read_le_u64(block, 8)?;
        if magic1 != MAGIC1 {
            return Err(ParseError::InvalidMagic {
                expected: MAGIC1,
                actual: magic1,
            });
        }
        Ok(Self {
            magic0,
            magic1,
            version: read_le_u32(block, 16)?,
            flags: read_le_u32(block, 20)?,
            block_size: read_le_u32(block, 24)?,
            inode_size: read_le_u32(block, 28)?,
            block_count: read_le_u32(block, 32)?,
            inode_count: read_le_u32(block, 36)?,
            alloc_block_count: read_le_u32(block, 40)?,
            alloc_inode_count: read_le_u32(block, 44)?,
            ibm_block: read_le_u32(block, 48)?,
            abm_block: read_le_u32(block, 52)?,
            ino_block: read_le_u32(block, 56)?,
            dat_block: read_le_u32(block, 60)?,
            slice_size: read_le_u64(block, 64)?,
            ibm_slices: read_le_u32(block, 72)?,
            abm_slices: read_le_u32(block, 76)?,
            ino_slices: read_le_u32(block, 80)?,
            dat_slices: read_le_u32(block, 84)?,
        })
    }

    /// Serialize into `out`, zeroing everything past the record.
    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(out, 0, SUPERBLOCK_SIZE)?;
        out.fill(0);
        write_le_u64(out, 0, self.magic0)?;
        write_le_u64(out, 8, self.magic1)?;
        write_le_u32(out, 16, self.version)?;
        write_le_u32(out, 20, self.flags)?;
        write_le_u32(out, 24, self.block_size)?;
        write_le_u32(out, 28, self.inode_size)?;
        write_le_u32(out, 32, self.block_count)?;
        write_le_u32(out, 36, self.inode_count)?;
        write_le_u32(out, 40, self.alloc_block_count)?;
        write_le_u32(out, 44, self.alloc_inode_count)?;
        write_le_u32(out, 48, self.ibm_block)?;
        write_le_u32(out, 52, self.abm_block)?;
        write_le_u32(out, 56, self.ino_block)?;
        write_le_u32(out, 60, self.dat_block)?;
        write_le_u64(out, 64, self.slice_size)?;
        write_le_u32(out, 72, self.ibm_slices)?;
        write_le_u32(out, 76, self.abm_slices)?;
        write_le_u32(out, 80, self.ino_slices)?;
        write_le_u32(out, 84, self.dat_slices)?;
        Ok(())
    }

    /// Check geometry against itself and a device of `device_blocks` blocks.
    pub fn validate(&self, device_blocks: u64) -> Result<(), ParseError> {
        if self.version != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }
        if self.block_size != BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be 8192",
            });
        }
        if self.inode_size as usize != INODE_SIZE {
            return Err(ParseError::InvalidField {
                field: "inode_size",
                reason: "must be 256",
            });
        }
        if !(self.ibm_block > 0
            && self.ibm_block < self.abm_block
            && self.abm_block < self.ino_block
            && self.ino_block < self.dat_block)
        {
            return Err(ParseError::InvalidField {
                field: "region_start",
                reason: "regions must be ordered ibm < abm < ino < dat",
            });
        }
        if self.is_fvm() {
            let limit = self.region_limit_blocks();
            let slice = self.slice_blocks();
            if slice == 0
                || self.inode_bitmap_blocks() > limit
                || self.block_bitmap_blocks() > limit
                || self.inode_table_blocks() > limit
                || u64::from(self.dat_slices) * slice < u64::from(self.block_count)
            {
                return Err(ParseError::InvalidField {
                    field: "slices",
                    reason: "slice counts do not cover their regions",
                });
            }
        }
        if self.inode_bitmap_blocks() * BITS_PER_BLOCK < u64::from(self.inode_count)
            || self.inode_table_blocks() * u64::from(INODES_PER_BLOCK)
                < u64::from(self.inode_count)
        {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "inode regions too small",
            });
        }
        if self.block_bitmap_blocks() * BITS_PER_BLOCK < u64::from(self.block_count) {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "block bitmap too small",
            });
        }
        if self.alloc_block_count > self.block_count || self.alloc_inode_count > self.inode_count
        {
            return Err(ParseError::InvalidField {
                field: "alloc_count",
                reason: "allocated count exceeds pool size",
            });
        }
        if u64::from(self.dat_block) + u64::from(self.block_count) > device_blocks {
            return Err(ParseError::InvalidField {
                field: "blocks_count",
                reason: "data region extends past device end",
            });
        }
        Ok(())
    }
}
