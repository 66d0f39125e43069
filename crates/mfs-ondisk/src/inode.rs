//! On-disk inode record.
//!
//! ```text
//! 0   magic        u32     4   link_count   u32
//! 8   size         u64     16  block_count  u32
//! 20  seq_num      u32     24  create_time  u64
//! 32  modify_time  u64     40  generation   u32
//! 44  reserved to 64
//! 64  dnum[16]     u32     128 inum[31]     u32
//! 252 dinum[1]     u32
//! ```

use crate::{DIRECT, DOUBLY_INDIRECT, INDIRECT, INODE_SIZE};
use mfs_types::{ParseError, ensure_slice, read_le_u32, read_le_u64, write_le_u32, write_le_u64};
use serde::{Deserialize, Serialize};

/// Magic of an allocated file inode. A zeroed record is a free slot.
pub const INODE_MAGIC: u32 = 0x6D66_696C;

const DNUM_OFFSET: usize = 64;
const INUM_OFFSET: usize = DNUM_OFFSET + DIRECT * 4;
const DINUM_OFFSET: usize = INUM_OFFSET + INDIRECT * 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub magic: u32,
    pub link_count: u32,
    /// File size in bytes.
    pub size: u64,
    /// Allocated blocks, leaves and pointer blocks together.
    pub block_count: u32,
    pub seq_num: u32,
    pub create_time: u64,
    pub modify_time: u64,
    pub generation: u32,
    pub dnum: [u32; DIRECT],
    pub inum: [u32; INDIRECT],
    pub dinum: [u32; DOUBLY_INDIRECT],
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            magic: 0,
            link_count: 0,
            size: 0,
            block_count: 0,
            seq_num: 0,
            create_time: 0,
            modify_time: 0,
            generation: 0,
            dnum: [0; DIRECT],
            inum: [0; INDIRECT],
            dinum: [0; DOUBLY_INDIRECT],
        }
    }
}

impl Inode {
    /// Fresh file inode with one link.
    #[must_use]
    pub fn new_file(generation: u32, now: u64) -> Self {
        Self {
            magic: INODE_MAGIC,
            link_count: 1,
            create_time: now,
            modify_time: now,
            generation,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    /// `true` when no pointer slot is in use.
    #[must_use]
    pub fn has_no_blocks(&self) -> bool {
        self.dnum.iter().chain(&self.inum).chain(&self.dinum).all(|p| *p == 0)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_SIZE)?;
        let mut inode = Self {
            magic: read_le_u32(bytes, 0)?,
            link_count: read_le_u32(bytes, 4)?,
            size: read_le_u64(bytes, 8)?,
            block_count: read_le_u32(bytes, 16)?,
            seq_num: read_le_u32(bytes, 20)?,
            create_time: read_le_u64(bytes, 24)?,
            modify_time: read_le_u64(bytes, 32)?,
            generation: read_le_u32(bytes, 40)?,
            ..Self::default()
        };
        for (i, slot) in inode.dnum.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, DNUM_OFFSET + i * 4)?;
        }
        for (i, slot) in inode.inum.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, INUM_OFFSET + i * 4)?;
        }
        for (i, slot) in inode.dinum.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, DINUM_OFFSET + i * 4)?;
        }
        Ok(inode)
    }

    /// Serialize into the first [`INODE_SIZE`] bytes of `out`.
    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        let actual = out.len();
        let record = out.get_mut(..INODE_SIZE).ok_or(ParseError::InsufficientData {
            needed: INODE_SIZE,
            offset: 0,
            actual,
        })?;
        record.fill(0);
        write_le_u32(record, 0, self.magic)?;
        write_le_u32(record, 4, self.link_count)?;
        write_le_u64(record, 8, self.size)?;
        write_le_u32(record, 16, self.block_count)?;
        write_le_u32(record, 20, self.seq_num)?;
        write_le_u64(record, 24, self.create_time)?;
        write_le_u64(record, 32, self.modify_time)?;
        write_le_u32(record, 40, self.generation)?;
        for (i, p) in self.dnum.iter().enumerate() {
            write_le_u32(record, DNUM_OFFSET + i * 4, *p)?;
        }
        for (i, p) in self.inum.iter().enumerate() {
            write_le_u32(record, INUM_OFFSET + i * 4, *p)?;
        }
        for (i, p) in self.dinum.iter().enumerate() {
            write_le_u32(record, DINUM_OFFSET + i * 4, *p)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_fills_record_exactly() {
        assert_eq!(DINUM_OFFSET + DOUBLY_INDIRECT * 4, INODE_SIZE);
    }

    #[test]
    fn parse_serialize_preserves_fields() {
        let mut inode = Inode::new_file(7, 1_700_000_000);
        inode.size = 123_456;
        inode.block_count = 4;
        inode.dnum[0] = 10;
        inode.dnum[15] = 11;
        inode.inum[30] = 12;
        inode.dinum[0] = 13;

        let mut buf = vec![0xFF_u8; INODE_SIZE + 8];
        inode.serialize_into(&mut buf).expect("serialize");
        assert_eq!(&buf[INODE_SIZE..], &[0xFF_u8; 8]);
        assert_eq!(read_le_u32(&buf, 252), Ok(13));
        assert_eq!(buf[44..64], [0_u8; 20]);

        let parsed = Inode::parse(&buf).expect("parse");
        assert_eq!(parsed, inode);
        assert!(parsed.is_allocated());
        assert!(!parsed.has_no_blocks());
    }

    #[test]
    fn zeroed_record_is_free() {
        let parsed = Inode::parse(&[0_u8; INODE_SIZE]).expect("parse");
        assert!(!parsed.is_allocated());
        assert!(parsed.has_no_blocks());
        assert!(Inode::parse(&[0_u8; 100]).is_err());
    }

    #[test]
    fn short_output_buffer_is_rejected() {
        let mut buf = [0_u8; 100];
        assert_eq!(
            Inode::new_file(1, 0).serialize_into(&mut buf),
            Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: 100,
            })
        );
    }

    #[test]
    fn serde_json_handles_indirect_array() {
        let mut inode = Inode::new_file(1, 0);
        inode.inum[3] = 44;
        let json = serde_json::to_string(&inode).expect("to json");
        let back: Inode = serde_json::from_str(&json).expect("from json");
        assert_eq!(back, inode);
    }
}
