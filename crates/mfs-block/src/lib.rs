#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` / `BlockDevice` traits with file- and
//! memory-backed implementations, the shared [`BlockBuffer`] that every
//! staged write references, the operation descriptions that transactions
//! stage ([`operation`]), and the block-transaction handler that executes
//! them against a device ([`handler`]).

pub mod buffer;
pub mod handler;
pub mod operation;

pub use buffer::BlockBuffer;
pub use handler::{DeviceTransactionHandler, HandlerStats, TransactionHandler};
pub use operation::{
    BufferedOperation, Operation, OperationKind, PendingWork, UnbufferedOperation, WriteBatch,
};

use mfs_error::{MfsError, Result};
use mfs_types::BlockNumber;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned copy of one device block.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_end(offset: u64, len: usize, device_len: u64, what: &str) -> Result<u64> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| MfsError::InvalidArgument(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| MfsError::InvalidArgument(format!("{what} range overflows u64")))?;
    if end > device_len {
        return Err(MfsError::InvalidArgument(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(end)
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `FileExt` is thread-safe and does not require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(MfsError::ReadOnly);
        }
        checked_end(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// RAM-backed byte device.
///
/// Clones share the same backing bytes, so a test can keep a handle to
/// inspect what reached the "disk" after handing the device to a handler.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    /// Copy of the current device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let end = checked_end(offset, buf.len(), bytes.len() as u64, "read")?;
        #[expect(clippy::cast_possible_truncation)]
        buf.copy_from_slice(&bytes[offset as usize..end as usize]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let end = checked_end(offset, buf.len(), bytes.len() as u64, "write")?;
        #[expect(clippy::cast_possible_truncation)]
        bytes[offset as usize..end as usize].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Adapts a [`ByteDevice`] to block-granular I/O.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(MfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(MfsError::Format(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(MfsError::OutOfRange {
                index: block.0,
                limit: self.block_count,
            });
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| MfsError::InvalidArgument("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(MfsError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let offset = self.block_offset(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_block_device_round_trips() {
        let mem = MemoryByteDevice::new(4096 * 4);
        let dev = ByteBlockDevice::new(mem.clone(), 4096).expect("device");

        dev.write_block(BlockNumber(2), &[7_u8; 4096]).expect("write");
        let read = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 4096]);
        assert_eq!(&mem.snapshot()[8192..8192 + 4096], &[7_u8; 4096]);
    }

    #[test]
    fn byte_block_device_rejects_misaligned_image() {
        let mem = MemoryByteDevice::new(4096 + 10);
        assert!(matches!(
            ByteBlockDevice::new(mem, 4096),
            Err(MfsError::Format(_))
        ));
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(4096 * 2), 4096).expect("device");
        assert!(matches!(
            dev.read_block(BlockNumber(2)),
            Err(MfsError::OutOfRange { index: 2, limit: 2 })
        ));
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 100]).is_err());
    }

    #[test]
    fn file_byte_device_reads_and_writes() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(8192).expect("set_len");
        let dev = FileByteDevice::open(file.path()).expect("open");
        assert!(dev.is_writable());
        assert_eq!(dev.len_bytes(), 8192);

        dev.write_all_at(100, b"minfs").expect("write");
        let mut buf = [0_u8; 5];
        dev.read_exact_at(100, &mut buf).expect("read");
        assert_eq!(&buf, b"minfs");
        dev.sync().expect("sync");

        let mut past_end = [0_u8; 8];
        assert!(dev.read_exact_at(8190, &mut past_end).is_err());
    }
}
