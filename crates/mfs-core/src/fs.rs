//! A mounted filesystem.
//!
//! [`Minfs`] owns the per-mount state: the superblock, both allocators,
//! the inode table, the write-back pipeline and the data-block assigner.
//! Vnodes are cached weakly by inode number, so an open vnode is shared
//! while anyone (including in-flight write-back work) holds it.
//!
//! ## Mount states
//!
//! | State | Writes | Left by |
//! |-------|--------|---------|
//! | read-write | accepted | device failure, [`Minfs::unmount`] |
//! | read-only (option) | refused with [`MfsError::ReadOnly`] | unmount |
//! | read-only (failed) | refused with [`MfsError::ReadOnly`] | unmount |
//! | unmounted | refused with [`MfsError::BadState`] | never |
//!
//! A read-write mount clears the superblock's clean flag on the device
//! before accepting writes; a successful unmount writes it back.
//!
//! # Logging
//!
//! - `mfs::mount` info: mount and unmount.
//! - `mfs::mount` warn: mounting a filesystem that was not unmounted cleanly;
//!   dropping a mounted filesystem.
//! - `mfs::vnode` debug: vnode created, opened from disk, removed.

use crate::assigner::{AssignerStats, DataBlockAssigner};
use crate::format::RESERVED_INDEX;
use crate::inode_table::InodeTable;
use crate::options::MountOptions;
use crate::transaction::Transaction;
use crate::vnode::Vnode;
use mfs_alloc::{AllocatorStats, BlockAllocator, PersistentStorage, PoolKind, SuperblockManager, VolumeManager};
use mfs_block::{BlockBuffer, BufferedOperation, Operation, TransactionHandler};
use mfs_error::{MfsError, Result};
use mfs_ondisk::{BLOCK_SIZE, FLAG_CLEAN, Inode, Superblock};
use mfs_types::{BlockSize, TxnId};
use mfs_writeback::{PipelineStats, WritebackPipeline, WritebackWork};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub struct Minfs {
    handler: Arc<dyn TransactionHandler>,
    superblock: Arc<SuperblockManager>,
    block_allocator: Arc<BlockAllocator>,
    inode_allocator: Arc<BlockAllocator>,
    inode_table: InodeTable,
    writeback: Arc<WritebackPipeline>,
    assigner: DataBlockAssigner<Vnode>,
    options: MountOptions,
    data_start: u64,
    /// Serializes reservation across concurrent transaction creation.
    pub(crate) txn_lock: Mutex<()>,
    next_txn: AtomicU64,
    next_generation: AtomicU32,
    vnodes: Mutex<HashMap<u32, Weak<Vnode>>>,
    unmount_started: AtomicBool,
    closed: AtomicBool,
}

impl Minfs {
    /// Mount the filesystem on `handler`.
    ///
    /// `volume` backs pool growth on a volume-managed device.
    pub fn mount(
        handler: Arc<dyn TransactionHandler>,
        options: MountOptions,
        volume: Option<Arc<dyn VolumeManager>>,
    ) -> Result<Arc<Self>> {
        if handler.block_size().get() != BLOCK_SIZE {
            return Err(MfsError::InvalidArgument(format!(
                "device block size {} is not {BLOCK_SIZE}",
                handler.block_size()
            )));
        }
        let superblock = Arc::new(SuperblockManager::load(handler.as_ref())?);
        let storage = |kind| {
            Box::new(PersistentStorage::new(
                kind,
                Arc::clone(&superblock),
                Arc::clone(&handler),
                volume.clone(),
            ))
        };
        let block_allocator = BlockAllocator::create(storage(PoolKind::Blocks))?;
        let inode_allocator = BlockAllocator::create(storage(PoolKind::Inodes))?;
        let inode_table = InodeTable::open(handler.as_ref(), Arc::clone(&superblock))?;
        let sb = superblock.snapshot();
        let writeback = WritebackPipeline::new(Arc::clone(&handler), options.writeback)?;
        let assigner = DataBlockAssigner::new(options.assigner, Arc::clone(&writeback), sb.block_bitmap_blocks())?;

        if sb.flags & FLAG_CLEAN == 0 {
            warn!(target: "mfs::mount", "filesystem was not unmounted cleanly");
        }
        if !options.readonly {
            superblock.update(|sb| sb.flags &= !FLAG_CLEAN);
            superblock.write_through(handler.as_ref())?;
            writeback.start()?;
            if let Err(err) = assigner.start() {
                // The pipeline has nothing queued yet.
                let _ = writeback.shutdown();
                return Err(err);
            }
        }
        info!(
            target: "mfs::mount",
            blocks = sb.block_count,
            inodes = sb.inode_count,
            free_blocks = block_allocator.available(),
            free_inodes = inode_allocator.available(),
            readonly = options.readonly,
            dirty_cache = options.dirty_cache_enabled,
            "mounted"
        );
        Ok(Arc::new(Self {
            handler,
            superblock,
            block_allocator,
            inode_allocator,
            inode_table,
            writeback,
            assigner,
            options,
            data_start: u64::from(sb.dat_block),
            txn_lock: Mutex::new(()),
            next_txn: AtomicU64::new(1),
            next_generation: AtomicU32::new(1),
            vnodes: Mutex::new(HashMap::new()),
            unmount_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// In-memory superblock, including counters not yet written back.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.superblock.snapshot()
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.handler.block_size()
    }

    #[must_use]
    pub fn block_allocator(&self) -> &Arc<BlockAllocator> {
        &self.block_allocator
    }

    #[must_use]
    pub fn inode_allocator(&self) -> &Arc<BlockAllocator> {
        &self.inode_allocator
    }

    #[must_use]
    pub fn inode_table(&self) -> &InodeTable {
        &self.inode_table
    }

    #[must_use]
    pub fn writeback(&self) -> &Arc<WritebackPipeline> {
        &self.writeback
    }

    pub(crate) fn assigner(&self) -> &DataBlockAssigner<Vnode> {
        &self.assigner
    }

    pub(crate) fn handler(&self) -> &Arc<dyn TransactionHandler> {
        &self.handler
    }

    #[must_use]
    pub fn block_allocator_stats(&self) -> AllocatorStats {
        self.block_allocator.stats()
    }

    #[must_use]
    pub fn inode_allocator_stats(&self) -> AllocatorStats {
        self.inode_allocator.stats()
    }

    #[must_use]
    pub fn writeback_stats(&self) -> PipelineStats {
        self.writeback.stats()
    }

    #[must_use]
    pub fn assigner_stats(&self) -> AssignerStats {
        self.assigner.stats()
    }

    /// Device block of data-pool block `index`.
    #[must_use]
    pub fn data_block(&self, index: u32) -> u64 {
        self.data_start + u64::from(index)
    }

    pub(crate) fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Read data-pool block `index` into the first block of `page`.
    pub(crate) fn read_data_block(&self, index: u32, page: &BlockBuffer) -> Result<()> {
        self.handler.run_requests(&[BufferedOperation {
            buffer: page.clone(),
            op: Operation::read(0, self.data_block(index), 1),
        }])
    }

    /// `true` when mounted read-only or after a write-back failure.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.options.readonly || self.writeback.is_read_only()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MfsError::BadState("filesystem is unmounted".to_owned()));
        }
        if self.is_read_only() {
            return Err(MfsError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate an inode for a new, empty file.
    pub fn create_vnode(self: &Arc<Self>) -> Result<Arc<Vnode>> {
        let mut txn = Transaction::create(self, 1, 0)?;
        let ino = txn.allocate_inode()?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let inode = Inode::new_file(generation, now_secs());
        self.inode_table.update(&mut txn, ino, &inode)?;
        let vnode = Vnode::new(self, ino, inode);
        txn.pin_vnode(Arc::clone(&vnode));
        txn.commit()?;
        let mut vnodes = self.vnodes.lock();
        vnodes.retain(|_, cached| cached.strong_count() > 0);
        vnodes.insert(ino, Arc::downgrade(&vnode));
        drop(vnodes);
        debug!(target: "mfs::vnode", ino, generation, "created");
        Ok(vnode)
    }

    /// Vnodes currently open.
    #[must_use]
    pub fn open_vnodes(&self) -> usize {
        self.vnodes.lock().values().filter(|v| v.strong_count() > 0).count()
    }

    /// Cache entries, closed vnodes not yet pruned included.
    #[must_use]
    pub fn cached_vnodes(&self) -> usize {
        self.vnodes.lock().len()
    }

    /// The vnode of inode `ino`, shared with any other open handle.
    ///
    /// A cache miss also prunes entries of vnodes closed since.
    pub fn open_vnode(self: &Arc<Self>, ino: u32) -> Result<Arc<Vnode>> {
        let mut vnodes = self.vnodes.lock();
        if let Some(vnode) = vnodes.get(&ino).and_then(Weak::upgrade) {
            return Ok(vnode);
        }
        vnodes.retain(|_, vnode| vnode.strong_count() > 0);
        let missing = || MfsError::NotFound(format!("inode {ino}"));
        if ino == RESERVED_INDEX {
            return Err(missing());
        }
        let inode = match self.inode_table.load(ino) {
            Ok(inode) => inode,
            Err(MfsError::OutOfRange { .. }) => return Err(missing()),
            Err(err) => return Err(err),
        };
        if !inode.is_allocated() {
            return Err(missing());
        }
        let vnode = Vnode::new(self, ino, inode);
        vnodes.insert(ino, Arc::downgrade(&vnode));
        debug!(target: "mfs::vnode", ino, "opened");
        Ok(vnode)
    }

    /// Free every block of `vnode`, then its inode.
    pub fn remove_vnode(self: &Arc<Self>, vnode: &Arc<Vnode>) -> Result<()> {
        vnode.truncate(0)?;
        let mut txn = Transaction::create(self, 0, 0)?;
        vnode.mark_removed(&mut txn)?;
        txn.commit()?;
        self.vnodes.lock().remove(&vnode.ino());
        debug!(target: "mfs::vnode", ino = vnode.ino(), "removed");
        Ok(())
    }

    /// Assign every deferred block and wait until all of it is durable.
    pub fn sync(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MfsError::BadState("filesystem is unmounted".to_owned()));
        }
        if self.options.readonly {
            return Ok(());
        }
        self.assigner.sync()
    }

    /// Drain deferred work, mark the filesystem clean and stop both workers.
    ///
    /// A second call is a no-op. The clean flag is only written when every
    /// earlier write succeeded.
    pub fn unmount(&self) -> Result<()> {
        if self.unmount_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.options.readonly {
            self.closed.store(true, Ordering::Release);
            info!(target: "mfs::mount", "unmounted");
            return Ok(());
        }
        let drained = self.assigner.sync().and(self.assigner.shutdown());
        self.closed.store(true, Ordering::Release);
        let marked = match &drained {
            Ok(()) if !self.writeback.is_read_only() => self.stage_clean(),
            _ => Ok(()),
        };
        let stopped = self.writeback.shutdown();
        let result = drained.and(marked).and(stopped);
        match &result {
            Ok(()) => info!(target: "mfs::mount", "unmounted"),
            Err(err) => warn!(target: "mfs::mount", error = %err, "unmounted without marking clean"),
        }
        result
    }

    fn stage_clean(&self) -> Result<()> {
        self.superblock.update(|sb| sb.flags |= FLAG_CLEAN);
        let mut work = WritebackWork::new();
        self.superblock.stage(&mut work)?;
        work.request_flush();
        self.writeback.enqueue(work)
    }
}

impl Drop for Minfs {
    fn drop(&mut self) {
        if !self.unmount_started.load(Ordering::Acquire) {
            warn!(target: "mfs::mount", "filesystem dropped while mounted; stopping workers");
            let _ = self.assigner.shutdown();
            let _ = self.writeback.shutdown();
        }
    }
}

impl fmt::Debug for Minfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Minfs")
            .field("options", &self.options)
            .field("data_start", &self.data_start)
            .field("read_only", &self.is_read_only())
            .field("open_vnodes", &self.open_vnodes())
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
