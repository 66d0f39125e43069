//! Open files.
//!
//! A [`Vnode`] keeps the in-memory inode, the file's pointer blocks and a
//! page cache of the blocks written through it. Writes land in the page
//! cache first. With the dirty cache enabled they only reserve blocks:
//! the logical blocks become pending and the
//! [`DataBlockAssigner`](crate::assigner::DataBlockAssigner) allocates them
//! later. Otherwise each write allocates (or copy-on-write swaps) its
//! blocks in its own transactions.
//!
//! Reads see pending data immediately: the page cache is consulted before
//! the address tree. A page stays cached until the commit that last wrote
//! it has reached the device; after that it is dropped and reads go to the
//! mapped block.

use crate::assigner::AllocationTarget;
use crate::fs::{Minfs, now_secs};
use crate::transaction::Transaction;
use crate::tree::{BlockAddressTree, IndirectCache, TreeMode};
use mfs_alloc::Reservation;
use mfs_block::{BlockBuffer, Operation, PendingWork, UnbufferedOperation};
use mfs_error::{MfsError, Result};
use mfs_ondisk::{DIRECT, Inode, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK, BlockPosition};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Vnode {
    fs: Arc<Minfs>,
    ino: u32,
    state: Mutex<VnodeState>,
    /// Highest commit sequence number whose writes are on the device.
    /// Advanced from write-back completions, which never take `state`.
    durable: Arc<AtomicU64>,
}

struct Page {
    buffer: BlockBuffer,
    /// Commit that last queued this page, or `None` while it holds changes
    /// no commit has queued yet.
    committed: Option<u64>,
}

impl Page {
    fn evictable(&self, durable: u64) -> bool {
        self.committed.is_some_and(|seq| seq <= durable)
    }
}

/// First logical block past the pointer group holding `index`. A group is
/// the direct range or the blocks sharing one leaf pointer block.
fn leaf_group_end(index: u64) -> u64 {
    if index < DIRECT as u64 {
        DIRECT as u64
    } else {
        BlockPosition::leaf_group_start(index) + POINTERS_PER_BLOCK
    }
}

struct VnodeState {
    inode: Inode,
    indirect: IndirectCache,
    /// Block payloads written through this vnode, by logical block.
    pages: BTreeMap<u64, Page>,
    /// Logical blocks written but not yet assigned a physical block.
    pending: BTreeSet<u64>,
    /// Blocks reserved for `pending`.
    held: Option<Reservation>,
    /// An allocation task for this vnode is queued on the assigner.
    queued: bool,
    removed: bool,
    /// Last commit sequence number handed out.
    commits: u64,
}

impl Vnode {
    pub(crate) fn new(fs: &Arc<Minfs>, ino: u32, inode: Inode) -> Arc<Self> {
        let indirect = IndirectCache::new(Arc::clone(fs.handler()), fs.data_start());
        Arc::new(Self {
            fs: Arc::clone(fs),
            ino,
            state: Mutex::new(VnodeState {
                inode,
                indirect,
                pages: BTreeMap::new(),
                pending: BTreeSet::new(),
                held: None,
                queued: false,
                removed: false,
                commits: 0,
            }),
            durable: Arc::new(AtomicU64::new(0)),
        })
    }

    #[must_use]
    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// Copy of the in-memory inode.
    #[must_use]
    pub fn inode(&self) -> Inode {
        self.state.lock().inode.clone()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().inode.size
    }

    /// Blocks owned by the file, pointer blocks included.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.state.lock().inode.block_count
    }

    /// Logical blocks still waiting for a physical block.
    #[must_use]
    pub fn pending_blocks(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Pages still cached because their latest write is not yet durable.
    #[must_use]
    pub fn cached_pages(&self) -> usize {
        let mut state = self.state.lock();
        self.evict_durable(&mut state);
        state.pages.len()
    }

    /// Physical block mapped at logical block `index`, if any.
    pub fn lookup(&self, index: u64) -> Result<Option<u32>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        BlockAddressTree::new(&mut state.inode, &mut state.indirect).lookup(index)
    }

    fn block_bytes(&self) -> u64 {
        u64::from(self.fs.block_size().get())
    }

    fn ensure_live(&self, state: &VnodeState) -> Result<()> {
        if state.removed {
            return Err(MfsError::NotFound(format!("inode {} was removed", self.ino)));
        }
        Ok(())
    }

    /// Run one tree operation inside `txn`, staging the inode when it changed.
    fn with_tree<R>(
        self: &Arc<Self>,
        txn: &mut Transaction,
        f: impl FnOnce(&mut BlockAddressTree<'_>, &mut Transaction) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.ensure_live(state)?;
        let mut tree = BlockAddressTree::new(&mut state.inode, &mut state.indirect);
        let result = f(&mut tree, txn)?;
        if tree.inode_dirty() {
            self.fs.inode_table().update(txn, self.ino, &state.inode)?;
            txn.pin_vnode(Arc::clone(self));
        }
        Ok(result)
    }

    /// Physical block of logical block `index`, allocated when `for_write`.
    pub fn get_block(self: &Arc<Self>, txn: &mut Transaction, index: u64, for_write: bool) -> Result<Option<u32>> {
        let mode = if for_write { TreeMode::Write } else { TreeMode::Read };
        self.with_tree(txn, |tree, txn| tree.get_or_create(txn, index, mode))
    }

    /// Free every block at or above logical block `start`.
    pub fn free_from(self: &Arc<Self>, txn: &mut Transaction, start: u64) -> Result<()> {
        self.with_tree(txn, |tree, txn| tree.free_from(txn, start))
    }

    /// Stage a copy-on-write replacement for logical block `index`.
    pub fn swap_block(self: &Arc<Self>, txn: &mut Transaction, index: u64) -> Result<u32> {
        self.with_tree(txn, |tree, txn| {
            tree.get_or_create(txn, index, TreeMode::Swap)?.ok_or_else(|| {
                MfsError::BadState(format!("swap of block {index} produced no block"))
            })
        })
    }

    fn evict_durable(&self, state: &mut VnodeState) {
        let durable = self.durable.load(Ordering::Acquire);
        state.pages.retain(|_, page| !page.evictable(durable));
    }

    /// Number the commit `txn` is about to make and advance the durable mark
    /// once its writes land.
    fn track_commit(&self, state: &mut VnodeState, txn: &mut Transaction) -> u64 {
        state.commits += 1;
        let seq = state.commits;
        let durable = Arc::clone(&self.durable);
        txn.on_complete(Box::new(move |result: Result<()>| {
            if result.is_ok() {
                durable.fetch_max(seq, Ordering::AcqRel);
            }
        }));
        seq
    }

    fn mark_committed(state: &mut VnodeState, blocks: impl IntoIterator<Item = u64>, seq: u64) {
        for index in blocks {
            if let Some(page) = state.pages.get_mut(&index) {
                page.committed = Some(seq);
            }
        }
    }

    /// Page of logical block `index` about to be modified, filled from the
    /// device unless the caller overwrites all of it.
    fn dirty_page(&self, state: &mut VnodeState, index: u64, overwrite: bool) -> Result<BlockBuffer> {
        if let Some(page) = state.pages.get_mut(&index) {
            page.committed = None;
            return Ok(page.buffer.clone());
        }
        let buffer = BlockBuffer::new(1, self.fs.block_size());
        if !overwrite {
            let mapped = BlockAddressTree::new(&mut state.inode, &mut state.indirect).lookup(index)?;
            if let Some(block) = mapped {
                self.fs.read_data_block(block, &buffer)?;
            }
        }
        state.pages.insert(
            index,
            Page {
                buffer: buffer.clone(),
                committed: None,
            },
        );
        Ok(buffer)
    }

    #[expect(clippy::cast_possible_truncation)]
    fn fill_pages(&self, state: &mut VnodeState, offset: u64, data: &[u8]) -> Result<()> {
        let block_bytes = self.block_bytes();
        let mut done = 0usize;
        while done < data.len() {
            let position = offset + done as u64;
            let index = position / block_bytes;
            let within = (position % block_bytes) as usize;
            let n = (block_bytes as usize - within).min(data.len() - done);
            let page = self.dirty_page(state, index, within == 0 && n == block_bytes as usize)?;
            page.with_bytes_mut(|bytes| bytes[within..within + n].copy_from_slice(&data[done..done + n]));
            done += n;
        }
        Ok(())
    }

    /// Write `data` at byte `offset`, growing the file as needed.
    pub fn write(self: &Arc<Self>, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| MfsError::InvalidArgument(format!("write at {offset} overflows")))?;
        let block_bytes = self.block_bytes();
        let first = offset / block_bytes;
        let last = (end - 1) / block_bytes;
        if last >= MAX_FILE_BLOCKS {
            return Err(MfsError::OutOfRange {
                index: last,
                limit: MAX_FILE_BLOCKS,
            });
        }
        self.fs.check_writable()?;
        let mut guard = self.state.lock();
        self.ensure_live(&guard)?;
        self.evict_durable(&mut guard);
        self.fill_pages(&mut guard, offset, data)?;
        let size = guard.inode.size.max(end);
        self.persist(guard, first, last - first + 1, size)?;
        Ok(data.len())
    }

    /// Persist pages `first..first + count` and the new `size`.
    fn persist(self: &Arc<Self>, guard: MutexGuard<'_, VnodeState>, first: u64, count: u64, size: u64) -> Result<()> {
        if self.fs.options().dirty_cache_enabled {
            self.defer(guard, first, count, size)
        } else {
            self.write_through(guard, first, count, size)
        }
    }

    fn write_through(self: &Arc<Self>, mut guard: MutexGuard<'_, VnodeState>, first: u64, count: u64, size: u64) -> Result<()> {
        let chunk = self.fs.assigner().chunk_blocks();
        let end = first + count;
        let mut start = first;
        while start < end {
            // One transaction never spans two leaf pointer blocks.
            let stop = leaf_group_end(start).min(start + chunk).min(end);
            let need = BlockAddressTree::blocks_required(start, stop - start)?;
            let mut txn = Transaction::create(&self.fs, 0, need)?;
            self.assign(&mut guard, &mut txn, start..stop)?;
            let state = &mut *guard;
            if stop == end {
                state.inode.size = size;
                state.inode.modify_time = now_secs();
            }
            self.fs.inode_table().update(&mut txn, self.ino, &state.inode)?;
            txn.pin_vnode(Arc::clone(self));
            let seq = self.track_commit(state, &mut txn);
            txn.commit()?;
            Self::mark_committed(state, start..stop, seq);
            start = stop;
        }
        Ok(())
    }

    /// Map each logical block in `blocks`, copy-on-write when already mapped,
    /// and stage its page as a data write.
    fn assign(&self, state: &mut VnodeState, txn: &mut Transaction, blocks: impl IntoIterator<Item = u64>) -> Result<()> {
        let block_size = self.fs.block_size();
        let mut tree = BlockAddressTree::new(&mut state.inode, &mut state.indirect);
        for index in blocks {
            let mode = if tree.lookup(index)?.is_some() {
                TreeMode::Swap
            } else {
                TreeMode::Write
            };
            let block = tree.get_or_create(txn, index, mode)?.ok_or_else(|| {
                MfsError::BadState(format!("block {index} was not mapped"))
            })?;
            let page = state
                .pages
                .entry(index)
                .or_insert_with(|| Page {
                    buffer: BlockBuffer::new(1, block_size),
                    committed: None,
                })
                .buffer
                .clone();
            txn.enqueue_data(UnbufferedOperation {
                vmo: page,
                op: Operation::write(0, self.fs.data_block(block), 1),
            });
        }
        Ok(())
    }

    #[expect(clippy::cast_possible_truncation)]
    fn defer(self: &Arc<Self>, mut guard: MutexGuard<'_, VnodeState>, first: u64, count: u64, size: u64) -> Result<()> {
        let state = &mut *guard;
        let fresh: Vec<u64> = (first..first + count)
            .filter(|index| !state.pending.contains(index))
            .collect();
        let need = if fresh.is_empty() {
            0
        } else {
            // Pointer blocks on the path plus one leaf per newly pending block.
            BlockAddressTree::blocks_required(first, count)? - count as u32 + fresh.len() as u32
        };
        let mut txn = Transaction::create(&self.fs, 0, need)?;
        if let Some(reserved) = txn.take_block_reservation() {
            match state.held.as_mut() {
                Some(held) => held.merge(reserved)?,
                None => state.held = Some(reserved),
            }
        }
        state.inode.size = size;
        state.inode.modify_time = now_secs();
        self.fs.inode_table().update(&mut txn, self.ino, &state.inode)?;
        txn.pin_vnode(Arc::clone(self));
        txn.commit()?;

        state.pending.extend(fresh);
        let enqueue = !state.queued && !state.pending.is_empty();
        if enqueue {
            state.queued = true;
        }
        drop(guard);
        if enqueue {
            if let Err(err) = self.fs.assigner().enqueue_allocation(Arc::clone(self)) {
                self.state.lock().queued = false;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`. Holes read as zeros.
    #[expect(clippy::cast_possible_truncation)]
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.ensure_live(state)?;
        let size = state.inode.size;
        if offset >= size {
            return Ok(0);
        }
        let len = (size - offset).min(buf.len() as u64) as usize;
        let block_bytes = self.block_bytes();
        let scratch = BlockBuffer::new(1, self.fs.block_size());
        let mut done = 0usize;
        while done < len {
            let position = offset + done as u64;
            let index = position / block_bytes;
            let within = (position % block_bytes) as usize;
            let n = (block_bytes as usize - within).min(len - done);
            let out = &mut buf[done..done + n];
            if let Some(page) = state.pages.get(&index) {
                page.buffer.with_bytes(|bytes| out.copy_from_slice(&bytes[within..within + n]));
            } else if let Some(block) =
                BlockAddressTree::new(&mut state.inode, &mut state.indirect).lookup(index)?
            {
                self.fs.read_data_block(block, &scratch)?;
                scratch.with_bytes(|bytes| out.copy_from_slice(&bytes[within..within + n]));
            } else {
                out.fill(0);
            }
            done += n;
        }
        Ok(len)
    }

    /// Set the file size to `len`, freeing blocks past the new end.
    #[expect(clippy::cast_possible_truncation)]
    pub fn truncate(self: &Arc<Self>, len: u64) -> Result<()> {
        let block_bytes = self.block_bytes();
        let keep = len.div_ceil(block_bytes);
        if keep > MAX_FILE_BLOCKS {
            return Err(MfsError::OutOfRange {
                index: keep - 1,
                limit: MAX_FILE_BLOCKS,
            });
        }
        self.fs.check_writable()?;
        let mut guard = self.state.lock();
        self.ensure_live(&guard)?;
        let old_size = guard.inode.size;
        {
            let state = &mut *guard;
            state.pages.retain(|index, _| *index < keep);
            state.pending.retain(|index| *index < keep);
            if state.pending.is_empty() {
                state.held = None;
            }
            let mut txn = Transaction::create(&self.fs, 0, 0)?;
            BlockAddressTree::new(&mut state.inode, &mut state.indirect).free_from(&mut txn, keep)?;
            state.inode.size = len;
            state.inode.modify_time = now_secs();
            self.fs.inode_table().update(&mut txn, self.ino, &state.inode)?;
            txn.pin_vnode(Arc::clone(self));
            txn.commit()?;
        }

        // Zero the tail of a partial last block so that growing the file
        // again reads zeros there.
        let within = (len % block_bytes) as usize;
        if len < old_size && within != 0 {
            let index = len / block_bytes;
            let state = &mut *guard;
            let mapped = state.pages.contains_key(&index)
                || state.pending.contains(&index)
                || BlockAddressTree::new(&mut state.inode, &mut state.indirect)
                    .lookup(index)?
                    .is_some();
            if mapped {
                let page = self.dirty_page(state, index, false)?;
                page.with_bytes_mut(|bytes| bytes[within..].fill(0));
                self.persist(guard, index, 1, len)?;
            }
        }
        Ok(())
    }

    /// Make everything written so far durable and drop the pages that are.
    pub fn sync(&self) -> Result<()> {
        self.fs.sync()?;
        self.evict_durable(&mut self.state.lock());
        Ok(())
    }

    /// Free the inode and forget the file's cached state.
    pub(crate) fn mark_removed(&self, txn: &mut Transaction) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_live(&state)?;
        txn.free_inode(self.ino)?;
        state.inode = Inode::default();
        self.fs.inode_table().update(txn, self.ino, &state.inode)?;
        state.removed = true;
        state.pages.clear();
        state.pending.clear();
        state.held = None;
        state.indirect.clear();
        Ok(())
    }
}

impl AllocationTarget for Vnode {
    #[expect(clippy::cast_possible_truncation)]
    fn resolve_pending(self: &Arc<Self>, max_blocks: u64) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(&first) = state.pending.first() else {
            state.queued = false;
            state.held = None;
            return Ok(0);
        };
        if state.removed {
            state.pending.clear();
            state.queued = false;
            return Ok(0);
        }
        self.evict_durable(state);
        // One chunk never spans two leaf pointer blocks.
        let chunk: Vec<u64> = state
            .pending
            .range(first..leaf_group_end(first))
            .take(max_blocks as usize)
            .copied()
            .collect();
        let span = chunk.last().map_or(1, |last| last - first + 1);
        let need = BlockAddressTree::blocks_required(first, span)? - span as u32 + chunk.len() as u32;

        let held = state.held.as_ref().map_or(0, Reservation::remaining);
        let mut txn = Transaction::create(&self.fs, 0, need.saturating_sub(held))?;
        if let Some(held) = state.held.as_mut() {
            let part = held.split(need.min(held.remaining()))?;
            txn.give_block_reservation(part)?;
        }
        self.assign(state, &mut txn, chunk.iter().copied())?;
        self.fs.inode_table().update(&mut txn, self.ino, &state.inode)?;
        if let Some(unused) = txn.take_unused_blocks()? {
            match state.held.as_mut() {
                Some(held) => held.merge(unused)?,
                None => state.held = Some(unused),
            }
        }
        for index in &chunk {
            state.pending.remove(index);
        }
        if state.pending.is_empty() {
            state.queued = false;
            state.held = None;
        }
        txn.pin_vnode(Arc::clone(self));
        let seq = self.track_commit(state, &mut txn);
        txn.commit()?;
        Self::mark_committed(state, chunk, seq);
        Ok(state.pending.len() as u64)
    }

    fn abandon_pending(&self, _error: &MfsError) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.held = None;
        state.queued = false;
    }
}

impl fmt::Debug for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Vnode")
            .field("ino", &self.ino)
            .field("size", &state.inode.size)
            .field("block_count", &state.inode.block_count)
            .field("pages", &state.pages.len())
            .field("pending", &state.pending.len())
            .field("removed", &state.removed)
            .finish_non_exhaustive()
    }
}
