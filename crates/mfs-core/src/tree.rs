//! Logical-to-physical block mapping for one file.
//!
//! An inode addresses its data through `DIRECT` direct pointers,
//! `INDIRECT` indirect blocks of `P` pointers each and `DOUBLY_INDIRECT`
//! doubly-indirect blocks of `P` indirect pointers each. Pointers are
//! data-pool indices; zero means "not allocated".
//!
//! | Mode | Effect on a missing pointer | Effect on the leaf |
//! |------|-----------------------------|--------------------|
//! | [`TreeMode::Read`] | returns a hole | none |
//! | [`TreeMode::Write`] | allocates a zeroed pointer block | allocates when missing |
//! | [`TreeMode::Swap`] | allocates a zeroed pointer block | stages a copy-on-write replacement |
//! | [`TreeMode::Delete`] | returns a hole | frees it; emptied pointer blocks collapse upward |
//!
//! Pointer blocks live in a per-file [`IndirectCache`]. Every modified
//! pointer block that stays allocated is staged as a metadata write; a
//! block about to be freed is never written.
//!
//! # Logging
//!
//! - `mfs::tree` trace: pointer block loaded, allocated or freed; leaf
//!   allocated, swapped or freed.

use crate::transaction::Transaction;
use mfs_block::{BlockBuffer, BufferedOperation, Operation, PendingWork, TransactionHandler, UnbufferedOperation};
use mfs_error::{MfsError, Result};
use mfs_ondisk::{
    BlockPosition, DIRECT, DOUBLY_INDIRECT, INDIRECT, Inode, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK,
    parse_error_to_mfs, pointers_all_zero, read_pointer, write_pointer,
};
use mfs_types::ParseError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

#[expect(clippy::cast_possible_truncation)]
const P: usize = POINTERS_PER_BLOCK as usize;

const INDIRECT_BASE: u64 = DIRECT as u64;
const DOUBLY_BASE: u64 = INDIRECT_BASE + INDIRECT as u64 * POINTERS_PER_BLOCK;
const DOUBLY_SPAN: u64 = POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMode {
    Read,
    Write,
    Delete,
    Swap,
}

/// Pointer blocks of one file, keyed by data-pool index.
pub struct IndirectCache {
    handler: Arc<dyn TransactionHandler>,
    data_start: u64,
    blocks: HashMap<u32, BlockBuffer>,
}

impl IndirectCache {
    #[must_use]
    pub fn new(handler: Arc<dyn TransactionHandler>, data_start: u64) -> Self {
        Self {
            handler,
            data_start,
            blocks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    fn device_block(&self, index: u32) -> u64 {
        self.data_start + u64::from(index)
    }

    fn get(&mut self, index: u32) -> Result<BlockBuffer> {
        if let Some(block) = self.blocks.get(&index) {
            return Ok(block.clone());
        }
        let block = BlockBuffer::new(1, self.handler.block_size());
        self.handler.run_requests(&[BufferedOperation {
            buffer: block.clone(),
            op: Operation::read(0, self.device_block(index), 1),
        }])?;
        trace!(target: "mfs::tree", block = index, "pointer block loaded");
        self.blocks.insert(index, block.clone());
        Ok(block)
    }

    fn fresh(&mut self, index: u32) {
        let block = BlockBuffer::new(1, self.handler.block_size());
        self.blocks.insert(index, block);
    }

    fn forget(&mut self, index: u32) {
        self.blocks.remove(&index);
    }
}

impl fmt::Debug for IndirectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndirectCache")
            .field("data_start", &self.data_start)
            .field("cached", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

/// Where one pointer lives.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Direct(usize),
    Indirect(usize),
    DoublyIndirect(usize),
    Entry { block: u32, entry: usize },
}

/// Address tree of one inode, borrowed for the duration of an operation.
pub struct BlockAddressTree<'a> {
    inode: &'a mut Inode,
    cache: &'a mut IndirectCache,
    inode_dirty: bool,
}

impl<'a> BlockAddressTree<'a> {
    pub fn new(inode: &'a mut Inode, cache: &'a mut IndirectCache) -> Self {
        Self {
            inode,
            cache,
            inode_dirty: false,
        }
    }

    /// `true` once a pointer field or the block count of the inode changed.
    #[must_use]
    pub fn inode_dirty(&self) -> bool {
        self.inode_dirty
    }

    /// Upper bound on the blocks that writing `count` blocks from `start`
    /// can allocate: the leaves plus every pointer block on their paths.
    pub fn blocks_required(start: u64, count: u64) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        let Some(end) = start.checked_add(count).filter(|end| *end <= MAX_FILE_BLOCKS) else {
            return Err(MfsError::OutOfRange {
                index: start.saturating_add(count - 1),
                limit: MAX_FILE_BLOCKS,
            });
        };
        let last = end - 1;
        let mut total = count;
        if last >= INDIRECT_BASE {
            let first = start.max(INDIRECT_BASE);
            total += (BlockPosition::leaf_group_start(last) - BlockPosition::leaf_group_start(first))
                / POINTERS_PER_BLOCK
                + 1;
        }
        if last >= DOUBLY_BASE {
            let first = start.max(DOUBLY_BASE);
            total += (last - DOUBLY_BASE) / DOUBLY_SPAN - (first - DOUBLY_BASE) / DOUBLY_SPAN + 1;
        }
        u32::try_from(total)
            .map_err(|_| MfsError::InvalidArgument(format!("{count} blocks is too many for one reservation")))
    }

    fn position(index: u64) -> Result<BlockPosition> {
        BlockPosition::locate(index).ok_or(MfsError::OutOfRange {
            index,
            limit: MAX_FILE_BLOCKS,
        })
    }

    fn get_slot(&mut self, slot: Slot) -> Result<u32> {
        match slot {
            Slot::Direct(i) => Ok(self.inode.dnum[i]),
            Slot::Indirect(i) => Ok(self.inode.inum[i]),
            Slot::DoublyIndirect(i) => Ok(self.inode.dinum[i]),
            Slot::Entry { block, entry } => self
                .cache
                .get(block)?
                .with_bytes(|bytes| read_pointer(bytes, entry))
                .map_err(|e| parse_error_to_mfs(&e)),
        }
    }

    /// Set a pointer without staging anything.
    fn put_slot(&mut self, slot: Slot, value: u32) -> Result<()> {
        match slot {
            Slot::Direct(i) => self.inode.dnum[i] = value,
            Slot::Indirect(i) => self.inode.inum[i] = value,
            Slot::DoublyIndirect(i) => self.inode.dinum[i] = value,
            Slot::Entry { block, entry } => {
                return self
                    .cache
                    .get(block)?
                    .with_bytes_mut(|bytes| write_pointer(bytes, entry, value))
                    .map_err(|e| parse_error_to_mfs(&e));
            }
        }
        self.inode_dirty = true;
        Ok(())
    }

    fn set_slot(&mut self, txn: &mut Transaction, slot: Slot, value: u32) -> Result<()> {
        self.put_slot(slot, value)?;
        if let Slot::Entry { block, .. } = slot {
            self.stage(txn, block)?;
        }
        Ok(())
    }

    fn stage(&mut self, txn: &mut Transaction, block: u32) -> Result<()> {
        let buffer = self.cache.get(block)?;
        txn.enqueue_metadata(UnbufferedOperation {
            vmo: buffer,
            op: Operation::write(0, self.cache.device_block(block), 1),
        });
        Ok(())
    }

    fn block_is_empty(&mut self, block: u32) -> Result<bool> {
        Ok(self.cache.get(block)?.with_bytes(pointers_all_zero))
    }

    fn count_allocated(&mut self) {
        self.inode.block_count += 1;
        self.inode_dirty = true;
    }

    fn release(&mut self, txn: &mut Transaction, block: u32) -> Result<()> {
        txn.free_block(block)?;
        self.inode.block_count = self.inode.block_count.saturating_sub(1);
        self.inode_dirty = true;
        Ok(())
    }

    fn release_pointer_block(&mut self, txn: &mut Transaction, block: u32) -> Result<()> {
        self.cache.forget(block);
        self.release(txn, block)?;
        trace!(target: "mfs::tree", block, "pointer block freed");
        Ok(())
    }

    /// Pointer block behind `slot`, or `None` when it is not allocated.
    fn descend(&mut self, slot: Slot) -> Result<Option<u32>> {
        let block = self.get_slot(slot)?;
        Ok((block != 0).then_some(block))
    }

    /// Pointer block behind `slot`, allocated and zeroed when missing.
    fn descend_or_allocate(&mut self, txn: &mut Transaction, slot: Slot) -> Result<u32> {
        if let Some(block) = self.descend(slot)? {
            return Ok(block);
        }
        let block = txn.allocate_block()?;
        self.cache.fresh(block);
        self.stage(txn, block)?;
        self.set_slot(txn, slot, block)?;
        self.count_allocated();
        trace!(target: "mfs::tree", block, "pointer block allocated");
        Ok(block)
    }

    fn leaf_slot(&mut self, index: u64) -> Result<Option<Slot>> {
        Ok(match Self::position(index)? {
            BlockPosition::Direct { slot } => Some(Slot::Direct(slot)),
            BlockPosition::Indirect { slot, entry } => self
                .descend(Slot::Indirect(slot))?
                .map(|block| Slot::Entry { block, entry }),
            BlockPosition::DoublyIndirect {
                slot,
                indirect,
                entry,
            } => match self.descend(Slot::DoublyIndirect(slot))? {
                Some(outer) => self
                    .descend(Slot::Entry {
                        block: outer,
                        entry: indirect,
                    })?
                    .map(|block| Slot::Entry { block, entry }),
                None => None,
            },
        })
    }

    fn leaf_slot_or_allocate(&mut self, txn: &mut Transaction, index: u64) -> Result<Slot> {
        Ok(match Self::position(index)? {
            BlockPosition::Direct { slot } => Slot::Direct(slot),
            BlockPosition::Indirect { slot, entry } => Slot::Entry {
                block: self.descend_or_allocate(txn, Slot::Indirect(slot))?,
                entry,
            },
            BlockPosition::DoublyIndirect {
                slot,
                indirect,
                entry,
            } => {
                let outer = self.descend_or_allocate(txn, Slot::DoublyIndirect(slot))?;
                let block = self.descend_or_allocate(
                    txn,
                    Slot::Entry {
                        block: outer,
                        entry: indirect,
                    },
                )?;
                Slot::Entry { block, entry }
            }
        })
    }

    /// Physical block of logical block `index`; `None` is a hole.
    pub fn lookup(&mut self, index: u64) -> Result<Option<u32>> {
        let Some(slot) = self.leaf_slot(index)? else {
            return Ok(None);
        };
        self.descend(slot)
    }

    /// Resolve logical block `index` according to `mode`.
    ///
    /// Returns the leaf for `Read` and `Write`, the replacement for `Swap`
    /// and the freed block for `Delete`.
    pub fn get_or_create(
        &mut self,
        txn: &mut Transaction,
        index: u64,
        mode: TreeMode,
    ) -> Result<Option<u32>> {
        match mode {
            TreeMode::Read => self.lookup(index),
            TreeMode::Write => {
                let slot = self.leaf_slot_or_allocate(txn, index)?;
                if let Some(block) = self.descend(slot)? {
                    return Ok(Some(block));
                }
                let block = txn.allocate_block()?;
                self.set_slot(txn, slot, block)?;
                self.count_allocated();
                trace!(target: "mfs::tree", index, block, "leaf allocated");
                Ok(Some(block))
            }
            TreeMode::Swap => {
                let slot = self.leaf_slot_or_allocate(txn, index)?;
                let old = self.get_slot(slot)?;
                let block = txn.swap_block(old)?;
                self.set_slot(txn, slot, block)?;
                if old == 0 {
                    self.count_allocated();
                }
                trace!(target: "mfs::tree", index, old, block, "leaf swapped");
                Ok(Some(block))
            }
            TreeMode::Delete => self.delete(txn, index),
        }
    }

    fn delete(&mut self, txn: &mut Transaction, index: u64) -> Result<Option<u32>> {
        let freed = match Self::position(index)? {
            BlockPosition::Direct { slot } => {
                let Some(old) = self.descend(Slot::Direct(slot))? else {
                    return Ok(None);
                };
                self.put_slot(Slot::Direct(slot), 0)?;
                self.release(txn, old)?;
                old
            }
            BlockPosition::Indirect { slot, entry } => {
                let Some(block) = self.descend(Slot::Indirect(slot))? else {
                    return Ok(None);
                };
                let Some(old) = self.clear_leaf(txn, block, entry)? else {
                    return Ok(None);
                };
                if self.block_is_empty(block)? {
                    self.put_slot(Slot::Indirect(slot), 0)?;
                    self.release_pointer_block(txn, block)?;
                } else {
                    self.stage(txn, block)?;
                }
                old
            }
            BlockPosition::DoublyIndirect {
                slot,
                indirect,
                entry,
            } => {
                let Some(outer) = self.descend(Slot::DoublyIndirect(slot))? else {
                    return Ok(None);
                };
                let parent = Slot::Entry {
                    block: outer,
                    entry: indirect,
                };
                let Some(block) = self.descend(parent)? else {
                    return Ok(None);
                };
                let Some(old) = self.clear_leaf(txn, block, entry)? else {
                    return Ok(None);
                };
                if self.block_is_empty(block)? {
                    self.put_slot(parent, 0)?;
                    self.release_pointer_block(txn, block)?;
                    if self.block_is_empty(outer)? {
                        self.put_slot(Slot::DoublyIndirect(slot), 0)?;
                        self.release_pointer_block(txn, outer)?;
                    } else {
                        self.stage(txn, outer)?;
                    }
                } else {
                    self.stage(txn, block)?;
                }
                old
            }
        };
        trace!(target: "mfs::tree", index, block = freed, "leaf freed");
        Ok(Some(freed))
    }

    /// Zero entry `entry` of `block` and free what it pointed at. The block
    /// itself is not staged.
    fn clear_leaf(&mut self, txn: &mut Transaction, block: u32, entry: usize) -> Result<Option<u32>> {
        let slot = Slot::Entry { block, entry };
        let Some(old) = self.descend(slot)? else {
            return Ok(None);
        };
        self.put_slot(slot, 0)?;
        self.release(txn, old)?;
        Ok(Some(old))
    }

    /// Free leaves `first..P` of `block`. Returns `true` when the block is
    /// left empty (the caller frees it); otherwise a modified block is staged.
    fn truncate_leaves(&mut self, txn: &mut Transaction, block: u32, first: usize) -> Result<bool> {
        let buffer = self.cache.get(block)?;
        let leaves = buffer
            .with_bytes_mut(|bytes| -> std::result::Result<Vec<u32>, ParseError> {
                let mut leaves = Vec::new();
                for entry in first..P {
                    let leaf = read_pointer(bytes, entry)?;
                    if leaf != 0 {
                        write_pointer(bytes, entry, 0)?;
                        leaves.push(leaf);
                    }
                }
                Ok(leaves)
            })
            .map_err(|e| parse_error_to_mfs(&e))?;
        for leaf in &leaves {
            self.release(txn, *leaf)?;
        }
        let empty = buffer.with_bytes(pointers_all_zero);
        if !empty && !leaves.is_empty() {
            self.stage(txn, block)?;
        }
        Ok(empty)
    }

    /// Free every mapping at or above logical block `start`.
    ///
    /// Only allocated subtrees are visited; pointer blocks left empty are
    /// freed and unlinked bottom-up.
    #[expect(clippy::cast_possible_truncation)]
    pub fn free_from(&mut self, txn: &mut Transaction, start: u64) -> Result<()> {
        if start >= MAX_FILE_BLOCKS {
            return Ok(());
        }
        for slot in (start.min(DIRECT as u64) as usize)..DIRECT {
            if let Some(old) = self.descend(Slot::Direct(slot))? {
                self.put_slot(Slot::Direct(slot), 0)?;
                self.release(txn, old)?;
            }
        }

        for slot in 0..INDIRECT {
            let group = INDIRECT_BASE + slot as u64 * POINTERS_PER_BLOCK;
            if group + POINTERS_PER_BLOCK <= start {
                continue;
            }
            let Some(block) = self.descend(Slot::Indirect(slot))? else {
                continue;
            };
            if self.truncate_leaves(txn, block, start.saturating_sub(group) as usize)? {
                self.put_slot(Slot::Indirect(slot), 0)?;
                self.release_pointer_block(txn, block)?;
            }
        }

        for slot in 0..DOUBLY_INDIRECT {
            let region = DOUBLY_BASE + slot as u64 * DOUBLY_SPAN;
            if region + DOUBLY_SPAN <= start {
                continue;
            }
            let Some(outer) = self.descend(Slot::DoublyIndirect(slot))? else {
                continue;
            };
            let mut outer_modified = false;
            for indirect in 0..P {
                let group = region + indirect as u64 * POINTERS_PER_BLOCK;
                if group + POINTERS_PER_BLOCK <= start {
                    continue;
                }
                let parent = Slot::Entry {
                    block: outer,
                    entry: indirect,
                };
                let Some(block) = self.descend(parent)? else {
                    continue;
                };
                if self.truncate_leaves(txn, block, start.saturating_sub(group) as usize)? {
                    self.put_slot(parent, 0)?;
                    self.release_pointer_block(txn, block)?;
                    outer_modified = true;
                }
            }
            if self.block_is_empty(outer)? {
                self.put_slot(Slot::DoublyIndirect(slot), 0)?;
                self.release_pointer_block(txn, outer)?;
            } else if outer_modified {
                self.stage(txn, outer)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BlockAddressTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAddressTree")
            .field("block_count", &self.inode.block_count)
            .field("inode_dirty", &self.inode_dirty)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Minfs;
    use crate::options::MountOptions;
    use crate::testing::mounted;

    fn cache(fs: &Arc<Minfs>) -> IndirectCache {
        IndirectCache::new(Arc::clone(fs.handler()), fs.data_start())
    }

    #[test]
    fn blocks_required_counts_pointer_blocks() {
        assert_eq!(BlockAddressTree::blocks_required(0, 0).expect("empty"), 0);
        assert_eq!(BlockAddressTree::blocks_required(0, 16).expect("direct"), 16);
        assert_eq!(BlockAddressTree::blocks_required(15, 2).expect("first indirect"), 3);
        assert_eq!(
            BlockAddressTree::blocks_required(16, POINTERS_PER_BLOCK + 1).expect("two groups"),
            u32::try_from(POINTERS_PER_BLOCK).expect("fits") + 3
        );
        assert_eq!(BlockAddressTree::blocks_required(MAX_FILE_BLOCKS - 1, 1).expect("last"), 3);
        let err = BlockAddressTree::blocks_required(MAX_FILE_BLOCKS, 1).expect_err("beyond");
        assert!(matches!(err, MfsError::OutOfRange { .. }));
    }

    #[test]
    fn last_index_allocates_the_doubly_indirect_path() {
        let fs = mounted(128, MountOptions::default());
        let available = fs.block_allocator().available();
        let mut inode = Inode::new_file(1, 0);
        let mut cache = cache(&fs);
        let mut txn = Transaction::create(&fs, 0, 3).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);

        let leaf = tree
            .get_or_create(&mut txn, MAX_FILE_BLOCKS - 1, TreeMode::Write)
            .expect("write")
            .expect("leaf");
        assert!(tree.inode_dirty());
        assert_eq!(tree.lookup(MAX_FILE_BLOCKS - 1).expect("lookup"), Some(leaf));
        assert_eq!(tree.lookup(MAX_FILE_BLOCKS - 2).expect("neighbour"), None);

        assert_eq!(inode.block_count, 3);
        assert_ne!(inode.dinum[0], 0);
        assert_eq!(txn.blocks_remaining(), 0);
        txn.commit().expect("commit");
        assert_eq!(fs.block_allocator().available(), available - 3);
        fs.unmount().expect("unmount");
    }

    #[test]
    fn index_past_the_tree_is_out_of_range() {
        let fs = mounted(128, MountOptions::default());
        let mut inode = Inode::new_file(1, 0);
        let mut cache = cache(&fs);
        let mut txn = Transaction::create(&fs, 0, 0).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);

        let err = tree
            .get_or_create(&mut txn, MAX_FILE_BLOCKS, TreeMode::Write)
            .expect_err("beyond the tree");
        assert!(matches!(
            err,
            MfsError::OutOfRange { index, limit } if index == MAX_FILE_BLOCKS && limit == MAX_FILE_BLOCKS
        ));
        assert!(!tree.inode_dirty());
        drop(txn);
        fs.unmount().expect("unmount");
    }

    #[test]
    fn delete_collapses_an_emptied_indirect_block() {
        let fs = mounted(128, MountOptions::default());
        let available = fs.block_allocator().available();
        let mut inode = Inode::new_file(1, 0);
        let mut cache = cache(&fs);

        let mut txn = Transaction::create(&fs, 0, 2).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);
        let leaf = tree
            .get_or_create(&mut txn, 16, TreeMode::Write)
            .expect("write")
            .expect("leaf");
        txn.commit().expect("commit");
        assert_ne!(inode.inum[0], 0);
        assert_eq!(cache.len(), 1);

        let mut txn = Transaction::create(&fs, 0, 0).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);
        assert_eq!(tree.get_or_create(&mut txn, 16, TreeMode::Delete).expect("delete"), Some(leaf));
        assert_eq!(tree.get_or_create(&mut txn, 17, TreeMode::Delete).expect("hole"), None);
        txn.commit().expect("commit");

        assert_eq!(inode.inum[0], 0);
        assert_eq!(inode.block_count, 0);
        assert!(cache.is_empty());
        assert_eq!(fs.block_allocator().available(), available);
        fs.unmount().expect("unmount");
    }

    #[test]
    fn free_from_keeps_the_prefix_and_drops_empty_subtrees() {
        let fs = mounted(128, MountOptions::default());
        let available = fs.block_allocator().available();
        let mut inode = Inode::new_file(1, 0);
        let mut cache = cache(&fs);

        let mut txn = Transaction::create(&fs, 0, 7).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);
        for index in [3, 16, 17, MAX_FILE_BLOCKS - 1] {
            tree.get_or_create(&mut txn, index, TreeMode::Write).expect("write");
        }
        txn.commit().expect("commit");
        // Four leaves, one indirect block, two doubly-indirect path blocks.
        assert_eq!(inode.block_count, 7);

        let mut txn = Transaction::create(&fs, 0, 0).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);
        tree.free_from(&mut txn, 17).expect("free tail");
        assert!(tree.lookup(16).expect("kept").is_some());
        assert_eq!(tree.lookup(17).expect("freed"), None);
        assert_eq!(tree.lookup(MAX_FILE_BLOCKS - 1).expect("freed"), None);
        txn.commit().expect("commit");
        assert_eq!(inode.block_count, 3);
        assert_eq!(inode.dinum[0], 0);
        assert_ne!(inode.inum[0], 0);

        let mut txn = Transaction::create(&fs, 0, 0).expect("txn");
        BlockAddressTree::new(&mut inode, &mut cache)
            .free_from(&mut txn, 0)
            .expect("free all");
        txn.commit().expect("commit");
        assert!(inode.has_no_blocks());
        assert_eq!(inode.block_count, 0);
        assert!(cache.is_empty());
        assert_eq!(fs.block_allocator().available(), available);
        fs.block_allocator().check_consistency().expect("consistent");
        fs.unmount().expect("unmount");
    }

    #[test]
    fn high_write_after_truncate_to_zero_sees_no_stale_pointers() {
        let fs = mounted(128, MountOptions::default());
        let mut inode = Inode::new_file(1, 0);
        let mut cache = cache(&fs);

        let mut txn = Transaction::create(&fs, 0, 4).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);
        for index in [MAX_FILE_BLOCKS - 2, MAX_FILE_BLOCKS - 1] {
            tree.get_or_create(&mut txn, index, TreeMode::Write).expect("write");
        }
        tree.free_from(&mut txn, 0).expect("truncate");
        txn.commit().expect("commit");
        assert_eq!(inode.block_count, 0);

        let mut txn = Transaction::create(&fs, 0, 3).expect("txn");
        let mut tree = BlockAddressTree::new(&mut inode, &mut cache);
        tree.get_or_create(&mut txn, MAX_FILE_BLOCKS - 1, TreeMode::Write)
            .expect("rewrite")
            .expect("leaf");
        assert_eq!(tree.lookup(MAX_FILE_BLOCKS - 2).expect("neighbour"), None);
        txn.commit().expect("commit");
        assert_eq!(inode.block_count, 3);
        fs.block_allocator().check_consistency().expect("consistent");
        fs.unmount().expect("unmount");
    }
}
