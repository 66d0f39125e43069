//! Deferred data-block assignment.
//!
//! With the dirty cache enabled, writes only reserve blocks; the logical
//! blocks stay "pending" on their vnode. The [`DataBlockAssigner`] worker
//! later turns pending blocks into real allocations, one bounded chunk per
//! transaction, so no single commit outgrows the write-back ring.
//!
//! Tasks run strictly in submission order. A sync is itself a task: it
//! runs after every allocation queued before it, then waits on a
//! write-back flush barrier. The bounded queue blocks producers when full.
//!
//! A failed allocation loses the data of its pending blocks. The first
//! such failure turns the write-back pipeline read-only and is reported to
//! every later callback, so no sync succeeds after it.
//!
//! # Logging
//!
//! - `mfs::assigner` info: worker start and exit.
//! - `mfs::assigner` trace: chunk resolved.
//! - `mfs::assigner` error: allocation failure; pending blocks abandoned.

use crate::options::AssignerConfig;
use mfs_error::{MfsError, Result};
use mfs_ondisk::POINTERS_PER_BLOCK;
use mfs_writeback::{CompletionCallback, CompletionSignal, WritebackPipeline};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, trace};

/// Something holding logical blocks that still need physical ones.
pub trait AllocationTarget: Send + Sync + 'static {
    /// Assign physical blocks to at most `max_blocks` pending blocks in one
    /// committed transaction. Returns how many remain pending.
    fn resolve_pending(self: &Arc<Self>, max_blocks: u64) -> Result<u64>;

    /// Forget every pending block after `error` made assignment impossible.
    fn abandon_pending(&self, error: &MfsError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignerState {
    Init,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignerStats {
    pub state: AssignerState,
    pub queued_tasks: usize,
    pub chunk_blocks: u64,
    pub allocations_completed: u64,
    pub allocations_failed: u64,
    pub callbacks_run: u64,
}

enum Task<T> {
    Allocate(Arc<T>),
    Callback(CompletionCallback),
}

struct Queue<T> {
    state: AssignerState,
    tasks: VecDeque<Task<T>>,
    allocations_completed: u64,
    allocations_failed: u64,
    callbacks_run: u64,
    /// First allocation failure; reported to every later callback.
    failure: Option<MfsError>,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    task_ready: Condvar,
    space_ready: Condvar,
    depth: usize,
    chunk_blocks: u64,
    writeback: Arc<WritebackPipeline>,
}

pub struct DataBlockAssigner<T: AllocationTarget> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Metadata blocks a chunk's commit writes besides bitmap blocks: the
/// superblock, the inode table block, a leaf pointer block and its
/// doubly-indirect parent.
const CHUNK_FIXED_METADATA: u64 = 4;

/// Largest chunk whose commit fits in a ring of `capacity` blocks.
///
/// A chunk of `n` blocks allocates at most `n + 2` blocks and releases at
/// most `n`, so it touches at most `min(bitmap_blocks, 2n + 2)` bitmap
/// blocks.
fn chunk_limit(capacity: u64, bitmap_blocks: u64) -> u64 {
    let spanning_every_bitmap_block = capacity.saturating_sub(CHUNK_FIXED_METADATA + bitmap_blocks);
    let one_bitmap_block_per_change = capacity.saturating_sub(CHUNK_FIXED_METADATA + 2) / 3;
    spanning_every_bitmap_block.max(one_bitmap_block_per_change)
}

impl<T: AllocationTarget> DataBlockAssigner<T> {
    /// The chunk size is capped by one pointer block, half the ring, and
    /// what the ring holds once a chunk's metadata writes are counted.
    /// `bitmap_blocks` is the size of the block bitmap.
    pub fn new(config: AssignerConfig, writeback: Arc<WritebackPipeline>, bitmap_blocks: u64) -> Result<Self> {
        if config.queue_depth == 0 || config.max_chunk_blocks == 0 {
            return Err(MfsError::InvalidArgument(
                "assigner queue depth and chunk size must be non-zero".to_owned(),
            ));
        }
        let capacity = writeback.capacity_blocks();
        let chunk_blocks = config
            .max_chunk_blocks
            .min(POINTERS_PER_BLOCK)
            .min((capacity / 2).max(1))
            .min(chunk_limit(capacity, bitmap_blocks));
        if chunk_blocks == 0 {
            return Err(MfsError::InvalidArgument(format!(
                "write-back ring of {capacity} blocks cannot hold one allocation chunk"
            )));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    state: AssignerState::Init,
                    tasks: VecDeque::new(),
                    allocations_completed: 0,
                    allocations_failed: 0,
                    callbacks_run: 0,
                    failure: None,
                }),
                task_ready: Condvar::new(),
                space_ready: Condvar::new(),
                depth: config.queue_depth,
                chunk_blocks,
                writeback,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Most blocks resolved per transaction.
    #[must_use]
    pub fn chunk_blocks(&self) -> u64 {
        self.shared.chunk_blocks
    }

    pub fn start(&self) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.state != AssignerState::Init {
            return Err(MfsError::BadState("assigner already started".to_owned()));
        }
        queue.state = AssignerState::Running;
        drop(queue);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("mfs-assigner".to_owned())
            .spawn(move || run_worker(&shared));
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.queue.lock().state = AssignerState::Init;
                Err(err.into())
            }
        }
    }

    /// Queue `target` for block assignment.
    pub fn enqueue_allocation(&self, target: Arc<T>) -> Result<()> {
        self.push(Task::Allocate(target))
    }

    /// Queue `callback`; it receives the write-back result once every task
    /// queued before it ran and its writes are durable, or the first
    /// allocation failure if there was one.
    pub fn enqueue_callback(&self, callback: CompletionCallback) -> Result<()> {
        self.push(Task::Callback(callback))
    }

    /// Block until all queued assignments ran and are durable.
    pub fn sync(&self) -> Result<()> {
        let signal = CompletionSignal::new();
        self.enqueue_callback(signal.callback())?;
        signal.wait()
    }

    fn push(&self, task: Task<T>) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        loop {
            match queue.state {
                AssignerState::Init => {
                    return Err(MfsError::BadState("assigner not started".to_owned()));
                }
                AssignerState::Stopping => {
                    return Err(MfsError::BadState("assigner is shutting down".to_owned()));
                }
                AssignerState::Running => {}
            }
            if queue.tasks.len() < self.shared.depth {
                break;
            }
            self.shared.space_ready.wait(&mut queue);
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.task_ready.notify_one();
        Ok(())
    }

    /// Run every queued task, then stop and join the worker.
    ///
    /// Later enqueues fail with [`MfsError::BadState`]. Called from the
    /// worker itself, it stops without joining.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.state == AssignerState::Stopping {
                return Ok(());
            }
            queue.state = AssignerState::Stopping;
        }
        self.shared.task_ready.notify_all();
        self.shared.space_ready.notify_all();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return Ok(());
            }
            if handle.join().is_err() {
                return Err(MfsError::BadState("assigner worker panicked".to_owned()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> AssignerStats {
        let queue = self.shared.queue.lock();
        AssignerStats {
            state: queue.state,
            queued_tasks: queue.tasks.len(),
            chunk_blocks: self.shared.chunk_blocks,
            allocations_completed: queue.allocations_completed,
            allocations_failed: queue.allocations_failed,
            callbacks_run: queue.callbacks_run,
        }
    }
}

fn run_worker<T: AllocationTarget>(shared: &Shared<T>) {
    info!(target: "mfs::assigner", chunk_blocks = shared.chunk_blocks, "assigner started");
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.state == AssignerState::Stopping {
                    info!(
                        target: "mfs::assigner",
                        completed = queue.allocations_completed,
                        failed = queue.allocations_failed,
                        "assigner exiting"
                    );
                    return;
                }
                shared.task_ready.wait(&mut queue);
            }
        };
        shared.space_ready.notify_one();

        match task {
            Task::Allocate(target) => match resolve_all(shared.chunk_blocks, &target) {
                Ok(()) => shared.queue.lock().allocations_completed += 1,
                Err(err) => {
                    shared.writeback.fail(&err);
                    let mut queue = shared.queue.lock();
                    queue.allocations_failed += 1;
                    if queue.failure.is_none() {
                        queue.failure = Some(err);
                    }
                }
            },
            Task::Callback(callback) => {
                let failure = shared.queue.lock().failure.as_ref().map(MfsError::duplicate);
                let result = match failure {
                    Some(err) => Err(err),
                    None => {
                        let signal = CompletionSignal::new();
                        shared
                            .writeback
                            .sync_with(signal.callback())
                            .and_then(|()| signal.wait())
                    }
                };
                shared.queue.lock().callbacks_run += 1;
                callback(result);
            }
        }
    }
}

fn resolve_all<T: AllocationTarget>(chunk_blocks: u64, target: &Arc<T>) -> Result<()> {
    loop {
        match target.resolve_pending(chunk_blocks) {
            Ok(0) => return Ok(()),
            Ok(left) => trace!(target: "mfs::assigner", left, "chunk resolved"),
            Err(err) => {
                error!(
                    target: "mfs::assigner",
                    error = %err,
                    "block assignment failed; abandoning pending blocks"
                );
                target.abandon_pending(&err);
                return Err(err);
            }
        }
    }
}

impl<T: AllocationTarget> fmt::Debug for DataBlockAssigner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlockAssigner")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_block::{BufferedOperation, TransactionHandler};
    use mfs_types::BlockSize;
    use mfs_writeback::WritebackConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct NullHandler;

    impl TransactionHandler for NullHandler {
        fn block_size(&self) -> BlockSize {
            BlockSize::new(512).expect("block size")
        }

        fn block_count(&self) -> u64 {
            1024
        }

        fn run_requests(&self, _operations: &[BufferedOperation]) -> Result<()> {
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Pretends to hold `pending` blocks and records every chunk size.
    struct Counter {
        pending: AtomicU64,
        chunks: parking_lot::Mutex<Vec<u64>>,
        fail_after: Option<usize>,
        abandoned: AtomicU64,
    }

    impl Counter {
        fn new(pending: u64, fail_after: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                pending: AtomicU64::new(pending),
                chunks: parking_lot::Mutex::new(Vec::new()),
                fail_after,
                abandoned: AtomicU64::new(0),
            })
        }
    }

    impl AllocationTarget for Counter {
        fn resolve_pending(self: &Arc<Self>, max_blocks: u64) -> Result<u64> {
            let mut chunks = self.chunks.lock();
            if self.fail_after == Some(chunks.len()) {
                return Err(MfsError::NoSpace);
            }
            let pending = self.pending.load(Ordering::SeqCst);
            let chunk = pending.min(max_blocks);
            chunks.push(chunk);
            self.pending.store(pending - chunk, Ordering::SeqCst);
            Ok(pending - chunk)
        }

        fn abandon_pending(&self, _error: &MfsError) {
            let left = self.pending.swap(0, Ordering::SeqCst);
            self.abandoned.store(left, Ordering::SeqCst);
        }
    }

    fn assigner(config: AssignerConfig, ring: usize) -> (Arc<WritebackPipeline>, DataBlockAssigner<Counter>) {
        let pipeline = WritebackPipeline::new(
            Arc::new(NullHandler),
            WritebackConfig {
                capacity_blocks: ring,
            },
        )
        .expect("pipeline");
        pipeline.start().expect("start pipeline");
        let assigner = DataBlockAssigner::new(config, Arc::clone(&pipeline), 1).expect("assigner");
        (pipeline, assigner)
    }

    #[test]
    fn chunk_is_capped_by_half_the_ring() {
        let (pipeline, assigner) = assigner(AssignerConfig::default(), 64);
        assert_eq!(assigner.chunk_blocks(), 32);
        pipeline.shutdown().expect("shutdown");

        let (pipeline, assigner) = assigner_with_chunk(10);
        assert_eq!(assigner.chunk_blocks(), 10);
        pipeline.shutdown().expect("shutdown");
    }

    fn assigner_with_chunk(max_chunk_blocks: u64) -> (Arc<WritebackPipeline>, DataBlockAssigner<Counter>) {
        assigner(
            AssignerConfig {
                max_chunk_blocks,
                ..AssignerConfig::default()
            },
            4096,
        )
    }

    #[test]
    fn chunk_leaves_room_for_commit_metadata() {
        let (pipeline, assigner) = assigner(AssignerConfig::default(), 8);
        // 3 data + 2 pointer + inode table + superblock + 1 bitmap block.
        assert_eq!(assigner.chunk_blocks(), 3);
        pipeline.shutdown().expect("shutdown");

        assert_eq!(chunk_limit(12, 50), 2);
        assert_eq!(chunk_limit(64, 1), 59);

        let pipeline = WritebackPipeline::new(Arc::new(NullHandler), WritebackConfig { capacity_blocks: 8 })
            .expect("pipeline");
        let err = DataBlockAssigner::<Counter>::new(AssignerConfig::default(), pipeline, 4)
            .expect_err("ring too small");
        assert!(matches!(err, MfsError::InvalidArgument(_)));
    }

    #[test]
    fn zero_depth_is_rejected() {
        let pipeline = WritebackPipeline::new(Arc::new(NullHandler), WritebackConfig::default())
            .expect("pipeline");
        let err = DataBlockAssigner::<Counter>::new(
            AssignerConfig {
                queue_depth: 0,
                ..AssignerConfig::default()
            },
            pipeline,
            1,
        )
        .expect_err("zero depth");
        assert!(matches!(err, MfsError::InvalidArgument(_)));
    }

    #[test]
    fn allocation_is_resolved_in_chunks_before_sync_returns() {
        let (pipeline, assigner) = assigner_with_chunk(10);
        assigner.start().expect("start");
        let target = Counter::new(25, None);
        assigner.enqueue_allocation(Arc::clone(&target)).expect("enqueue");
        assigner.sync().expect("sync");
        assert_eq!(*target.chunks.lock(), vec![10, 10, 5]);
        assert_eq!(target.pending.load(Ordering::SeqCst), 0);

        let stats = assigner.stats();
        assert_eq!(stats.allocations_completed, 1);
        assert_eq!(stats.callbacks_run, 1);
        assigner.shutdown().expect("shutdown");
        pipeline.shutdown().expect("shutdown pipeline");
    }

    #[test]
    fn failure_abandons_pending_blocks_and_fails_every_later_sync() {
        let (pipeline, assigner) = assigner_with_chunk(10);
        assigner.start().expect("start");
        let target = Counter::new(25, Some(1));
        assigner.enqueue_allocation(Arc::clone(&target)).expect("enqueue");
        assert!(matches!(assigner.sync(), Err(MfsError::NoSpace)));
        assert_eq!(target.abandoned.load(Ordering::SeqCst), 15);
        assert_eq!(assigner.stats().allocations_failed, 1);
        assert!(pipeline.is_read_only());

        let healthy = Counter::new(5, None);
        assigner.enqueue_allocation(Arc::clone(&healthy)).expect("enqueue");
        assert!(matches!(assigner.sync(), Err(MfsError::NoSpace)));
        assigner.shutdown().expect("shutdown");
        assert!(matches!(pipeline.shutdown(), Err(MfsError::ReadOnly)));
    }

    #[test]
    fn lifecycle_errors() {
        let (pipeline, assigner) = assigner(AssignerConfig::default(), 64);
        let err = assigner
            .enqueue_allocation(Counter::new(1, None))
            .expect_err("not started");
        assert!(matches!(err, MfsError::BadState(_)));
        assigner.start().expect("start");
        assert!(matches!(assigner.start(), Err(MfsError::BadState(_))));
        assigner.shutdown().expect("shutdown");
        assigner.shutdown().expect("second shutdown is a no-op");
        let err = assigner.sync().expect_err("stopped");
        assert!(matches!(err, MfsError::BadState(_)));
        assert_eq!(assigner.stats().state, AssignerState::Stopping);
        pipeline.shutdown().expect("shutdown pipeline");
    }
}
