//! Asynchronous write-back pipeline.
//!
//! Committed transactions arrive as [`WritebackWork`]. `enqueue` copies
//! their payloads into a fixed-size [`BlockRing`] and appends them to a
//! FIFO queue; a single background worker applies queued work to the
//! device in order and then frees its ring space.
//!
//! ## Producer fairness
//!
//! A producer that finds too little ring space (or anyone already waiting)
//! joins a FIFO of waiters, each with its own condition variable. Only the
//! head waiter is woken when space frees; once it has claimed its space it
//! wakes the next one. A later, smaller work item never overtakes an
//! earlier, larger one.
//!
//! ## Failure
//!
//! The first device error turns the pipeline read-only for good. Every
//! blocked producer is woken; work enqueued afterwards is still recorded
//! and completes with [`MfsError::ReadOnly`] without touching the device.
//! A failure outside the device path (a transaction that could not be
//! built) reaches the same state through [`WritebackPipeline::fail`].
//!
//! # Logging
//!
//! - `mfs::writeback` info: worker start and exit.
//! - `mfs::writeback` debug: producer waits for ring space; shutdown from the worker.
//! - `mfs::writeback` trace: work enqueued and completed.
//! - `mfs::writeback` warn: work recorded while read-only.
//! - `mfs::writeback` error: device failure and the read-only transition.

use crate::ring::BlockRing;
use crate::work::{Completion, CompletionCallback, CompletionSignal, WritebackWork};
use mfs_block::{BufferedOperation, TransactionHandler};
use mfs_error::{MfsError, Result};
use mfs_types::TxnId;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Write-back pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritebackConfig {
    /// Ring capacity in filesystem blocks.
    /// Default: 2048.
    pub capacity_blocks: usize,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Init,
    Running,
    /// Terminal: a device write failed.
    ReadOnly,
    /// Draining before the worker exits.
    Unmounting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub capacity_blocks: u64,
    pub used_blocks: u64,
    pub queued_work: usize,
    pub waiting_producers: usize,
    pub completed_work: u64,
    pub failed_work: u64,
    pub blocks_written: u64,
}

struct Waiter {
    blocks: u64,
    condvar: Condvar,
}

struct QueuedWork {
    txn: Option<TxnId>,
    data: Vec<BufferedOperation>,
    metadata: Vec<BufferedOperation>,
    blocks: u64,
    flush: bool,
    completion: Completion,
    /// Recorded while read-only; completes with an error and no I/O.
    rejected: bool,
}

struct Inner {
    state: PipelineState,
    shutting_down: bool,
    ring: BlockRing,
    queue: VecDeque<QueuedWork>,
    waiters: VecDeque<Arc<Waiter>>,
    completed: u64,
    failed: u64,
    blocks_written: u64,
}

pub struct WritebackPipeline {
    handler: Arc<dyn TransactionHandler>,
    inner: Mutex<Inner>,
    work_ready: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WritebackPipeline {
    pub fn new(handler: Arc<dyn TransactionHandler>, config: WritebackConfig) -> Result<Arc<Self>> {
        if config.capacity_blocks == 0 {
            return Err(MfsError::InvalidArgument(
                "write-back ring capacity must be non-zero".to_owned(),
            ));
        }
        let ring = BlockRing::new(config.capacity_blocks, handler.block_size());
        Ok(Arc::new(Self {
            handler,
            inner: Mutex::new(Inner {
                state: PipelineState::Init,
                shutting_down: false,
                ring,
                queue: VecDeque::new(),
                waiters: VecDeque::new(),
                completed: 0,
                failed: 0,
                blocks_written: 0,
            }),
            work_ready: Condvar::new(),
            worker: Mutex::new(None),
        }))
    }

    /// Spawn the worker: `Init -> Running`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != PipelineState::Init || inner.shutting_down {
            return Err(MfsError::BadState(
                "write-back pipeline already started".to_owned(),
            ));
        }
        inner.state = PipelineState::Running;
        drop(inner);

        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("mfs-writeback".to_owned())
            .spawn(move || this.run_worker());
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.inner.lock().state = PipelineState::Init;
                Err(err.into())
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.state() == PipelineState::ReadOnly
    }

    #[must_use]
    pub fn capacity_blocks(&self) -> u64 {
        self.inner.lock().ring.capacity()
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let inner = self.inner.lock();
        PipelineStats {
            state: inner.state,
            capacity_blocks: inner.ring.capacity(),
            used_blocks: inner.ring.used(),
            queued_work: inner.queue.len(),
            waiting_producers: inner.waiters.len(),
            completed_work: inner.completed,
            failed_work: inner.failed,
            blocks_written: inner.blocks_written,
        }
    }

    /// Copy `work` into the ring and queue it behind everything enqueued
    /// before it. Blocks while the ring lacks space for it.
    pub fn enqueue(&self, work: WritebackWork) -> Result<()> {
        let blocks = work.block_count();
        let mut inner = self.inner.lock();
        if blocks > inner.ring.capacity() {
            return Err(MfsError::InvalidArgument(format!(
                "work of {blocks} blocks exceeds write-back capacity {}",
                inner.ring.capacity()
            )));
        }
        if inner.state == PipelineState::Init {
            return Err(MfsError::BadState(
                "write-back pipeline not started".to_owned(),
            ));
        }
        if inner.shutting_down {
            return Err(MfsError::BadState(
                "write-back pipeline is shutting down".to_owned(),
            ));
        }
        let parts = work.into_parts();

        if inner.state != PipelineState::ReadOnly
            && (!inner.waiters.is_empty() || inner.ring.free() < blocks)
        {
            let waiter = Arc::new(Waiter {
                blocks,
                condvar: Condvar::new(),
            });
            inner.waiters.push_back(Arc::clone(&waiter));
            debug!(
                target: "mfs::writeback",
                txn = ?parts.txn,
                blocks,
                free = inner.ring.free(),
                ahead = inner.waiters.len() - 1,
                "waiting for ring space"
            );
            loop {
                let at_front = inner
                    .waiters
                    .front()
                    .is_some_and(|w| Arc::ptr_eq(w, &waiter));
                if inner.state == PipelineState::ReadOnly
                    || (at_front && inner.ring.free() >= waiter.blocks)
                {
                    break;
                }
                waiter.condvar.wait(&mut inner);
            }
            inner.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
            if let Some(next) = inner.waiters.front() {
                next.condvar.notify_one();
            }
        }

        let queued = if inner.state == PipelineState::ReadOnly {
            warn!(target: "mfs::writeback", txn = ?parts.txn, blocks, "work recorded while read-only");
            QueuedWork {
                txn: parts.txn,
                data: Vec::new(),
                metadata: Vec::new(),
                blocks: 0,
                flush: false,
                completion: parts.completion,
                rejected: true,
            }
        } else {
            let mut staged = inner
                .ring
                .stage_groups(&[parts.data.as_slice(), parts.metadata.as_slice()])?
                .into_iter();
            QueuedWork {
                txn: parts.txn,
                data: staged.next().unwrap_or_default(),
                metadata: staged.next().unwrap_or_default(),
                blocks,
                flush: parts.flush,
                completion: parts.completion,
                rejected: false,
            }
        };
        trace!(target: "mfs::writeback", txn = ?queued.txn, blocks, "enqueued");
        inner.queue.push_back(queued);
        drop(inner);
        self.work_ready.notify_one();
        Ok(())
    }

    /// Queue a flush barrier; `callback` runs once all prior work is durable.
    pub fn sync_with(&self, callback: CompletionCallback) -> Result<()> {
        let mut work = WritebackWork::new();
        work.request_flush();
        work.on_complete(callback);
        self.enqueue(work)
    }

    /// Block until everything enqueued so far is durable.
    pub fn sync(&self) -> Result<()> {
        let signal = CompletionSignal::new();
        self.sync_with(signal.callback())?;
        signal.wait()
    }

    /// Turn a running pipeline read-only after a failure it did not see.
    ///
    /// Work still queued completes with [`MfsError::ReadOnly`].
    pub fn fail(&self, cause: &MfsError) {
        let mut inner = self.inner.lock();
        if inner.state != PipelineState::Running {
            return;
        }
        error!(target: "mfs::writeback", error = %cause, "filesystem is now read-only");
        inner.state = PipelineState::ReadOnly;
        for waiter in &inner.waiters {
            waiter.condvar.notify_one();
        }
    }

    /// Drain queued work, flush, and join the worker.
    ///
    /// Later enqueues fail with [`MfsError::BadState`]. Returns
    /// [`MfsError::ReadOnly`] if the pipeline had failed. Called from the
    /// worker itself (a completion dropping the last owner), it queues the
    /// final flush and returns without waiting.
    pub fn shutdown(&self) -> Result<()> {
        let on_worker = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id());
        let state = {
            let inner = self.inner.lock();
            if inner.shutting_down {
                return Ok(());
            }
            inner.state
        };
        let flushed = match state {
            PipelineState::Running if on_worker => self.sync_with(Box::new(|_| ())),
            PipelineState::Running => self.sync(),
            PipelineState::ReadOnly => Err(MfsError::ReadOnly),
            PipelineState::Init | PipelineState::Unmounting => Ok(()),
        };
        {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            if matches!(inner.state, PipelineState::Init | PipelineState::Running) {
                inner.state = PipelineState::Unmounting;
            }
        }
        self.work_ready.notify_all();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if on_worker {
                debug!(target: "mfs::writeback", "shutdown requested by the worker; not joining");
                return flushed;
            }
            if handle.join().is_err() {
                return Err(MfsError::BadState("write-back worker panicked".to_owned()));
            }
        }
        flushed
    }

    fn run_worker(&self) {
        info!(target: "mfs::writeback", capacity = self.capacity_blocks(), "write-back worker started");
        loop {
            let mut inner = self.inner.lock();
            let item = loop {
                if let Some(item) = inner.queue.pop_front() {
                    break item;
                }
                if inner.shutting_down && inner.waiters.is_empty() {
                    info!(
                        target: "mfs::writeback",
                        completed = inner.completed,
                        failed = inner.failed,
                        "write-back worker exiting"
                    );
                    return;
                }
                self.work_ready.wait(&mut inner);
            };
            let read_only = inner.state == PipelineState::ReadOnly;
            drop(inner);

            let result = if item.rejected || read_only {
                Err(MfsError::ReadOnly)
            } else {
                self.execute(&item)
            };

            let mut inner = self.inner.lock();
            inner.ring.release(item.blocks);
            match &result {
                Ok(()) => {
                    inner.completed += 1;
                    inner.blocks_written += item.blocks;
                    trace!(target: "mfs::writeback", txn = ?item.txn, blocks = item.blocks, "completed");
                }
                Err(err) => {
                    inner.failed += 1;
                    if inner.state != PipelineState::ReadOnly {
                        error!(
                            target: "mfs::writeback",
                            txn = ?item.txn,
                            error = %err,
                            "write-back failed; filesystem is now read-only"
                        );
                        inner.state = PipelineState::ReadOnly;
                        for waiter in &inner.waiters {
                            waiter.condvar.notify_one();
                        }
                    }
                }
            }
            if let Some(front) = inner.waiters.front() {
                front.condvar.notify_one();
            }
            drop(inner);
            item.completion.finish(&result);
        }
    }

    fn execute(&self, item: &QueuedWork) -> Result<()> {
        if !item.data.is_empty() {
            self.handler.run_requests(&item.data)?;
            if !item.metadata.is_empty() {
                self.handler.flush()?;
            }
        }
        if !item.metadata.is_empty() {
            self.handler.run_requests(&item.metadata)?;
        }
        if item.flush {
            self.handler.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WritebackPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritebackPipeline")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_partial_json() {
        assert_eq!(WritebackConfig::default().capacity_blocks, 2048);
        let config: WritebackConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, WritebackConfig::default());
        let config: WritebackConfig =
            serde_json::from_str(r#"{"capacity_blocks": 16}"#).expect("parse");
        assert_eq!(config.capacity_blocks, 16);
    }
}
