//! Units of write-back work and completion signalling.

use mfs_block::{PendingWork, UnbufferedOperation, WriteBatch};
use mfs_error::{MfsError, Result};
use mfs_types::TxnId;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Invoked once with the outcome of the work it is attached to.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Reference kept alive until the work is durable or has failed.
pub type Pinned = Arc<dyn Any + Send + Sync>;

/// One committed transaction's operations, as handed to the pipeline.
#[derive(Default)]
pub struct WritebackWork {
    txn: Option<TxnId>,
    data: Vec<UnbufferedOperation>,
    metadata: Vec<UnbufferedOperation>,
    pinned: Vec<Pinned>,
    callbacks: Vec<CompletionCallback>,
    flush: bool,
}

impl WritebackWork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Work carrying a transaction's staged writes.
    #[must_use]
    pub fn from_batch(txn: TxnId, batch: WriteBatch) -> Self {
        let (data, metadata) = batch.into_parts();
        Self {
            txn: Some(txn),
            data,
            metadata,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn txn(&self) -> Option<TxnId> {
        self.txn
    }

    /// Blocks of ring space this work needs.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.data
            .iter()
            .chain(&self.metadata)
            .map(|o| o.op.length)
            .sum()
    }

    pub fn pin(&mut self, reference: Pinned) {
        self.pinned.push(reference);
    }

    pub fn on_complete(&mut self, callback: CompletionCallback) {
        self.callbacks.push(callback);
    }

    /// Flush the device after this work's writes.
    pub fn request_flush(&mut self) {
        self.flush = true;
    }

    pub(crate) fn into_parts(self) -> WorkParts {
        WorkParts {
            txn: self.txn,
            data: self.data,
            metadata: self.metadata,
            completion: Completion {
                pinned: self.pinned,
                callbacks: self.callbacks,
            },
            flush: self.flush,
        }
    }
}

impl PendingWork for WritebackWork {
    fn enqueue_metadata(&mut self, operation: UnbufferedOperation) {
        if operation.op.length > 0 {
            self.metadata.push(operation);
        }
    }

    fn enqueue_data(&mut self, operation: UnbufferedOperation) {
        if operation.op.length > 0 {
            self.data.push(operation);
        }
    }
}

impl fmt::Debug for WritebackWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritebackWork")
            .field("txn", &self.txn)
            .field("data_ops", &self.data.len())
            .field("metadata_ops", &self.metadata.len())
            .field("blocks", &self.block_count())
            .field("pinned", &self.pinned.len())
            .field("callbacks", &self.callbacks.len())
            .field("flush", &self.flush)
            .finish()
    }
}

pub(crate) struct WorkParts {
    pub txn: Option<TxnId>,
    pub data: Vec<UnbufferedOperation>,
    pub metadata: Vec<UnbufferedOperation>,
    pub completion: Completion,
    pub flush: bool,
}

/// Callbacks and pins released together once work finishes.
#[derive(Default)]
pub(crate) struct Completion {
    pinned: Vec<Pinned>,
    callbacks: Vec<CompletionCallback>,
}

impl Completion {
    /// Run every callback with `result`, then drop the pins.
    pub fn finish(self, result: &Result<()>) {
        for callback in self.callbacks {
            callback(result.as_ref().map(|_| ()).map_err(MfsError::duplicate));
        }
        drop(self.pinned);
    }
}

/// One-shot result slot a caller can block on.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    result: Mutex<Option<Result<()>>>,
    condvar: Condvar,
}

impl CompletionSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.condvar.notify_all();
    }

    /// Callback that completes this signal.
    #[must_use]
    pub fn callback(self: &Arc<Self>) -> CompletionCallback {
        let signal = Arc::clone(self);
        Box::new(move |result| signal.complete(result))
    }

    /// Block until completed and take the result.
    pub fn wait(&self) -> Result<()> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.condvar.wait(&mut slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfs_block::{BlockBuffer, Operation};
    use mfs_types::BlockSize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn block_count_covers_both_lists() {
        let buf = BlockBuffer::new(4, BlockSize::new(512).expect("bs"));
        let mut batch = WriteBatch::new();
        batch.enqueue_data(UnbufferedOperation {
            vmo: buf.clone(),
            op: Operation::write(0, 50, 3),
        });
        batch.enqueue_metadata(UnbufferedOperation {
            vmo: buf,
            op: Operation::write(3, 2, 1),
        });
        let work = WritebackWork::from_batch(TxnId(9), batch);
        assert_eq!(work.block_count(), 4);
        assert_eq!(work.txn(), Some(TxnId(9)));
    }

    #[test]
    fn completion_runs_every_callback_and_releases_pins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pin: Arc<dyn Any + Send + Sync> = Arc::new(5_u32);
        let mut work = WritebackWork::new();
        work.pin(Arc::clone(&pin));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            work.on_complete(Box::new(move |result| {
                assert!(matches!(result, Err(MfsError::ReadOnly)));
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(Arc::strong_count(&pin), 2);
        work.into_parts().completion.finish(&Err(MfsError::ReadOnly));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(Arc::strong_count(&pin), 1);
    }

    #[test]
    fn signal_delivers_result_across_threads() {
        let signal = CompletionSignal::new();
        let callback = signal.callback();
        let handle = std::thread::spawn(move || callback(Ok(())));
        signal.wait().expect("completed ok");
        handle.join().expect("join");
    }
}
