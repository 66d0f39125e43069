#![forbid(unsafe_code)]
//! Write-back pipeline ordering, flow control and failure handling.

use mfs_block::{
    BlockBuffer, BufferedOperation, Operation, PendingWork, TransactionHandler,
    UnbufferedOperation,
};
use mfs_error::{MfsError, Result};
use mfs_types::BlockSize;
use mfs_writeback::{
    CompletionSignal, PipelineState, WritebackConfig, WritebackPipeline, WritebackWork,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Write { dev_offset: u64, length: u64, first_byte: u8 },
    Flush,
}

/// Records every request; can hold requests at a gate and fail one offset.
struct ScriptedHandler {
    block_size: BlockSize,
    events: Mutex<Vec<Event>>,
    gate_closed: Mutex<bool>,
    gate: Condvar,
    fail_at: Mutex<Option<u64>>,
}

impl ScriptedHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            block_size: BlockSize::new(512).expect("block size"),
            events: Mutex::new(Vec::new()),
            gate_closed: Mutex::new(false),
            gate: Condvar::new(),
            fail_at: Mutex::new(None),
        })
    }

    fn close_gate(&self) {
        *self.gate_closed.lock() = true;
    }

    fn open_gate(&self) {
        *self.gate_closed.lock() = false;
        self.gate.notify_all();
    }

    fn fail_writes_to(&self, dev_offset: u64) {
        *self.fail_at.lock() = Some(dev_offset);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn writes(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Write { dev_offset, .. } => Some(dev_offset),
                Event::Flush => None,
            })
            .collect()
    }

    /// Fill byte of each write, with runs from split operations collapsed.
    fn write_fills(&self) -> Vec<u8> {
        let mut fills: Vec<u8> = self
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Write { first_byte, .. } => Some(first_byte),
                Event::Flush => None,
            })
            .collect();
        fills.dedup();
        fills
    }
}

impl TransactionHandler for ScriptedHandler {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        1 << 20
    }

    fn run_requests(&self, operations: &[BufferedOperation]) -> Result<()> {
        let mut closed = self.gate_closed.lock();
        while *closed {
            self.gate.wait(&mut closed);
        }
        drop(closed);
        for operation in operations {
            if *self.fail_at.lock() == Some(operation.op.dev_offset) {
                return Err(MfsError::Io(std::io::Error::other("injected write failure")));
            }
            let first_byte = operation
                .buffer
                .read_blocks(operation.op.vmo_offset as usize, 1)?[0];
            self.events.lock().push(Event::Write {
                dev_offset: operation.op.dev_offset,
                length: operation.op.length,
                first_byte,
            });
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.events.lock().push(Event::Flush);
        Ok(())
    }
}

fn pipeline(handler: &Arc<ScriptedHandler>, capacity_blocks: usize) -> Arc<WritebackPipeline> {
    let pipeline = WritebackPipeline::new(
        Arc::clone(handler) as Arc<dyn TransactionHandler>,
        WritebackConfig { capacity_blocks },
    )
    .expect("pipeline");
    pipeline.start().expect("start");
    pipeline
}

fn buffer(blocks: usize, fill: u8) -> BlockBuffer {
    let buf = BlockBuffer::new(blocks, BlockSize::new(512).expect("block size"));
    buf.with_bytes_mut(|b| b.fill(fill));
    buf
}

fn data_work(dev_offset: u64, blocks: usize, fill: u8) -> WritebackWork {
    let mut work = WritebackWork::new();
    work.enqueue_data(UnbufferedOperation {
        vmo: buffer(blocks, fill),
        op: Operation::write(0, dev_offset, blocks as u64),
    });
    work
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn producers_wait_in_fifo_order_for_ring_space() {
    let handler = ScriptedHandler::new();
    handler.close_gate();
    let pipeline = pipeline(&handler, 16);

    pipeline.enqueue(data_work(100, 10, 1)).expect("first work fits");

    let second = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.enqueue(data_work(200, 10, 2)))
    };
    wait_until("second producer to wait", || pipeline.stats().waiting_producers == 1);

    let third_done = Arc::new(AtomicBool::new(false));
    let third = {
        let pipeline = Arc::clone(&pipeline);
        let done = Arc::clone(&third_done);
        thread::spawn(move || {
            let result = pipeline.enqueue(data_work(300, 4, 3));
            done.store(true, Ordering::SeqCst);
            result
        })
    };
    wait_until("third producer to queue behind", || pipeline.stats().waiting_producers == 2);
    assert!(
        !third_done.load(Ordering::SeqCst),
        "a work item that fits must still wait behind an earlier waiter"
    );

    handler.open_gate();
    second.join().expect("join").expect("second enqueue");
    third.join().expect("join").expect("third enqueue");
    pipeline.sync().expect("sync");

    assert_eq!(handler.write_fills(), vec![1, 2, 3]);
    let stats = pipeline.stats();
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.blocks_written, 24);
    pipeline.shutdown().expect("shutdown");
}

#[test]
fn data_is_flushed_before_metadata() {
    let handler = ScriptedHandler::new();
    let pipeline = pipeline(&handler, 16);

    let mut work = WritebackWork::new();
    work.enqueue_metadata(UnbufferedOperation {
        vmo: buffer(1, 8),
        op: Operation::write(0, 5, 1),
    });
    work.enqueue_data(UnbufferedOperation {
        vmo: buffer(2, 9),
        op: Operation::write(0, 50, 2),
    });
    pipeline.enqueue(work).expect("enqueue");
    pipeline.sync().expect("sync");

    assert_eq!(
        handler.events(),
        vec![
            Event::Write { dev_offset: 50, length: 2, first_byte: 9 },
            Event::Flush,
            Event::Write { dev_offset: 5, length: 1, first_byte: 8 },
            Event::Flush,
        ]
    );
    pipeline.shutdown().expect("shutdown");
}

#[test]
fn payload_is_captured_at_enqueue() {
    let handler = ScriptedHandler::new();
    handler.close_gate();
    let pipeline = pipeline(&handler, 16);

    let source = buffer(1, 7);
    let mut work = WritebackWork::new();
    work.enqueue_data(UnbufferedOperation {
        vmo: source.clone(),
        op: Operation::write(0, 40, 1),
    });
    pipeline.enqueue(work).expect("enqueue");
    source.with_bytes_mut(|b| b.fill(9));

    handler.open_gate();
    pipeline.sync().expect("sync");
    assert_eq!(
        handler.events()[0],
        Event::Write { dev_offset: 40, length: 1, first_byte: 7 }
    );
    pipeline.shutdown().expect("shutdown");
}

#[test]
fn ring_wraps_without_corrupting_payloads() {
    let handler = ScriptedHandler::new();
    let pipeline = pipeline(&handler, 16);
    for k in 1..=5_u8 {
        pipeline
            .enqueue(data_work(1000 * u64::from(k), 6, k))
            .expect("enqueue");
    }
    pipeline.sync().expect("sync");

    let mut per_fill = [0_u64; 6];
    for event in handler.events() {
        if let Event::Write { dev_offset, length, first_byte } = event {
            assert_eq!(u64::from(first_byte), dev_offset / 1000);
            per_fill[first_byte as usize] += length;
        }
    }
    assert_eq!(per_fill[1..], [6, 6, 6, 6, 6]);
    pipeline.shutdown().expect("shutdown");
}

#[test]
fn pins_are_released_after_completion() {
    let handler = ScriptedHandler::new();
    let pipeline = pipeline(&handler, 16);
    let pin: Arc<dyn std::any::Any + Send + Sync> = Arc::new(String::from("vnode"));
    let mut work = data_work(10, 1, 1);
    work.pin(Arc::clone(&pin));
    pipeline.enqueue(work).expect("enqueue");
    pipeline.sync().expect("sync");
    assert_eq!(Arc::strong_count(&pin), 1);
    pipeline.shutdown().expect("shutdown");
}

#[test]
fn write_failure_turns_pipeline_read_only() {
    let handler = ScriptedHandler::new();
    handler.fail_writes_to(500);
    let pipeline = pipeline(&handler, 16);

    let failed = CompletionSignal::new();
    let mut work = data_work(500, 2, 1);
    work.on_complete(failed.callback());
    pipeline.enqueue(work).expect("enqueue");
    assert!(matches!(failed.wait(), Err(MfsError::Io(_))));
    assert_eq!(pipeline.state(), PipelineState::ReadOnly);

    let skipped = CompletionSignal::new();
    let mut work = data_work(600, 1, 2);
    work.on_complete(skipped.callback());
    pipeline.enqueue(work).expect("recorded while read-only");
    assert!(matches!(skipped.wait(), Err(MfsError::ReadOnly)));
    assert!(matches!(pipeline.sync(), Err(MfsError::ReadOnly)));

    assert!(handler.writes().is_empty());
    assert!(pipeline.stats().failed_work >= 2);
    assert!(matches!(pipeline.shutdown(), Err(MfsError::ReadOnly)));
}

#[test]
fn failure_outside_the_device_turns_pipeline_read_only() {
    let handler = ScriptedHandler::new();
    let pipeline = pipeline(&handler, 16);
    pipeline.enqueue(data_work(100, 1, 1)).expect("enqueue");
    pipeline.sync().expect("sync before the failure");

    pipeline.fail(&MfsError::NoSpace);
    assert_eq!(pipeline.state(), PipelineState::ReadOnly);
    pipeline.fail(&MfsError::NoSpace);

    let skipped = CompletionSignal::new();
    let mut work = data_work(200, 1, 2);
    work.on_complete(skipped.callback());
    pipeline.enqueue(work).expect("recorded while read-only");
    assert!(matches!(skipped.wait(), Err(MfsError::ReadOnly)));
    assert_eq!(handler.writes(), vec![100]);
    assert!(matches!(pipeline.shutdown(), Err(MfsError::ReadOnly)));
}

#[test]
fn read_only_transition_releases_blocked_producers() {
    let handler = ScriptedHandler::new();
    handler.close_gate();
    handler.fail_writes_to(500);
    let pipeline = pipeline(&handler, 16);

    pipeline.enqueue(data_work(500, 10, 1)).expect("enqueue");
    let blocked = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || {
            let signal = CompletionSignal::new();
            let mut work = data_work(700, 10, 2);
            work.on_complete(signal.callback());
            pipeline.enqueue(work).map(|()| signal)
        })
    };
    wait_until("producer to block", || pipeline.stats().waiting_producers == 1);

    handler.open_gate();
    let signal = blocked.join().expect("join").expect("enqueue returns");
    assert!(matches!(signal.wait(), Err(MfsError::ReadOnly)));
    assert!(pipeline.is_read_only());
    let _ = pipeline.shutdown();
}

#[test]
fn lifecycle_errors() {
    let handler = ScriptedHandler::new();
    let pipeline = WritebackPipeline::new(
        Arc::clone(&handler) as Arc<dyn TransactionHandler>,
        WritebackConfig { capacity_blocks: 8 },
    )
    .expect("pipeline");
    assert!(matches!(
        pipeline.enqueue(data_work(1, 1, 1)),
        Err(MfsError::BadState(_))
    ));
    pipeline.start().expect("start");
    assert!(matches!(pipeline.start(), Err(MfsError::BadState(_))));
    assert!(matches!(
        pipeline.enqueue(data_work(1, 9, 1)),
        Err(MfsError::InvalidArgument(_))
    ));

    pipeline.enqueue(data_work(1, 8, 1)).expect("exactly capacity");
    pipeline.shutdown().expect("shutdown");
    assert_eq!(pipeline.state(), PipelineState::Unmounting);
    assert_eq!(handler.writes(), vec![1]);
    assert!(matches!(
        pipeline.enqueue(data_work(1, 1, 1)),
        Err(MfsError::BadState(_))
    ));
    pipeline.shutdown().expect("second shutdown is a no-op");
    assert!(WritebackPipeline::new(
        handler as Arc<dyn TransactionHandler>,
        WritebackConfig { capacity_blocks: 0 }
    )
    .is_err());
}
