#![forbid(unsafe_code)]
//! Write-back pipeline.
//!
//! | Module | Role |
//! |--------|------|
//! | [`ring`] | fixed-capacity ring of blocks that holds copies of staged payloads |
//! | [`work`] | [`WritebackWork`], completion callbacks and pins |
//! | [`pipeline`] | [`WritebackPipeline`]: producer flow control and the ordered worker |
//!
//! Ordering guarantees:
//!
//! - work reaches the device in enqueue order;
//! - within one work item, data writes are flushed before metadata writes
//!   are issued;
//! - a flush request completes only after every earlier work item.

pub mod pipeline;
pub mod ring;
pub mod work;

pub use pipeline::{PipelineState, PipelineStats, WritebackConfig, WritebackPipeline};
pub use ring::BlockRing;
pub use work::{CompletionCallback, CompletionSignal, Pinned, WritebackWork};
