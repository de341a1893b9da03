//! The sharded deduction stream: producer, consumer-group drain, and
//! cleanup/monitoring over redis streams.

mod cleanup;
mod consumer;
mod producer;

pub use cleanup::{CleanupReport, StreamCleaner, StreamStats};
pub use consumer::{ShardConsumer, ShardState, WriteRequest};
pub use producer::DeductionStream;
