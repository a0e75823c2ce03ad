//! foursight-queue: at-least-once work queues and queue deduplication.

pub mod dedup;
mod error;
mod memory;
mod queue;

pub use dedup::{deduplicate, DedupOptions, DedupReport, StopReason};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use queue::{Message, QueuePair, QueueStats, SendOptions, WorkQueue};
