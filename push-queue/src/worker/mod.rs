//! Background dequeue worker.

mod backoff;
mod dequeue;

pub use backoff::Backoff;
pub use dequeue::{DequeueWorker, WorkerStats, WorkerStatsSnapshot};
