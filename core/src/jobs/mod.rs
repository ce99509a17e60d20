pub mod admission;
pub mod backoff;
pub mod queue;
pub mod retry;

pub use queue::{Job, JobQueue, QueuePriority};
