//! NgasihTau background encryption jobs: durable lifecycle management,
//! priority dispatch over an abstract queue, and a bounded worker pool with
//! exponential-backoff retries and per-job timeouts.

pub mod manager;
pub mod queue;
pub mod worker;

pub use manager::{JobManager, JobManagerConfig, JobManagerStats, JobOutcome};
pub use queue::{JobQueue, PollingQueue};
pub use worker::{WorkerPool, WorkerPoolConfig};
