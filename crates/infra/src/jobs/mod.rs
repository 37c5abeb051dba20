//! Background job system with retry, backoff and dead-letter handoff.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and carry an opaque JSON payload fixed at enqueue
//! - Retry policy with exponential backoff, priority tiers, delayed jobs
//! - Claims carry a lease; expired leases are re-queued (at-least-once)
//! - Terminal failures are handed to a `DeadLetterSink`
//! - Every transition is published as a `QueueEvent`
//!
//! ## Components
//!
//! - `Job`: Core job abstraction with payload and metadata
//! - `JobStore`: Persistence for jobs (in-memory for now)
//! - `JobQueue`: enqueue / claim / ack, events and wakeups
//! - `JobExecutor`: Runs jobs from one queue on a tokio worker pool

pub mod executor;
pub mod queue;
pub mod store;
pub mod throttle;
pub mod types;

pub use executor::{
    DeadLetterSink, ExecutorStats, JobExecutor, JobHandler, WorkerConfig, WorkerPoolHandle,
    handler_fn,
};
pub use queue::{JobQueue, JobQueueError, QueueConfig, QueueEvent, QueueEventKind};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    BackoffPolicy, BackoffStrategy, FailureDisposition, Job, JobAttemptRecord, JobCounts,
    JobHandle, JobId, JobOptions, JobOutcome, JobState,
};
