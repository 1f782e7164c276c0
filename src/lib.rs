//! Redis-backed job queue with retries, ghost recovery and bounded
//! concurrency.
//!
//! Producers submit jobs through [`JobQueue`]; each job becomes a persisted
//! record with a retry policy and a run history. Workers pop jobs from
//! per-name queues, run a [`JobHandler`] under a per-job timeout, and drive
//! the state machine: user errors retry up to a budget, timeouts ghost and
//! are resurrected, exhausted budgets fail terminally. A periodic
//! [`Scheduler`] promotes delayed, retried and ghosted jobs once their due
//! time arrives.
//!
//! # Architecture
//!
//! ```text
//! JobQueue.submit(options)
//!     │
//!     ├─► JobStore.create (id allocation + record + indexes)
//!     └─► QueueRouter.enqueue (queue list or scheduled set)
//!
//! Worker
//!     │
//!     ├─► Popper.pop (blocking pop + hydrate to processing)
//!     ├─► JobHandler.handle (under process_timeout)
//!     └─► OutcomeProcessor.process (state machine + persistence)
//!             └─► QueueRouter.enqueue (retry / ghost re-enqueue)
//!
//! Scheduler (periodic tick)
//!     └─► due scheduled ids → queued → queue list
//! ```
//!
//! # Example
//!
//! ```ignore
//! use emberq::{JobOptions, JobQueue, QueueConfig, RedisBackend, Keyspace};
//!
//! let config = QueueConfig::from_env()?;
//! let backend = Arc::new(
//!     RedisBackend::connect(&config.redis_url, Keyspace::new(config.namespace)).await?,
//! );
//!
//! let queue = JobQueue::new(backend.clone());
//! queue
//!     .submit(JobOptions::builder().name("mail").data(json!({"to": "a@b"})).build())
//!     .await?;
//!
//! let worker = Worker::new(backend, handler, WorkerConfig::for_names(["mail"]))?;
//! worker.run_until_shutdown().await?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod keys;
pub mod outcome;
pub mod pop;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod worker;

pub use backend::{QueueBackend, RedisBackend};
pub use config::QueueConfig;
pub use error::QueueError;
pub use job::{Job, JobOptions, JobState, JobView, ProcessItem, RunState};
pub use keys::Keyspace;
pub use outcome::{Outcome, OutcomeProcessor};
pub use pop::Popper;
pub use queue::JobQueue;
pub use router::QueueRouter;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::JobStore;
pub use worker::{JobHandler, Worker, WorkerConfig};
