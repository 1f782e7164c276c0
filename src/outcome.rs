//! Outcome classification and the transition persistence path.
//!
//! The worker reports each finished attempt as an [`Outcome`]; the
//! [`OutcomeProcessor`] finalizes the attempt's run entry, drives the state
//! machine ([`Job::next_state`]), and persists the transition in a fixed
//! order: state index, then record, then re-enqueue for transient states.

use chrono::Utc;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::job::{Job, JobState};
use crate::router::QueueRouter;
use crate::store::JobStore;

/// Result of one dispatch attempt, as observed by the worker.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub timed_out: bool,
    /// Error string supplied by the consumer, absent on success and timeout.
    pub error: Option<String>,
}

impl Outcome {
    /// The attempt completed without an error.
    pub fn success() -> Self {
        Self {
            success: true,
            timed_out: false,
            error: None,
        }
    }

    /// The consumer reported an error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: false,
            error: Some(message.into()),
        }
    }

    /// The attempt exceeded its process timeout without reporting.
    pub fn timeout() -> Self {
        Self {
            success: false,
            timed_out: true,
            error: None,
        }
    }
}

/// Applies the state machine to finished jobs and persists the transition.
#[derive(Clone)]
pub struct OutcomeProcessor {
    store: JobStore,
    router: QueueRouter,
}

impl OutcomeProcessor {
    pub fn new(store: JobStore, router: QueueRouter) -> Self {
        Self { store, router }
    }

    /// Record the outcome of the job's current attempt and drive it to its
    /// next state.
    ///
    /// Persistence order per job is fixed: update the state index, save the
    /// record (now holding the finalized run), then enqueue when the new
    /// state is transient. Terminal states enqueue nothing.
    pub async fn process(&self, job: &mut Job, outcome: Outcome) -> Result<(), QueueError> {
        let now = Utc::now();
        job.finish_run(&outcome, now);
        let next = job.next_state(&outcome);

        if next.is_terminal() {
            job.finalize(next, now);
        }

        self.store.update_state_index(job, next).await?;
        self.store.save(job).await?;

        if next.is_terminal() {
            info!(
                job_id = %job.id,
                job_name = %job.name,
                state = %next,
                attempts = job.runs.len(),
                "job finished"
            );
        } else {
            debug!(job_id = %job.id, state = %next, "job re-enqueued");
            self.router.enqueue(job).await?;
        }

        Ok(())
    }
}
