//! Queue routing by job state.
//!
//! After a create or a state transition, the router decides where a job id
//! lives next: the job-name queue for immediately runnable states, the
//! scheduled set for anything with a future due time, nowhere for terminal
//! states.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobState};

/// Pushes job ids onto the correct queue or the scheduled set.
#[derive(Clone)]
pub struct QueueRouter {
    backend: Arc<dyn QueueBackend>,
}

impl QueueRouter {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Route the job by its current state.
    ///
    /// `New` and zero-delay `Retry`/`Ghost` go straight onto the job-name
    /// queue; delayed `Retry`/`Ghost` and `Delayed` land in the scheduled
    /// set with their due timestamp as score. Terminal states are archival
    /// only and route nowhere.
    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        match job.state {
            JobState::New => self.push(job).await,
            JobState::Retry => self.push_or_schedule(job, job.retry_interval_ms).await,
            JobState::Ghost => self.push_or_schedule(job, job.ghost_interval_ms).await,
            JobState::Delayed => {
                let due = job.scheduled_for.unwrap_or_else(Utc::now);
                self.backend
                    .schedule(&job.id, due.timestamp_millis())
                    .await
            }
            JobState::Success | JobState::Fail => Ok(()),
            JobState::Queued | JobState::Processing => {
                debug!(job_id = %job.id, state = %job.state, "enqueue is a no-op for this state");
                Ok(())
            }
        }
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.backend.push_queue(&job.name, &job.id).await
    }

    async fn push_or_schedule(&self, job: &Job, delay_ms: i64) -> Result<(), QueueError> {
        if delay_ms > 0 {
            let due = Utc::now() + ChronoDuration::milliseconds(delay_ms);
            self.backend
                .schedule(&job.id, due.timestamp_millis())
                .await
        } else {
            self.push(job).await
        }
    }
}
