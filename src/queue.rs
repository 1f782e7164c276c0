//! Producer-facing queue facade.
//!
//! Submitting a job is a create followed by a route: the store persists the
//! record and allocates its id, the router places the id on the job-name
//! queue or the scheduled set. Workers and the scheduler consume from the
//! same backend independently.

use std::sync::Arc;

use tracing::info;

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobOptions};
use crate::router::QueueRouter;
use crate::store::JobStore;

/// Entry point for producing jobs.
#[derive(Clone)]
pub struct JobQueue {
    store: JobStore,
    router: QueueRouter,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            store: JobStore::new(backend.clone()),
            router: QueueRouter::new(backend),
        }
    }

    /// Submit a job: persist it and place it on its queue (or the scheduled
    /// set when it starts delayed). Returns the record with its allocated id.
    pub async fn submit(&self, options: JobOptions) -> Result<Job, QueueError> {
        if options.name.is_empty() {
            return Err(QueueError::BadArgument("job name must be non-empty".into()));
        }

        let job = self.store.create(Job::from_options(options)).await?;
        self.router.enqueue(&job).await?;

        info!(
            job_id = %job.id,
            job_name = %job.name,
            state = %job.state,
            "job submitted"
        );
        Ok(job)
    }

    /// Fetch a job record by id.
    pub async fn fetch(&self, id: &str) -> Result<Job, QueueError> {
        self.store.fetch(id).await
    }
}
