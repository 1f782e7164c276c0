//! Blocking pop across job-name queues.
//!
//! A popped id is only useful once the full record is hydrated and moved to
//! `Processing` with a fresh run appended; the popper does all of that and
//! hands the caller a record that is ready to dispatch. From that moment the
//! caller holds the job's lease.

use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::error::QueueError;
use crate::job::{Job, JobState};
use crate::store::JobStore;

/// Pops runnable jobs and hydrates them into `Processing` records.
#[derive(Clone)]
pub struct Popper {
    store: JobStore,
}

impl Popper {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    /// Blocking pop across all queues for the given job names.
    ///
    /// Fails with [`QueueError::Empty`] when no id arrives within the
    /// timeout. A popped id whose record is missing or corrupt is discarded
    /// and the pop is re-attempted once.
    pub async fn pop(&self, names: &[String], timeout: Duration) -> Result<Job, QueueError> {
        match self.pop_once(names, timeout).await {
            Err(QueueError::NotFound(id)) | Err(QueueError::Corrupt { id, .. }) => {
                warn!(job_id = %id, "popped id had no usable record, re-popping");
                self.pop_once(names, timeout).await
            }
            other => other,
        }
    }

    async fn pop_once(&self, names: &[String], timeout: Duration) -> Result<Job, QueueError> {
        let id = self
            .store
            .backend()
            .blocking_pop(names, timeout)
            .await?
            .ok_or(QueueError::Empty)?;

        let mut job = self.store.fetch(&id).await?;
        self.store
            .update_state_index(&mut job, JobState::Processing)
            .await?;
        job.begin_run(Utc::now());
        self.store.save(&job).await?;

        Ok(job)
    }
}
