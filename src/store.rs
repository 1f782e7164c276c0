//! CRUD over job records.
//!
//! The store owns the persistence model: each job is a hash of
//! `{itemData, state}` where the separately written `state` field is
//! authoritative. State transitions are single-field writes and full-record
//! saves are larger, so the two can diverge transiently; `fetch` resolves the
//! divergence by overriding the deserialized record's state with the stored
//! field.

use std::sync::Arc;

use chrono::Utc;

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobState};

/// CRUD over job records in the backend.
#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn QueueBackend>,
}

impl JobStore {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Access to the raw backend, for collaborators built on the same
    /// storage (router, popper, scheduler).
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Persist a new job: allocate its id, write the record, index its state
    /// and creation time.
    ///
    /// Write steps are issued in order; the first failure surfaces as a
    /// storage error and is not retried here.
    pub async fn create(&self, mut job: Job) -> Result<Job, QueueError> {
        let id = self.backend.next_id().await?;
        job.id = id;

        let item_data = serialize(&job)?;
        self.backend
            .write_record(&job.id, &item_data, job.state)
            .await?;
        self.backend.add_state_member(job.state, &job.id).await?;
        self.index_time(&job).await?;

        Ok(job)
    }

    /// Fetch a job by id, applying the state-field-wins rule.
    pub async fn fetch(&self, id: &str) -> Result<Job, QueueError> {
        let record = self
            .backend
            .read_record(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let item_data = record
            .0
            .ok_or_else(|| QueueError::Corrupt {
                id: id.to_string(),
                reason: "record hash has no itemData field".to_string(),
            })?;

        let mut job: Job =
            serde_json::from_str(&item_data).map_err(|err| QueueError::Corrupt {
                id: id.to_string(),
                reason: err.to_string(),
            })?;

        // A record stored under the wrong id is data skew, not a usable job.
        if job.id != id {
            return Err(QueueError::NotFound(id.to_string()));
        }

        // The separately stored state field is authoritative when the two
        // disagree.
        if let Some(raw_state) = record.1.as_deref() {
            if let Some(state) = JobState::parse(raw_state) {
                job.state = state;
            }
        }

        Ok(job)
    }

    /// Write the serialized record only. Callers changing state must also
    /// call [`update_state_index`](Self::update_state_index).
    pub async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let item_data = serialize(job)?;
        self.backend.write_item_data(&job.id, &item_data).await
    }

    /// Transition the job's state: drop the old state-set membership, add the
    /// new one, and rewrite the authoritative state field.
    pub async fn update_state_index(
        &self,
        job: &mut Job,
        new_state: JobState,
    ) -> Result<(), QueueError> {
        let old_state = job.state;
        if old_state != new_state {
            self.backend.remove_state_member(old_state, &job.id).await?;
        }
        self.backend.add_state_member(new_state, &job.id).await?;
        self.backend.write_state_field(&job.id, new_state).await?;

        job.state = new_state;
        job.update_time = Utc::now();
        Ok(())
    }

    /// Record the job's creation time in the time index.
    pub async fn index_time(&self, job: &Job) -> Result<(), QueueError> {
        self.backend
            .index_time(&job.id, job.create_time.timestamp_millis())
            .await
    }
}

fn serialize(job: &Job) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|err| QueueError::Corrupt {
        id: job.id.clone(),
        reason: err.to_string(),
    })
}
