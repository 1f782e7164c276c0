//! Promotion of delayed jobs into their active queues.
//!
//! A single process-wide periodic task drains the scheduled set: every id
//! whose due time has arrived is fetched, moved to `Queued`, and pushed onto
//! its job-name queue. Individual ids failing does not abort a tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::JobState;
use crate::store::JobStore;

/// Configuration for the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduled set is checked for due ids.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Periodic task that moves due scheduled ids into their active queues.
pub struct Scheduler {
    store: JobStore,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            store: JobStore::new(backend),
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(backend: Arc<dyn QueueBackend>, config: SchedulerConfig) -> Self {
        Self {
            store: JobStore::new(backend),
            config,
        }
    }

    /// Run ticks until shutdown is requested.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler starting"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// Drain every due id from the scheduled set into its queue.
    ///
    /// Exposed for tests and for callers that drive ticks themselves.
    pub async fn tick(&self) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due = self.store.backend().take_due(now_ms).await?;

        for id in due {
            if let Err(e) = self.promote(&id).await {
                error!(job_id = %id, error = %e, "failed to promote scheduled job");
            }
        }

        Ok(())
    }

    /// Move one due id to `Queued` and push it onto its job-name queue.
    async fn promote(&self, id: &str) -> Result<(), QueueError> {
        let mut job = self.store.fetch(id).await?;

        job.scheduled_for = None;
        self.store
            .update_state_index(&mut job, JobState::Queued)
            .await?;
        self.store.save(&job).await?;
        self.store.backend().push_queue(&job.name, &job.id).await?;

        debug!(job_id = %job.id, job_name = %job.name, "scheduled job promoted");
        Ok(())
    }
}
