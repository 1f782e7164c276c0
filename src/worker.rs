//! Worker control loop.
//!
//! The worker keeps a configured number of jobs in flight: it launches
//! blocking pops until the target is reached, dispatches each popped job to
//! the consumer handler under a per-job timeout, and feeds finished attempts
//! to the outcome processor.
//!
//! # Architecture
//!
//! ```text
//! Worker (master task, owns all loop state)
//!     │
//!     ├─► spawn pops until in-flight + pending == concurrent_jobs
//!     ├─► dispatch popped job
//!     │       ├─► spawn timeout watcher (process_timeout)
//!     │       └─► spawn handler task
//!     └─► on first completion per job id → OutcomeProcessor
//! ```
//!
//! Pops, handlers, and timeout watchers all run as spawned tasks and report
//! back over one mpsc channel, so the in-flight map, throttle buffer and
//! pending-pop count are only ever touched from the master task. Whichever
//! of handler and timer reports first wins; the loser's completion finds no
//! in-flight entry and is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::{Job, JobView};
use crate::outcome::{Outcome, OutcomeProcessor};
use crate::pop::Popper;
use crate::router::QueueRouter;
use crate::store::JobStore;

/// Extra slots in the throttle buffer beyond the concurrency target.
const BUFFER_GRACE: usize = 5;

/// Window within which a full buffer of pop failures engages the throttle.
const THROTTLE_LIMIT: Duration = Duration::from_secs(5);

/// Pause applied once the throttle engages.
const THROTTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer callback contract.
///
/// `Ok(())` marks the attempt successful; any error is recorded into the
/// job's run history and drives the retry policy. The handler runs on its
/// own task: a timeout cannot cancel it, but a late result is dropped.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobView, data: &serde_json::Value) -> Result<()>;
}

/// Configuration for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job names this worker consumes.
    pub job_names: Vec<String>,
    /// Target number of in-flight jobs.
    pub concurrent_jobs: usize,
    /// Timeout handed to each blocking pop.
    pub pop_timeout: Duration,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_names: Vec::new(),
            concurrent_jobs: 1,
            pop_timeout: Duration::from_secs(2),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Create a config consuming the given job names.
    pub fn for_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            job_names: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Create a config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

enum LoopEvent {
    Popped(Result<Job, QueueError>),
    Finished { id: String, outcome: Outcome },
}

struct InFlight {
    job: Job,
    timer: JoinHandle<()>,
}

/// Circular buffer of master-loop entry times used to detect pops failing in
/// rapid succession.
struct ThrottleBuffer {
    capacity: usize,
    entries: VecDeque<Instant>,
}

impl ThrottleBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn record(&mut self, now: Instant) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(now);
    }

    /// Engaged once the buffer is full and its oldest entry is still within
    /// the limit window.
    fn engaged(&self, now: Instant, limit: Duration) -> bool {
        self.entries.len() == self.capacity
            && self
                .entries
                .front()
                .is_some_and(|oldest| now.duration_since(*oldest) < limit)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A worker that pops jobs, runs the consumer handler under a timeout, and
/// drives retry and ghost transitions.
pub struct Worker {
    popper: Popper,
    outcomes: OutcomeProcessor,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    throttle: ThrottleBuffer,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a new worker.
    ///
    /// Fails with [`QueueError::BadArgument`] when no job names are given,
    /// a name is empty, or the concurrency target is zero.
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        if config.job_names.is_empty() {
            return Err(QueueError::BadArgument(
                "worker requires at least one job name".into(),
            ));
        }
        if config.job_names.iter().any(|name| name.is_empty()) {
            return Err(QueueError::BadArgument("job names must be non-empty".into()));
        }
        if config.concurrent_jobs == 0 {
            return Err(QueueError::BadArgument(
                "concurrent_jobs must be at least 1".into(),
            ));
        }

        let store = JobStore::new(backend.clone());
        let router = QueueRouter::new(backend);
        let throttle = ThrottleBuffer::new(config.concurrent_jobs + BUFFER_GRACE);

        Ok(Self {
            popper: Popper::new(store.clone()),
            outcomes: OutcomeProcessor::new(store, router),
            handler,
            config,
            throttle,
        })
    }

    /// Run the worker until shutdown is requested.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrent_jobs = self.config.concurrent_jobs,
            job_names = ?self.config.job_names,
            "worker starting"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();
        let mut pending_pops: usize = 0;

        loop {
            // Keep enough pops outstanding to reach the concurrency target.
            while pending_pops + in_flight.len() < self.config.concurrent_jobs {
                self.spawn_pop(&tx);
                pending_pops += 1;
            }

            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                LoopEvent::Popped(result) => {
                    pending_pops = pending_pops.saturating_sub(1);
                    let now = Instant::now();
                    self.throttle.record(now);
                    match result {
                        Ok(job) => self.dispatch(job, &tx, &mut in_flight),
                        Err(QueueError::Empty) => {}
                        Err(e) => {
                            error!(error = %e, "pop failed");
                            // Engagement is only considered when the loop was
                            // re-entered because of a pop failure.
                            if self.throttle.engaged(now, THROTTLE_LIMIT) {
                                warn!(
                                    pause_ms = THROTTLE_TIMEOUT.as_millis() as u64,
                                    "pops failing in rapid succession, throttling"
                                );
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = tokio::time::sleep(THROTTLE_TIMEOUT) => {}
                                }
                                self.throttle.clear();
                            }
                        }
                    }
                }
                LoopEvent::Finished { id, outcome } => {
                    let Some(entry) = in_flight.remove(&id) else {
                        // The other of handler/timer already reported.
                        debug!(job_id = %id, "stale completion dropped");
                        continue;
                    };
                    entry.timer.abort();

                    let mut job = entry.job;
                    if let Err(e) = self.outcomes.process(&mut job, outcome).await {
                        // The record stays in processing; the ghost path will
                        // resurrect it.
                        error!(job_id = %job.id, error = %e, "failed to persist job outcome");
                    }
                }
            }
        }

        // Disposal: clear pending timers, abandon in-flight handlers.
        for (id, entry) in in_flight.drain() {
            entry.timer.abort();
            warn!(job_id = %id, "abandoning in-flight job at shutdown");
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Run until a Ctrl-C shutdown signal is received.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            signal_token.cancel();
        });

        self.run(shutdown).await
    }

    fn spawn_pop(&self, tx: &mpsc::UnboundedSender<LoopEvent>) {
        let popper = self.popper.clone();
        let names = self.config.job_names.clone();
        let timeout = self.config.pop_timeout;
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = popper.pop(&names, timeout).await;
            let _ = tx.send(LoopEvent::Popped(result));
        });
    }

    /// Register the popped job, arm its timeout, and start the handler.
    fn dispatch(
        &self,
        job: Job,
        tx: &mpsc::UnboundedSender<LoopEvent>,
        in_flight: &mut HashMap<String, InFlight>,
    ) {
        let id = job.id.clone();
        let view = job.view();
        let data = job.data.clone();
        let timeout = Duration::from_millis(job.process_timeout_ms.max(0) as u64);

        let timer_tx = tx.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(LoopEvent::Finished {
                id: timer_id,
                outcome: Outcome::timeout(),
            });
        });

        let handler = self.handler.clone();
        let work_tx = tx.clone();
        let work_id = id.clone();
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(handler.handle(&view, &data))
                .catch_unwind()
                .await;
            let outcome = match result {
                Ok(Ok(())) => Outcome::success(),
                Ok(Err(err)) => Outcome::error(err.to_string()),
                Err(_) => {
                    error!(job_id = %work_id, "job handler panicked");
                    Outcome::error("job handler panicked")
                }
            };
            let _ = work_tx.send(LoopEvent::Finished {
                id: work_id,
                outcome,
            });
        });

        debug!(
            job_id = %id,
            job_name = %job.name,
            attempt = job.runs.len(),
            "job dispatched"
        );
        in_flight.insert(id, InFlight { job, timer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobState, RunState};
    use crate::testing::MemoryBackend;
    use anyhow::anyhow;
    use std::sync::Mutex;

    /// Handler that follows a per-attempt script.
    struct ScriptedHandler {
        script: Mutex<VecDeque<Step>>,
    }

    enum Step {
        Succeed,
        Fail(&'static str),
        Panic,
        Hang,
    }

    impl ScriptedHandler {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &JobView, _data: &serde_json::Value) -> Result<()> {
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Succeed);
            match step {
                Step::Succeed => Ok(()),
                Step::Fail(message) => Err(anyhow!(message)),
                Step::Panic => panic!("scripted panic"),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    /// Submit one job, run a worker over it, and return the terminal record.
    async fn run_to_completion(options: JobOptions, handler: Arc<ScriptedHandler>) -> Job {
        let backend = Arc::new(MemoryBackend::new());
        let store = JobStore::new(backend.clone());
        let router = QueueRouter::new(backend.clone());
        let job = store.create(Job::from_options(options)).await.unwrap();
        router.enqueue(&job).await.unwrap();

        let mut config = WorkerConfig::for_names(["mail"]);
        config.pop_timeout = Duration::from_millis(50);
        let worker = Worker::new(backend.clone(), handler, config).unwrap();

        let shutdown = CancellationToken::new();
        let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

        let deadline = Instant::now() + Duration::from_secs(30);
        let finished = loop {
            let stored = store.fetch(&job.id).await.unwrap();
            if stored.complete {
                break stored;
            }
            assert!(Instant::now() < deadline, "job never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        shutdown.cancel();
        worker_handle.await.unwrap().unwrap();

        // Terminal jobs sit in no queue.
        assert!(backend.all_queued_ids().is_empty());
        finished
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_succeeds_in_one_run() {
        let handler = ScriptedHandler::new(vec![Step::Succeed]);
        let options = JobOptions::builder()
            .name("mail")
            .data(serde_json::json!("hi"))
            .retry(true)
            .build();
        let job = run_to_completion(options, handler).await;

        assert_eq!(job.state, JobState::Success);
        assert!(job.complete);
        assert!(job.success);
        assert_eq!(job.runs.len(), 1);
        assert_eq!(job.runs[0].state, RunState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_succeed() {
        let handler = ScriptedHandler::new(vec![Step::Fail("oops"), Step::Succeed]);
        let options = JobOptions::builder().name("mail").retry(true).build();
        let job = run_to_completion(options, handler).await;

        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.runs.len(), 2);
        assert_eq!(job.runs[0].state, RunState::Fail);
        assert_eq!(job.runs[0].error_message.as_deref(), Some("oops"));
        assert_eq!(job.runs[1].state, RunState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_fails() {
        let handler = ScriptedHandler::new(vec![
            Step::Fail("a"),
            Step::Fail("b"),
            Step::Fail("c"),
        ]);
        let options = JobOptions::builder()
            .name("mail")
            .retry(true)
            .retry_times(2u32)
            .build();
        let job = run_to_completion(options, handler).await;

        assert_eq!(job.state, JobState::Fail);
        assert!(!job.success);
        assert_eq!(job.runs.len(), 3);
        assert!(job.runs.iter().all(|run| run.state == RunState::Fail));
    }

    #[tokio::test(start_paused = true)]
    async fn ghost_once_then_succeed() {
        let handler = ScriptedHandler::new(vec![Step::Hang, Step::Succeed]);
        let options = JobOptions::builder()
            .name("mail")
            .process_timeout_ms(50i64)
            .build();
        let job = run_to_completion(options, handler).await;

        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.runs.len(), 2);
        assert_eq!(job.runs[0].state, RunState::Ghost);
        assert_eq!(job.runs[1].state, RunState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn ghost_exhaustion_fails() {
        let handler = ScriptedHandler::new(vec![Step::Hang, Step::Hang]);
        let options = JobOptions::builder()
            .name("mail")
            .process_timeout_ms(50i64)
            .ghost_times(1u32)
            .build();
        let job = run_to_completion(options, handler).await;

        assert_eq!(job.state, JobState::Fail);
        assert_eq!(job.runs.len(), 2);
        assert!(job.runs.iter().all(|run| run.state == RunState::Ghost));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_is_an_error_outcome() {
        let handler = ScriptedHandler::new(vec![Step::Panic]);
        let options = JobOptions::builder().name("mail").build();
        let job = run_to_completion(options, handler).await;

        assert_eq!(job.state, JobState::Fail);
        assert_eq!(job.runs.len(), 1);
        assert_eq!(job.runs[0].state, RunState::Fail);
        assert!(job.runs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("panicked"));
    }

    #[test]
    fn worker_requires_job_names() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        let handler = ScriptedHandler::new(vec![]);
        let err = Worker::new(backend, handler, WorkerConfig::default()).unwrap_err();
        assert!(matches!(err, QueueError::BadArgument(_)));
    }

    #[test]
    fn worker_requires_nonzero_concurrency() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        let handler = ScriptedHandler::new(vec![]);
        let mut config = WorkerConfig::for_names(["mail"]);
        config.concurrent_jobs = 0;
        let err = Worker::new(backend, handler, config).unwrap_err();
        assert!(matches!(err, QueueError::BadArgument(_)));
    }

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrent_jobs, 1);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn throttle_engages_only_when_full_and_recent() {
        let start = Instant::now();
        let mut buffer = ThrottleBuffer::new(3);
        buffer.record(start);
        buffer.record(start);
        assert!(!buffer.engaged(start, THROTTLE_LIMIT));

        buffer.record(start);
        assert!(buffer.engaged(start + Duration::from_secs(1), THROTTLE_LIMIT));
    }

    #[test]
    fn throttle_disengages_once_oldest_ages_out() {
        let start = Instant::now();
        let mut buffer = ThrottleBuffer::new(2);
        buffer.record(start);
        buffer.record(start + Duration::from_millis(100));
        assert!(!buffer.engaged(start + Duration::from_secs(6), THROTTLE_LIMIT));
    }

    #[test]
    fn throttle_clear_resets_the_window() {
        let start = Instant::now();
        let mut buffer = ThrottleBuffer::new(1);
        buffer.record(start);
        assert!(buffer.engaged(start, THROTTLE_LIMIT));
        buffer.clear();
        assert!(!buffer.engaged(start, THROTTLE_LIMIT));
    }
}
