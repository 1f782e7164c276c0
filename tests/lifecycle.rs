//! End-to-end lifecycle tests over the in-memory backend: producer,
//! scheduler and worker running together.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use emberq::testing::MemoryBackend;
use emberq::{
    Job, JobHandler, JobOptions, JobQueue, JobState, JobView, RunState, Scheduler,
    SchedulerConfig, Worker, WorkerConfig,
};

/// Handler that follows a per-attempt script, succeeding once the script is
/// exhausted.
struct ScriptedHandler {
    script: Mutex<VecDeque<Result<()>>>,
}

impl ScriptedHandler {
    fn new(script: Vec<Result<()>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }

    fn always_ok() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, _job: &JobView, _data: &serde_json::Value) -> Result<()> {
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    queue: JobQueue,
    shutdown: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        // Respect RUST_LOG for test output; try_init() because several tests
        // share one process.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let backend = Arc::new(MemoryBackend::new());
        let queue = JobQueue::new(backend.clone());
        Self {
            backend,
            queue,
            shutdown: CancellationToken::new(),
        }
    }

    fn start_worker(&self, handler: Arc<ScriptedHandler>) {
        let mut config = WorkerConfig::for_names(["mail"]);
        config.pop_timeout = Duration::from_millis(50);
        let worker = Worker::new(self.backend.clone(), handler, config).unwrap();
        tokio::spawn(worker.run(self.shutdown.clone()));
    }

    fn start_scheduler(&self) {
        let scheduler = Scheduler::with_config(
            self.backend.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_millis(20),
            },
        );
        tokio::spawn(scheduler.run(self.shutdown.clone()));
    }

    async fn wait_for_completion(&self, id: &str) -> Job {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.queue.fetch(id).await.unwrap();
            if job.complete {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "job {id} never reached a terminal state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_job_waits_for_its_due_time() {
    let harness = Harness::new();
    harness.start_worker(ScriptedHandler::always_ok());

    let job = harness
        .queue
        .submit(
            JobOptions::builder()
                .name("mail")
                .scheduled_for(Utc::now() + chrono::Duration::milliseconds(100))
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Delayed);

    // Without the scheduler nothing pops it, no matter how long we wait.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stored = harness.queue.fetch(&job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Delayed);

    harness.start_scheduler();
    let finished = harness.wait_for_completion(&job.id).await;

    assert_eq!(finished.state, JobState::Success);
    assert_eq!(finished.runs.len(), 1);
    assert!(harness.backend.all_queued_ids().is_empty());
    harness.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_retry_goes_through_the_scheduler() {
    let harness = Harness::new();
    harness.start_worker(ScriptedHandler::new(vec![Err(anyhow!("first try fails"))]));
    harness.start_scheduler();

    let job = harness
        .queue
        .submit(
            JobOptions::builder()
                .name("mail")
                .retry(true)
                .retry_interval_ms(200i64)
                .build(),
        )
        .await
        .unwrap();

    let finished = harness.wait_for_completion(&job.id).await;

    assert_eq!(finished.state, JobState::Success);
    assert_eq!(finished.runs.len(), 2);
    assert_eq!(finished.runs[0].state, RunState::Fail);
    assert_eq!(finished.runs[1].state, RunState::Success);
    harness.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_batch_of_jobs_upholds_the_queue_invariants() {
    let harness = Harness::new();
    harness.start_worker(ScriptedHandler::new(vec![
        Err(anyhow!("flaky")),
        Ok(()),
        Err(anyhow!("flaky")),
    ]));
    harness.start_scheduler();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let job = harness
            .queue
            .submit(
                JobOptions::builder()
                    .name("mail")
                    .retry(true)
                    .retry_times(3u32)
                    .build(),
            )
            .await
            .unwrap();
        ids.push(job.id);
    }

    for id in &ids {
        let job = harness.wait_for_completion(id).await;
        assert_eq!(job.state, JobState::Success);
        assert!(job.finish_time.is_some());
        // Initial attempt plus at most retry_times retries.
        assert!(job.runs.len() as u32 <= job.retry_times + 1);
        // Every attempt is numbered and finalized.
        for (index, run) in job.runs.iter().enumerate() {
            assert_eq!(run.count as usize, index + 1);
            assert_ne!(run.state, RunState::Processing);
            assert!(run.process_time_ms.is_some());
        }
    }

    // Terminal jobs appear in no queue and ids were never duplicated.
    assert!(harness.backend.all_queued_ids().is_empty());
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
    harness.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn ghost_recovery_resurrects_and_fails_cleanly() {
    struct HangingHandler;

    #[async_trait]
    impl JobHandler for HangingHandler {
        async fn handle(&self, _job: &JobView, _data: &serde_json::Value) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    let harness = Harness::new();
    let mut config = WorkerConfig::for_names(["mail"]);
    config.pop_timeout = Duration::from_millis(50);
    let worker = Worker::new(harness.backend.clone(), Arc::new(HangingHandler), config).unwrap();
    tokio::spawn(worker.run(harness.shutdown.clone()));
    harness.start_scheduler();

    let job = harness
        .queue
        .submit(
            JobOptions::builder()
                .name("mail")
                .process_timeout_ms(50i64)
                .ghost_times(1u32)
                .ghost_interval_ms(100i64)
                .build(),
        )
        .await
        .unwrap();

    let finished = harness.wait_for_completion(&job.id).await;

    assert_eq!(finished.state, JobState::Fail);
    assert_eq!(finished.runs.len(), 2);
    assert!(finished.runs.iter().all(|run| run.state == RunState::Ghost));
    assert!(harness.backend.all_queued_ids().is_empty());
    harness.shutdown.cancel();
}
