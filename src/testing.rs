//! Queue testing utilities.
//!
//! [`MemoryBackend`] is an in-memory [`QueueBackend`] with the same FIFO and
//! indexing semantics as the Redis implementation, plus inspection helpers
//! and a failure-injection switch so storage-error paths (throttling, outcome
//! persistence failures) can be exercised hermetically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::job::JobState;

#[derive(Default)]
struct Inner {
    counter: i64,
    /// id -> (itemData, state) hash fields.
    records: HashMap<String, (Option<String>, Option<String>)>,
    queues: HashMap<String, VecDeque<String>>,
    /// (id, due_ms) pairs of the scheduled sorted set.
    scheduled: Vec<(String, i64)>,
    states: HashMap<&'static str, HashSet<String>>,
    time_index: Vec<(String, i64)>,
    fail_storage: bool,
}

/// In-memory queue backend for tests.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_failure(inner: &Inner) -> Result<(), QueueError> {
        if inner.fail_storage {
            Err(QueueError::Storage("injected storage failure".into()))
        } else {
            Ok(())
        }
    }

    /// Make every subsequent operation fail with a storage error.
    pub fn set_fail_storage(&self, fail: bool) {
        self.lock().fail_storage = fail;
    }

    /// Overwrite a record's serialized payload with garbage.
    pub fn corrupt_record(&self, id: &str) {
        if let Some(record) = self.lock().records.get_mut(id) {
            record.0 = Some("{not json".to_string());
        }
    }

    /// Drop a record entirely, leaving any queue entries behind.
    pub fn drop_record(&self, id: &str) {
        self.lock().records.remove(id);
    }

    /// Number of ids currently queued under a job name.
    pub fn queue_len(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.len())
    }

    /// Ids currently queued under a job name, in pop order.
    pub fn queue_ids(&self, name: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every id present in any queue, with repeats.
    pub fn all_queued_ids(&self) -> Vec<String> {
        self.lock()
            .queues
            .values()
            .flat_map(|q| q.iter().cloned())
            .collect()
    }

    /// Number of entries in the scheduled set.
    pub fn scheduled_len(&self) -> usize {
        self.lock().scheduled.len()
    }

    /// Members of a per-state index set.
    pub fn state_members(&self, state: JobState) -> HashSet<String> {
        self.lock()
            .states
            .get(state.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Raw authoritative state field of a record.
    pub fn record_state(&self, id: &str) -> Option<String> {
        self.lock().records.get(id).and_then(|r| r.1.clone())
    }

    /// Number of entries in the creation-time index.
    pub fn time_index_len(&self) -> usize {
        self.lock().time_index.len()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn next_id(&self) -> Result<String, QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        inner.counter += 1;
        Ok(inner.counter.to_string())
    }

    async fn write_record(
        &self,
        id: &str,
        item_data: &str,
        state: JobState,
    ) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        inner.records.insert(
            id.to_string(),
            (Some(item_data.to_string()), Some(state.as_str().to_string())),
        );
        Ok(())
    }

    async fn write_item_data(&self, id: &str, item_data: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        let entry = inner.records.entry(id.to_string()).or_default();
        entry.0 = Some(item_data.to_string());
        Ok(())
    }

    async fn write_state_field(&self, id: &str, state: JobState) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        let entry = inner.records.entry(id.to_string()).or_default();
        entry.1 = Some(state.as_str().to_string());
        Ok(())
    }

    async fn read_record(
        &self,
        id: &str,
    ) -> Result<Option<(Option<String>, Option<String>)>, QueueError> {
        let inner = self.lock();
        Self::check_failure(&inner)?;
        Ok(inner.records.get(id).cloned())
    }

    async fn add_state_member(&self, state: JobState, id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        inner
            .states
            .entry(state.as_str())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    async fn remove_state_member(&self, state: JobState, id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        if let Some(members) = inner.states.get_mut(state.as_str()) {
            members.remove(id);
        }
        Ok(())
    }

    async fn index_time(&self, id: &str, created_ms: i64) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        inner.time_index.push((id.to_string(), created_ms));
        Ok(())
    }

    async fn push_queue(&self, name: &str, id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        inner
            .queues
            .entry(name.to_string())
            .or_default()
            .push_back(id.to_string());
        Ok(())
    }

    async fn blocking_pop(
        &self,
        names: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.lock();
                Self::check_failure(&inner)?;
                for name in names {
                    if let Some(queue) = inner.queues.get_mut(name) {
                        if let Some(id) = queue.pop_front() {
                            return Ok(Some(id));
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn schedule(&self, id: &str, due_ms: i64) -> Result<(), QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        inner.scheduled.retain(|(member, _)| member != id);
        inner.scheduled.push((id.to_string(), due_ms));
        Ok(())
    }

    async fn take_due(&self, now_ms: i64) -> Result<Vec<String>, QueueError> {
        let mut inner = self.lock();
        Self::check_failure(&inner)?;
        let mut due: Vec<(String, i64)> = Vec::new();
        inner.scheduled.retain(|(id, at)| {
            if *at <= now_ms {
                due.push((id.clone(), *at));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(_, at)| *at);
        Ok(due.into_iter().map(|(id, _)| id).collect())
    }
}
