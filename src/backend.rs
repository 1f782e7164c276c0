//! Storage backend seam.
//!
//! [`QueueBackend`] is the raw command surface the queue core is written
//! against: each method maps to a single Redis command, so all mutating paths
//! stay single-command and cross-key consistency remains best-effort (the
//! state-field-wins rule on fetch resolves the gaps). [`RedisBackend`] is the
//! production implementation; [`MemoryBackend`](crate::testing::MemoryBackend)
//! backs the test suite.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::QueueError;
use crate::job::JobState;
use crate::keys::{Keyspace, FIELD_ITEM_DATA, FIELD_STATE};

/// Raw storage operations used by the queue core.
///
/// Implementations must keep per-queue push/pop order FIFO; no ordering is
/// required across queues.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Allocate the next job id from the monotonic counter.
    async fn next_id(&self) -> Result<String, QueueError>;

    /// Write both the serialized record and the authoritative state field.
    async fn write_record(
        &self,
        id: &str,
        item_data: &str,
        state: JobState,
    ) -> Result<(), QueueError>;

    /// Write the serialized record only, leaving the state field untouched.
    async fn write_item_data(&self, id: &str, item_data: &str) -> Result<(), QueueError>;

    /// Write the authoritative state field only.
    async fn write_state_field(&self, id: &str, state: JobState) -> Result<(), QueueError>;

    /// Read `(itemData, state)` for a job; `None` when the key is absent.
    async fn read_record(&self, id: &str)
        -> Result<Option<(Option<String>, Option<String>)>, QueueError>;

    /// Add an id to a per-state index set.
    async fn add_state_member(&self, state: JobState, id: &str) -> Result<(), QueueError>;

    /// Remove an id from a per-state index set.
    async fn remove_state_member(&self, state: JobState, id: &str) -> Result<(), QueueError>;

    /// Record the job's creation time in the time index.
    async fn index_time(&self, id: &str, created_ms: i64) -> Result<(), QueueError>;

    /// Push an id onto the tail of a job-name queue.
    async fn push_queue(&self, name: &str, id: &str) -> Result<(), QueueError>;

    /// Blocking pop across the given job-name queues; `None` on timeout.
    async fn blocking_pop(
        &self,
        names: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Add an id to the scheduled set with the given due time.
    async fn schedule(&self, id: &str, due_ms: i64) -> Result<(), QueueError>;

    /// Remove and return every scheduled id due at or before `now_ms`.
    async fn take_due(&self, now_ms: i64) -> Result<Vec<String>, QueueError>;
}

/// Redis-backed implementation of [`QueueBackend`].
///
/// Non-blocking commands share one multiplexed connection; each blocking pop
/// opens its own connection so concurrent pops never stall one another.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    keys: Keyspace,
}

impl RedisBackend {
    /// Connect to Redis and prepare a shared multiplexed connection.
    pub async fn connect(url: &str, keys: Keyspace) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn, keys })
    }

    /// The keyspace this backend writes into.
    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn next_id(&self) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();
        let id: i64 = conn.incr(self.keys.id_counter(), 1).await?;
        Ok(id.to_string())
    }

    async fn write_record(
        &self,
        id: &str,
        item_data: &str,
        state: JobState,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(
            self.keys.job(id),
            &[(FIELD_ITEM_DATA, item_data), (FIELD_STATE, state.as_str())],
        )
        .await?;
        Ok(())
    }

    async fn write_item_data(&self, id: &str, item_data: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.keys.job(id), FIELD_ITEM_DATA, item_data)
            .await?;
        Ok(())
    }

    async fn write_state_field(&self, id: &str, state: JobState) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.keys.job(id), FIELD_STATE, state.as_str())
            .await?;
        Ok(())
    }

    async fn read_record(
        &self,
        id: &str,
    ) -> Result<Option<(Option<String>, Option<String>)>, QueueError> {
        let mut conn = self.conn.clone();
        let (item_data, state): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.keys.job(id))
            .arg(FIELD_ITEM_DATA)
            .arg(FIELD_STATE)
            .query_async(&mut conn)
            .await?;
        if item_data.is_none() && state.is_none() {
            return Ok(None);
        }
        Ok(Some((item_data, state)))
    }

    async fn add_state_member(&self, state: JobState, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(self.keys.state(state), id).await?;
        Ok(())
    }

    async fn remove_state_member(&self, state: JobState, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(self.keys.state(state), id).await?;
        Ok(())
    }

    async fn index_time(&self, id: &str, created_ms: i64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.keys.time_index(), id, created_ms)
            .await?;
        Ok(())
    }

    async fn push_queue(&self, name: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.keys.queue(name), id).await?;
        Ok(())
    }

    async fn blocking_pop(
        &self,
        names: &[String],
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        // BLPOP parks the whole connection, so it gets a dedicated one.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let queue_keys: Vec<String> = names.iter().map(|name| self.keys.queue(name)).collect();
        let popped: Option<(String, String)> =
            conn.blpop(queue_keys, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_queue, id)| id))
    }

    async fn schedule(&self, id: &str, due_ms: i64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.keys.scheduled(), id, due_ms)
            .await?;
        Ok(())
    }

    async fn take_due(&self, now_ms: i64) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(self.keys.scheduled(), "-inf", now_ms)
            .await?;
        if !due.is_empty() {
            conn.zrem::<_, _, ()>(self.keys.scheduled(), &due).await?;
        }
        Ok(due)
    }
}
