//! Redis key naming scheme.
//!
//! Every key the queue touches is derived from a single namespace prefix so
//! that several applications (or several test runs) can share one Redis
//! instance without colliding.

use crate::job::JobState;

/// Hash field holding the serialized job record.
pub const FIELD_ITEM_DATA: &str = "itemData";

/// Hash field holding the authoritative job state.
pub const FIELD_STATE: &str = "state";

/// Centralizes the Redis key naming scheme used by the storage layer.
///
/// | Key | Type | Purpose |
/// |---|---|---|
/// | `NS:id` | string counter | Monotonic job id allocator. |
/// | `NS:job:<id>` | hash | Canonical per-job record (`itemData`, `state`). |
/// | `NS:queue:<name>` | list | FIFO queue of runnable ids for a job name. |
/// | `NS:scheduled` | sorted set | Delayed / retry / ghost-delayed ids, score = due epoch millis. |
/// | `NS:state:<state>` | set | Index of all ids currently in a given state. |
/// | `NS:time-index` | sorted set | Ids by creation time, score = create epoch millis. |
#[derive(Debug, Clone)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    /// Build a keyspace for the given namespace prefix, defaulting to
    /// `emberq` when the prefix is empty.
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.is_empty() {
            "emberq".to_string()
        } else {
            namespace
        };
        Self { namespace }
    }

    /// The namespace prefix itself.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Counter key used to allocate job ids.
    pub fn id_counter(&self) -> String {
        format!("{}:id", self.namespace)
    }

    /// Hash key for a single job record.
    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    /// List key for the runnable queue of a job name.
    pub fn queue(&self, name: &str) -> String {
        format!("{}:queue:{}", self.namespace, name)
    }

    /// Sorted set of delayed ids, scored by due timestamp.
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    /// Set of ids currently in the given state.
    pub fn state(&self, state: JobState) -> String {
        format!("{}:state:{}", self.namespace, state.as_str())
    }

    /// Sorted set of ids scored by creation time.
    pub fn time_index(&self) -> String {
        format!("{}:time-index", self.namespace)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("emberq")
    }
}
