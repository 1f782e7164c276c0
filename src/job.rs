//! Job model and the pure parts of the state machine.
//!
//! A [`Job`] is the canonical record the queue persists: payload, retry and
//! ghost policies, timestamps, and one [`ProcessItem`] per dispatch attempt.
//! The state transition rules live here as pure functions so they can be
//! tested without a backend; persistence of a transition is the
//! [`OutcomeProcessor`](crate::outcome::OutcomeProcessor)'s job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::outcome::Outcome;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    New,
    Delayed,
    Queued,
    Processing,
    Retry,
    Ghost,
    Success,
    Fail,
}

impl JobState {
    /// Stable string form, used in Redis state-index keys and the hash's
    /// `state` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Delayed => "delayed",
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Retry => "retry",
            JobState::Ghost => "ghost",
            JobState::Success => "success",
            JobState::Fail => "fail",
        }
    }

    /// Parse the stored string form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new" => Some(JobState::New),
            "delayed" => Some(JobState::Delayed),
            "queued" => Some(JobState::Queued),
            "processing" => Some(JobState::Processing),
            "retry" => Some(JobState::Retry),
            "ghost" => Some(JobState::Ghost),
            "success" => Some(JobState::Success),
            "fail" => Some(JobState::Fail),
            _ => None,
        }
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Fail)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome state of a single dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Processing,
    Success,
    Fail,
    Ghost,
}

// ============================================================================
// Process Item
// ============================================================================

/// Record of one dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessItem {
    /// 1-based attempt number.
    pub count: u32,
    pub start_time: DateTime<Utc>,
    /// Wall-clock duration of the attempt, set when the attempt finishes.
    pub process_time_ms: Option<i64>,
    pub state: RunState,
    /// Error string on non-success outcomes.
    pub error_message: Option<String>,
}

impl Default for ProcessItem {
    fn default() -> Self {
        Self {
            count: 1,
            start_time: Utc::now(),
            process_time_ms: None,
            state: RunState::Processing,
            error_message: None,
        }
    }
}

// ============================================================================
// Job Record
// ============================================================================

/// Caller-facing options for submitting a job.
///
/// Defaults mirror the queue's documented policy: three retries once retry is
/// enabled, one permitted ghost, ten second process timeout.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobOptions {
    /// Job-kind identifier; partitions queues.
    pub name: String,
    /// Arbitrary payload handed to the consumer.
    #[builder(default = serde_json::Value::Null)]
    pub data: serde_json::Value,
    /// Whether user errors trigger retry.
    #[builder(default = false)]
    pub retry: bool,
    /// Maximum attempts after the first.
    #[builder(default = 3)]
    pub retry_times: u32,
    /// Delay before a retried job becomes runnable.
    #[builder(default = 0)]
    pub retry_interval_ms: i64,
    /// Whether timeouts are retried.
    #[builder(default = true)]
    pub ghost_retry: bool,
    /// Maximum permitted ghost occurrences.
    #[builder(default = 1)]
    pub ghost_times: u32,
    /// Delay before a ghosted job becomes runnable.
    #[builder(default = 0)]
    pub ghost_interval_ms: i64,
    /// Wall-clock limit for one attempt.
    #[builder(default = 10_000)]
    pub process_timeout_ms: i64,
    /// Absolute timestamp; if in the future, the job begins delayed.
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Canonical in-memory representation of a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    /// Opaque id, allocated by the store at create time. Never mutated after
    /// allocation.
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    /// Advisory copy of the state; the hash's separate `state` field is
    /// authoritative on fetch.
    pub state: JobState,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub retry: bool,
    pub retry_times: u32,
    pub retry_interval_ms: i64,
    pub ghost_retry: bool,
    pub ghost_times: u32,
    pub ghost_interval_ms: i64,
    pub process_timeout_ms: i64,
    pub scheduled_for: Option<DateTime<Utc>>,
    /// One entry per dispatch attempt, in order.
    pub runs: Vec<ProcessItem>,
    pub complete: bool,
    pub success: bool,
    pub total_process_time_ms: i64,
}

impl Default for Job {
    fn default() -> Self {
        Self::from_options(JobOptions::builder().name(String::new()).build())
    }
}

impl Job {
    /// Build a not-yet-persisted job from submission options.
    ///
    /// A future `scheduled_for` puts the job in `Delayed`; otherwise it
    /// starts in `New`. The id is empty until the store allocates one.
    pub fn from_options(options: JobOptions) -> Self {
        let now = Utc::now();
        let state = match options.scheduled_for {
            Some(at) if at > now => JobState::Delayed,
            _ => JobState::New,
        };
        Self {
            id: String::new(),
            name: options.name,
            data: options.data,
            state,
            create_time: now,
            update_time: now,
            finish_time: None,
            retry: options.retry,
            retry_times: options.retry_times,
            retry_interval_ms: options.retry_interval_ms,
            ghost_retry: options.ghost_retry,
            ghost_times: options.ghost_times,
            ghost_interval_ms: options.ghost_interval_ms,
            process_timeout_ms: options.process_timeout_ms,
            scheduled_for: options.scheduled_for,
            runs: Vec::new(),
            complete: false,
            success: false,
            total_process_time_ms: 0,
        }
    }

    /// Convenience constructor for an immediate job.
    pub fn new(name: &str, data: serde_json::Value) -> Self {
        Self::from_options(JobOptions::builder().name(name).data(data).build())
    }

    /// Number of attempts recorded so far.
    pub fn attempt_count(&self) -> u32 {
        self.runs.len() as u32
    }

    /// Number of attempts that ghosted, including an unfinalized current run
    /// only if already marked `Ghost`.
    pub fn ghost_count(&self) -> u32 {
        self.runs
            .iter()
            .filter(|run| run.state == RunState::Ghost)
            .count() as u32
    }

    /// Append a fresh `Processing` run for a new dispatch attempt and return
    /// its 1-based attempt number.
    pub fn begin_run(&mut self, now: DateTime<Utc>) -> u32 {
        let count = self.runs.len() as u32 + 1;
        self.runs.push(ProcessItem {
            count,
            start_time: now,
            process_time_ms: None,
            state: RunState::Processing,
            error_message: None,
        });
        count
    }

    /// Finalize the last run with the attempt's outcome.
    ///
    /// Ghosted attempts are recorded `Ghost`, user errors `Fail`, everything
    /// else `Success`; the run's duration is measured from its start time.
    pub fn finish_run(&mut self, outcome: &Outcome, now: DateTime<Utc>) {
        if let Some(run) = self.runs.last_mut() {
            run.state = if outcome.success {
                RunState::Success
            } else if outcome.timed_out {
                RunState::Ghost
            } else {
                RunState::Fail
            };
            run.process_time_ms = Some((now - run.start_time).num_milliseconds().max(0));
            run.error_message = outcome.error.clone();
        }
    }

    /// The §-free heart of the queue: decide the next state from an attempt
    /// outcome. Expects the last run to be finalized already.
    ///
    /// Ghost counting includes the current (ghosted) run and compares with
    /// strict `>`, so a job survives `ghost_times + 1` ghosts before failing.
    /// Retry counting excludes the current run, so a job gets one initial
    /// attempt plus `retry_times` retries.
    pub fn next_state(&self, outcome: &Outcome) -> JobState {
        if outcome.success {
            return JobState::Success;
        }
        if outcome.timed_out {
            if !self.ghost_retry {
                return JobState::Fail;
            }
            if self.ghost_count() > self.ghost_times {
                return JobState::Fail;
            }
            return JobState::Ghost;
        }
        if !self.retry {
            return JobState::Fail;
        }
        let prior_attempts = self.runs.len().saturating_sub(1) as u32;
        if prior_attempts < self.retry_times {
            JobState::Retry
        } else {
            JobState::Fail
        }
    }

    /// Apply a terminal transition's derived fields.
    pub fn finalize(&mut self, state: JobState, now: DateTime<Utc>) {
        debug_assert!(state.is_terminal());
        self.finish_time = Some(now);
        self.complete = true;
        self.success = state == JobState::Success;
        self.total_process_time_ms = self
            .runs
            .iter()
            .filter_map(|run| run.process_time_ms)
            .sum();
    }

    /// Read-only view handed to consumer callbacks.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            attempt: self.runs.len() as u32,
            create_time: self.create_time,
        }
    }
}

/// Read-only projection of a job, exposed to consumer callbacks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub state: JobState,
    /// 1-based number of the attempt currently being processed.
    pub attempt: u32,
    pub create_time: DateTime<Utc>,
}
