//! Job payloads and their wire format.
//!
//! This module defines the payload types that travel through the store:
//!
//! - `Job`: immutable-once-created unit of work (class, args, uniqueness)
//! - `QueuedJob`: a job plus the id and queue time given to it on enqueue
//! - `PlannedJob`: a recurring job with its next run and interval
//! - `ScheduledEntry`: a delayed job together with its destination
//! - `Destination`: where a job is enqueued (FIFO queue or batch pool)
//!
//! All types serialize as flat JSON objects with camelCase field names.

mod interval;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use self::interval::RecurrenceInterval;

use crate::error::PayloadError;
use crate::store::now_epoch;

/// Queue used when no destination is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Uniqueness descriptor attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UniqueDescriptor {
    /// Logical identity shared by interchangeable jobs.
    pub uid: String,
    /// Seconds to wait before re-enqueueing a deferred copy. Presence makes
    /// the job deferrable.
    #[serde(
        rename = "deferrableBy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deferrable_by: Option<u64>,
}

impl UniqueDescriptor {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            deferrable_by: None,
        }
    }

    pub fn deferrable(uid: impl Into<String>, delay_secs: u64) -> Self {
        Self {
            uid: uid.into(),
            deferrable_by: Some(delay_secs),
        }
    }

    pub fn is_deferrable(&self) -> bool {
        self.deferrable_by.is_some()
    }
}

/// A unit of work.
///
/// Only `class` is required on decode; every other field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Handler identifier.
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Opaque arguments handed to the handler.
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<UniqueDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_path: Option<String>,
    /// Environment variable overrides for the handler.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub fail_count: u32,
}

impl Job {
    /// Creates a job for the given handler class.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            source_id: None,
            name: None,
            args: Map::new(),
            unique: None,
            include_path: None,
            environment: BTreeMap::new(),
            fail_count: 0,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    /// Adds a single argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_unique(mut self, unique: UniqueDescriptor) -> Self {
        self.unique = Some(unique);
        self
    }

    pub fn with_include_path(mut self, path: impl Into<String>) -> Self {
        self.include_path = Some(path.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Unique id of the job, treating an empty id as "no uniqueness".
    pub fn unique_id(&self) -> Option<&str> {
        self.unique
            .as_ref()
            .map(|u| u.uid.as_str())
            .filter(|uid| !uid.is_empty())
    }

    pub fn is_deferrable(&self) -> bool {
        self.unique.as_ref().is_some_and(UniqueDescriptor::is_deferrable)
    }

    /// Name used in logs and metrics: the job name, else its class.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.class)
    }

    /// Decodes a job, rejecting an empty class.
    pub fn decode(raw: &str) -> Result<Self, PayloadError> {
        let job: Job = serde_json::from_str(raw).map_err(|source| PayloadError::Malformed {
            raw: raw.to_string(),
            source,
        })?;
        if job.class.is_empty() {
            return Err(PayloadError::InvalidField {
                field: "class".to_string(),
                raw: raw.to_string(),
            });
        }
        Ok(job)
    }
}

/// A job pushed onto a store-backed list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedJob {
    #[serde(flatten)]
    pub job: Job,
    /// Store-unique id assigned on enqueue.
    pub id: String,
    /// Epoch seconds at enqueue time.
    pub queue_time: f64,
}

impl QueuedJob {
    /// Wraps a job with a fresh id and the current time.
    pub fn new(job: Job) -> Self {
        Self {
            job,
            id: Uuid::new_v4().to_string(),
            queue_time: now_epoch(),
        }
    }

    /// Seconds spent waiting in the queue as of `now`.
    pub fn latency(&self, now: f64) -> f64 {
        (now - self.queue_time).max(0.0)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a queued job. A missing `id` or `queue_time` is an error.
    pub fn decode(raw: &str) -> Result<Self, PayloadError> {
        let queued: QueuedJob =
            serde_json::from_str(raw).map_err(|source| PayloadError::Malformed {
                raw: raw.to_string(),
                source,
            })?;
        if queued.id.is_empty() {
            return Err(PayloadError::InvalidField {
                field: "id".to_string(),
                raw: raw.to_string(),
            });
        }
        if queued.job.class.is_empty() {
            return Err(PayloadError::InvalidField {
                field: "class".to_string(),
                raw: raw.to_string(),
            });
        }
        Ok(queued)
    }
}

/// Where a job is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    /// A plain FIFO queue.
    Queue { name: String },
    /// A batch pool; `suffix` separates batches of the same source and name.
    Pool { pool: String, suffix: String },
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue { name: name.into() }
    }

    pub fn pool(pool: impl Into<String>, suffix: impl Into<String>) -> Self {
        Destination::Pool {
            pool: pool.into(),
            suffix: suffix.into(),
        }
    }
}

impl Default for Destination {
    fn default() -> Self {
        Destination::queue(DEFAULT_QUEUE)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue { name } => write!(f, "queue:{}", name),
            Destination::Pool { pool, suffix } => write!(f, "pool:{}/{}", pool, suffix),
        }
    }
}

/// A delayed job stored in a timestamp bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledEntry {
    pub target: Destination,
    pub job: Job,
}

/// A recurring job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedJob {
    #[serde(flatten)]
    pub job: Job,
    pub id: String,
    /// Unix seconds of the next occurrence.
    pub next_run: i64,
    /// ISO-8601 duration between occurrences.
    pub recurrence_interval: String,
    #[serde(default)]
    pub target: Destination,
}

impl PlannedJob {
    /// Creates a plan with a fresh id.
    pub fn new(job: Job, next_run: i64, interval: &RecurrenceInterval) -> Self {
        Self {
            job,
            id: Uuid::new_v4().to_string(),
            next_run,
            recurrence_interval: interval.to_string(),
            target: Destination::default(),
        }
    }

    pub fn with_target(mut self, target: Destination) -> Self {
        self.target = target;
        self
    }

    pub fn interval(&self) -> Result<RecurrenceInterval, crate::error::SchedulerError> {
        self.recurrence_interval.parse()
    }

    /// Moves `next_run` to the first occurrence strictly after `reference`.
    pub fn advance_past(&mut self, reference: i64) -> Result<(), crate::error::SchedulerError> {
        self.next_run = self.interval()?.advance_past(self.next_run, reference)?;
        Ok(())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, PayloadError> {
        serde_json::from_str(raw).map_err(|source| PayloadError::Malformed {
            raw: raw.to_string(),
            source,
        })
    }
}
