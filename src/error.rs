//! Error types for jobforge operations.
//!
//! Defines the error taxonomy shared by every subsystem:
//! - Transport failures talking to the shared store
//! - Payload corruption (undecodable or incomplete job JSON)
//! - Coordination signals raised by the unique-job and batch-pool protocols
//! - Job sources, reservation strategies and schedulers
//! - Configuration loading and validation
//!
//! Coordination signals (`UniqueError::Deferred`, `PoolError::NoUnits`, ...)
//! are control flow, not bugs: callers are expected to match on them.

use thiserror::Error;

/// Errors raised by the shared key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Store operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected reply from {operation}: {reply}")]
    UnexpectedReply { operation: String, reply: String },

    #[error("Invalid call to script '{script}': {reason}")]
    InvalidScriptCall { script: String, reason: String },
}

/// Errors raised when decoding a job payload.
///
/// Every variant keeps the raw payload so it can be logged before the
/// entry is dropped from its source.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed job payload ({source}): {raw}")]
    Malformed {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid field '{field}' in job payload: {raw}")]
    InvalidField { field: String, raw: String },
}

impl PayloadError {
    /// Returns the raw payload that failed to decode.
    pub fn raw(&self) -> &str {
        match self {
            PayloadError::Malformed { raw, .. } => raw,
            PayloadError::InvalidField { raw, .. } => raw,
        }
    }
}

/// Errors raised by the unique-job coordination protocol.
#[derive(Debug, Error)]
pub enum UniqueError {
    /// Another job with the same unique id is running; this payload now
    /// occupies the deferred slot and will run after the lock is released.
    #[error("Job with unique id '{0}' deferred behind a running job")]
    Deferred(String),

    /// Another job with the same unique id is running and this payload was
    /// dropped (not deferrable, or the deferred slot was already taken).
    #[error("Job with unique id '{0}' discarded: already running")]
    Discarded(String),

    /// `unlock` was called for a unique id that holds no state.
    #[error("No lock held for unique id '{0}'")]
    MissingLock(String),

    #[error("Unique id must not be empty")]
    EmptyId,

    #[error("Invalid unique state '{0}'")]
    InvalidState(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the batch pool protocol.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool '{0}' has no units available")]
    NoUnits(String),

    #[error("Unit queue '{0}' was retired before the batch could be assigned")]
    StaleTarget(String),

    #[error("Invalid batch id '{0}'")]
    InvalidBatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the producer-side enqueue path.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Job with unique id '{0}' is already queued or running")]
    UniqueConflict(String),

    /// The payload moved by an atomic pop-and-push differs from the one the
    /// caller staged. Only possible if atomicity was broken; the process
    /// must stop.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EnqueueError {
    /// Whether retrying the same enqueue later can succeed. Only store
    /// failures qualify; a malformed job or destination fails every time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EnqueueError::Store(_) | EnqueueError::Pool(PoolError::Store(_))
        )
    }
}

/// Errors raised by job sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source can structurally no longer yield jobs.
    #[error("Job source '{0}' is no longer available")]
    Unavailable(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcomes of a reservation attempt other than a reserved job.
#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("No job reserved before the wait elapsed")]
    WaitTimeout,

    #[error("Worker should terminate: source stayed empty")]
    Terminate,

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Errors raised by the delayed and planned schedulers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Plan '{0}' not found")]
    PlanNotFound(String),

    #[error("Invalid recurrence interval '{0}'")]
    InvalidInterval(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Whether the error signals broken atomicity; the process must stop.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, SchedulerError::Enqueue(EnqueueError::InvariantViolation(_)))
    }
}

/// Errors raised by the worker loop itself (never by the job it runs).
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Job source failed: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Unique(#[from] UniqueError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Whether the error signals broken atomicity; the process must stop.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            WorkerError::InvariantViolation(_)
                | WorkerError::Enqueue(EnqueueError::InvariantViolation(_))
                | WorkerError::Scheduler(SchedulerError::Enqueue(
                    EnqueueError::InvariantViolation(_)
                ))
        )
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid process identity '{0}'")]
    InvalidIdentity(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the process maintainer.
#[derive(Debug, Error)]
pub enum MaintainerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Unique(#[from] UniqueError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_error_display() {
        let err = UniqueError::Deferred("u1".to_string());
        assert!(err.to_string().contains("u1"));
        assert!(err.to_string().contains("deferred"));

        let err = UniqueError::MissingLock("u2".to_string());
        assert!(err.to_string().contains("No lock"));
    }

    #[test]
    fn test_payload_error_keeps_raw() {
        let source = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = PayloadError::Malformed {
            raw: "{oops".to_string(),
            source,
        };
        assert_eq!(err.raw(), "{oops");
        assert!(err.to_string().contains("{oops"));
    }

    #[test]
    fn test_enqueue_invariant_is_detected_through_worker_error() {
        let err: WorkerError = EnqueueError::InvariantViolation("mismatch".to_string()).into();
        assert!(err.is_invariant_violation());

        let err: WorkerError = EnqueueError::UniqueConflict("u1".to_string()).into();
        assert!(!err.is_invariant_violation());
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::NoUnits("reports".to_string());
        assert!(err.to_string().contains("no units"));
    }
}
