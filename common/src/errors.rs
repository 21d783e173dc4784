// Error handling framework

use std::time::Duration;
use thiserror::Error;

/// Static configuration errors (catalog entries, cron expressions, pipelines, settings)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("Malformed partition '{key}': {reason}")]
    MalformedPartition { key: String, reason: String },

    #[error("Duplicate partition key: {0}")]
    DuplicatePartition(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

/// Errors raised while listing candidate keys from the discovery source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Discovery source unavailable: {0}")]
    Unavailable(String),

    #[error("Discovery poll timed out after {0:?}")]
    Timeout(Duration),

    #[error("Discovery poll cancelled by shutdown")]
    Cancelled,
}

/// Seen-key store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeenKeyError {
    #[error("Key already recorded: {0}")]
    DuplicateKey(String),

    #[error("Seen-key storage failed: {0}")]
    Storage(String),
}

/// Step execution errors, classified as retriable or not by the retry policy predicate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("Transient step failure: {0}")]
    Transient(String),

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid step configuration: {0}")]
    Configuration(String),

    #[error("Step failed: {0}")]
    Fatal(String),
}

impl StepError {
    /// Default retriable classification: transient failures and timeouts
    pub fn is_retriable(&self) -> bool {
        matches!(self, StepError::Transient(_) | StepError::Timeout(_))
    }
}

impl From<StorageError> for StepError {
    fn from(err: StorageError) -> Self {
        StepError::Transient(err.to_string())
    }
}

/// Terminal failure of a single run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Step '{step_id}' failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step_id: String,
        attempts: u32,
        #[source]
        source: StepError,
    },

    #[error("Run task aborted: {0}")]
    Aborted(String),
}

/// Run executor errors (not raised for idempotent resubmission)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Executor is shut down")]
    ShutDown,

    #[error("Run submission failed: {0}")]
    SubmissionFailed(String),
}

/// Storage client errors (S3, Redis, filesystem)
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::RedisError(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::FileSystemError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

impl From<StorageError> for SeenKeyError {
    fn from(err: StorageError) -> Self {
        SeenKeyError::Storage(err.to_string())
    }
}

impl From<StorageError> for DiscoveryError {
    fn from(err: StorageError) -> Self {
        DiscoveryError::Unavailable(err.to_string())
    }
}

/// Errors that end one trigger tick without stopping the timer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    SeenKeys(#[from] SeenKeyError),
}
