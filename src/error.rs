//! Error types for transaction tracking and job orchestration.
//!
//! Each layer owns its error enum and every enum maps onto the shared
//! [`ErrorKind`] taxonomy through a `kind()` method, so callers at the edge
//! (the status RPC, the job API) can classify failures without matching on
//! every variant.

use chrono::{DateTime, Utc};

use crate::store::backend::StorageError;
use crate::types::{JobId, OwnerId, TxId};

/// Coarse classification shared by every error in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed identifier or key.
    Validation,
    /// Missing record. Cross-owner access is reported the same way.
    NotFound,
    /// Duplicate create or duplicate dispatch.
    AlreadyExists,
    /// Non-terminal; the engine re-enqueues the task.
    Retryable,
    /// Terminal failure of a task or transaction.
    TaskFailure,
    /// Storage, serialization or runtime failure.
    Internal,
}

/// Errors from parsing or constructing identifiers.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// The text form was not valid hex.
    #[error("invalid hex in {kind} '{input}': {source}")]
    InvalidHex {
        kind: &'static str,
        input: String,
        #[source]
        source: hex::FromHexError,
    },

    /// The decoded bytes have the wrong length for this identifier.
    #[error("invalid {kind} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The identifier was empty.
    #[error("empty {kind}")]
    Empty { kind: &'static str },

    /// The Nil value where a real identifier is required.
    #[error("nil {kind}")]
    Nil { kind: &'static str },
}

impl IdError {
    /// Every identifier error is a validation error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Errors raised by the typed record store.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The key could not be built, e.g. a Nil transaction id.
    #[error("cannot construct record key: {reason}")]
    KeyConstructionFailed { reason: String },

    /// No transaction stored under `(owner, tx_id)`.
    #[error("transaction {tx_id} missing for account {owner}")]
    TransactionMissing { owner: OwnerId, tx_id: TxId },

    /// No job record stored under `job_id`.
    #[error("job {job_id} missing")]
    JobMissing { job_id: JobId },

    /// Envelope encoding or decoding failed.
    #[error("failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The envelope decoded to a different record kind than requested.
    #[error("expected a {expected} record, found {found}")]
    UnexpectedRecord {
        expected: &'static str,
        found: &'static str,
    },

    /// A read-modify-write kept losing compare-and-swap races.
    #[error("update of key {key} still conflicting after {attempts} attempts")]
    Contended { key: String, attempts: u32 },

    /// The KV backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RecordError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeyConstructionFailed { .. } => ErrorKind::Validation,
            Self::TransactionMissing { .. } | Self::JobMissing { .. } => ErrorKind::NotFound,
            Self::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Storage(StorageError::AlreadyExists { .. }) => ErrorKind::AlreadyExists,
            Self::Serialization(_)
            | Self::UnexpectedRecord { .. }
            | Self::Contended { .. }
            | Self::Storage(_) => ErrorKind::Internal,
        }
    }
}

/// Errors returned by the transaction manager.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// The awaited transaction ended in [`Status::Failed`](crate::types::Status::Failed).
    #[error("transaction {tx_id} failed: {message}")]
    Failed { tx_id: TxId, message: String },

    /// Persistence failed or the transaction does not exist.
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl TxError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Failed { .. } => ErrorKind::TaskFailure,
            Self::Record(err) => err.kind(),
        }
    }

    /// Returns `true` if the transaction does not exist for that owner.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Outcome of a single task or transaction work unit.
///
/// [`TaskError::Retryable`] is a sentinel: it travels untouched through the
/// status-update wrappers and tells the engine to re-enqueue the task.
///
/// ```
/// use anchor_jobs::{ErrorKind, TaskError};
///
/// assert_eq!(TaskError::Retryable.kind(), ErrorKind::Retryable);
/// assert_eq!(TaskError::failed("boom").to_string(), "boom");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Try the task again later.
    #[error("retryable task error")]
    Retryable,

    /// The task failed for good.
    #[error("{message}")]
    Failed { message: String },
}

impl TaskError {
    /// Builds a terminal failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Returns `true` for the retry sentinel.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }

    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Retryable => ErrorKind::Retryable,
            Self::Failed { .. } => ErrorKind::TaskFailure,
        }
    }
}

impl From<TxError> for TaskError {
    fn from(err: TxError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<RecordError> for TaskError {
    fn from(err: RecordError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<JobError> for TaskError {
    fn from(err: JobError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<IdError> for TaskError {
    fn from(err: IdError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::failed(format!("invalid task payload: {err}"))
    }
}

/// Errors from the job engine and the ownership dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// No such job for this caller.
    #[error("job {job_id} not found")]
    NotFound { job_id: JobId },

    /// The caller already dispatched a job with this id.
    #[error("job {job_id} already dispatched")]
    AlreadyDispatched { job_id: JobId },

    /// No runner is registered under this name.
    #[error("no runner registered under '{name}'")]
    UnknownRunner { name: String },

    /// The runner does not know this task name.
    #[error("runner '{runner}' has no task '{task}'")]
    UnknownTask { runner: String, task: String },

    /// The job ran past its validity window.
    #[error("job {job_id} expired at {valid_until}")]
    Expired {
        job_id: JobId,
        valid_until: DateTime<Utc>,
    },

    /// The job reached a terminal failure.
    #[error("job {job_id} failed: {message}")]
    Failed { job_id: JobId, message: String },

    /// The token passed to `await_result` fired first.
    #[error("waiting for job {job_id} was cancelled")]
    AwaitCancelled { job_id: JobId },

    /// The engine has been shut down.
    #[error("job engine is not running")]
    EngineStopped,

    /// Persistence failed.
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl JobError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyDispatched { .. } => ErrorKind::AlreadyExists,
            Self::UnknownRunner { .. } | Self::UnknownTask { .. } => ErrorKind::Validation,
            Self::Expired { .. } | Self::Failed { .. } => ErrorKind::TaskFailure,
            Self::AwaitCancelled { .. } | Self::EngineStopped => ErrorKind::Internal,
            Self::Record(err) => err.kind(),
        }
    }
}

/// Errors surfaced by the status query boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The transaction id string is malformed.
    #[error("invalid transaction id: {0}")]
    InvalidTransactionId(#[source] IdError),

    /// The request context carries no usable account id.
    #[error("invalid account id: {reason}")]
    InvalidAccountId { reason: String },

    /// No such transaction for this account.
    #[error("transaction missing")]
    TransactionMissing,

    /// Anything else.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransactionId(_) | Self::InvalidAccountId { .. } => ErrorKind::Validation,
            Self::TransactionMissing => ErrorKind::NotFound,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Errors that occur while loading or validating [`OrchestratorConfig`](crate::OrchestratorConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML is malformed or does not match the schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// The config parsed but carries invalid values.
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// The config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_kinds() {
        let err = RecordError::KeyConstructionFailed {
            reason: "nil transaction id".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = RecordError::TransactionMissing {
            owner: OwnerId::new([1u8; 32]),
            tx_id: TxId::new(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = RecordError::Storage(StorageError::AlreadyExists {
            key: "00".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn tx_error_wraps_record_kind() {
        let err = TxError::from(RecordError::TransactionMissing {
            owner: OwnerId::new([2u8; 32]),
            tx_id: TxId::new(),
        });
        assert!(err.is_not_found());
    }

    #[test]
    fn task_error_from_tx_error_is_terminal() {
        let err = TaskError::from(TxError::Failed {
            tx_id: TxId::new(),
            message: "reverted".to_string(),
        });
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("reverted"));
    }

    #[test]
    fn job_error_display() {
        let job_id = JobId::from_bytes(vec![0xab, 0xcd]);
        let err = JobError::AlreadyDispatched {
            job_id: job_id.clone(),
        };
        assert_eq!(err.to_string(), "job 0xabcd already dispatched");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = JobError::UnknownTask {
            runner: "identity".to_string(),
            task: "mint".to_string(),
        };
        assert_eq!(err.to_string(), "runner 'identity' has no task 'mint'");
    }

    #[test]
    fn api_error_kinds() {
        assert_eq!(ApiError::TransactionMissing.kind(), ErrorKind::NotFound);
        assert_eq!(
            ApiError::InvalidAccountId {
                reason: "missing".to_string()
            }
            .kind(),
            ErrorKind::Validation
        );
    }
}
