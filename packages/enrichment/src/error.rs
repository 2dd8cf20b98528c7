//! Typed errors for the enrichment pipeline.
//!
//! Row-scoped errors ([`FetchError`], [`CompletionError`]) are stored inside
//! row results as data. Only [`PipelineError`] ever stops a batch.

use std::time::Duration;

use thiserror::Error;

use crate::types::account::AccountId;

/// Failure of a single page fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request did not finish within the fetch timeout
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    /// The server answered with a non-2xx status
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Connection, DNS, TLS or body read failure
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    /// The target could not be turned into a fetchable URL
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },
}

impl FetchError {
    pub(crate) fn invalid(target: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of one completion request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// The service asked us to slow down
    #[error("rate limited by completion service: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Timeouts, 5xx responses, dropped connections
    #[error("transient completion failure: {0}")]
    Transient(String),

    /// Authentication, bad request, unknown model; never retried
    #[error("completion failed: {0}")]
    Fatal(String),

    /// The batch was cancelled while this request was waiting
    #[error("completion cancelled")]
    Cancelled,
}

impl CompletionError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_) | Self::Cancelled)
    }

    /// Server-suggested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Quota ledger errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// The request needs more rows than the account has left
    #[error("quota exceeded: requested {requested} rows, {remaining} remaining")]
    QuotaExceeded { requested: u64, remaining: u64 },

    #[error("unknown account: {0}")]
    AccountNotFound(AccountId),

    /// The reservation was already committed or released
    #[error("reservation already settled")]
    AlreadySettled,

    /// Backing store failure; may succeed on retry
    #[error("quota storage error: {0}")]
    Storage(String),
}

impl QuotaError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Errors reading or writing delimited tables.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("column not found: {0}")]
    MissingColumn(String),

    #[error("table has no header row")]
    NoHeader,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Batch-level failures. Any of these means the batch produced no table.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Raised before any row is dispatched
    #[error("quota exceeded: requested {requested} rows but only {remaining} remain this period")]
    QuotaExceeded { requested: u64, remaining: u64 },

    /// Unreadable input or a scheduler fault
    #[error("batch aborted: {0}")]
    BatchAbort(String),

    /// Additional-column definitions failed validation
    #[error("invalid analysis columns: {0}")]
    InvalidColumns(String),
}

impl From<TableError> for PipelineError {
    fn from(e: TableError) -> Self {
        Self::BatchAbort(e.to_string())
    }
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type alias for completion operations.
pub type CompletionResult<T> = std::result::Result<T, CompletionError>;

/// Result type alias for quota operations.
pub type QuotaResult<T> = std::result::Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_error_retryability() {
        assert!(CompletionError::Transient("503".into()).is_retryable());
        assert!(CompletionError::RateLimited {
            message: "slow down".into(),
            retry_after: None
        }
        .is_retryable());
        assert!(!CompletionError::Fatal("bad key".into()).is_retryable());
        assert!(!CompletionError::Cancelled.is_retryable());
    }

    #[test]
    fn test_quota_exceeded_message() {
        let err = PipelineError::QuotaExceeded {
            requested: 50,
            remaining: 10,
        };
        assert_eq!(
            err.to_string(),
            "quota exceeded: requested 50 rows but only 10 remain this period"
        );
    }

    #[test]
    fn test_table_error_becomes_batch_abort() {
        let err: PipelineError = TableError::MissingColumn("Websites".into()).into();
        assert!(matches!(err, PipelineError::BatchAbort(msg) if msg.contains("Websites")));
    }
}
