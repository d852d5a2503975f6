//! Czar error types
//!
//! The error taxonomy mirrors the retry policy: plan and unsupported errors
//! stop a query before dispatch, transport and timeout errors requeue jobs
//! up to the attempt bound, and internal errors fail the query loudly.

use thiserror::Error;

/// Errors raised on the czar side of the query pipeline
#[derive(Debug, Error)]
pub enum CzarError {
    /// The SQL cannot be partitioned; user-visible and fatal
    #[error("Plan error: {0}")]
    Plan(String),

    /// Recognized construct that is not modeled; fatal
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// SQL failed to parse at all
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// Catalog lookup failure
    #[error("Catalog error: {0}")]
    Catalog(#[from] skyshard_catalog::CatalogError),

    /// Worker channel failure; retryable
    #[error("Transport error: {0}")]
    Transport(String),

    /// A deadline expired; retryable up to the attempt bound
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The query was cancelled; terminal and silent
    #[error("Cancelled")]
    Cancelled,

    /// Result store (MySQL) failure
    #[error("Result store error: {0}")]
    ResultStore(String),

    /// No such user query
    #[error("Unknown query id: {0}")]
    UnknownQuery(u64),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Broken invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl skyshard_common::CommonError for CzarError {
    fn io_error(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    fn config_error(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    fn internal_error(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

skyshard_common::impl_common_conversions!(CzarError);

impl From<sqlx::Error> for CzarError {
    fn from(e: sqlx::Error) -> Self {
        Self::ResultStore(e.to_string())
    }
}

impl From<skyshard_proto::ProtoError> for CzarError {
    fn from(e: skyshard_proto::ProtoError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl CzarError {
    /// Whether a job failing with this error may be requeued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Numeric code recorded in the query's message store.
    pub fn code(&self) -> u32 {
        match self {
            Self::Plan(_) => 2,
            Self::Unsupported(_) => 3,
            Self::Syntax(_) => 10,
            Self::Catalog(_) => 11,
            Self::Transport(_) => 4,
            Self::Timeout(_) => 5,
            Self::Cancelled => 6,
            Self::ResultStore(_) => 12,
            Self::UnknownQuery(_) => 13,
            Self::Io(_) => 14,
            Self::Configuration(_) => 15,
            Self::Internal(_) => 7,
        }
    }
}

/// Result type for czar operations
pub type CzarResult<T> = Result<T, CzarError>;
