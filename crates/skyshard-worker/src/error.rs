//! Worker error types

use thiserror::Error;

/// Errors raised on the worker side of the query pipeline
#[derive(Debug, Error)]
pub enum WorkerError {
    /// This worker does not own the claimed chunk
    #[error("Resource mismatch: this worker does not own {db} chunk {chunk}")]
    ResourceMismatch { db: String, chunk: u32 },

    /// A task for the same (query, job) is already active
    #[error("Duplicate task for query {query_id} job {job_id}")]
    DuplicateTask { query_id: u64, job_id: u32 },

    /// The send channel was killed; no further replies are possible
    #[error("Send channel is dead")]
    ChannelDead,

    /// `last` was already sent on this channel
    #[error("Reply stream already finished")]
    StreamFinished,

    /// The task was cancelled while waiting or running
    #[error("Task cancelled")]
    Cancelled,

    /// Local query execution failed
    #[error("Query execution error: {0}")]
    QueryExec(String),

    /// Wire protocol failure
    #[error("Protocol error: {0}")]
    Proto(#[from] skyshard_proto::ProtoError),

    /// Database driver failure
    #[error("Database error: {0}")]
    Database(String),

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

impl skyshard_common::CommonError for WorkerError {
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

skyshard_common::impl_common_conversions!(WorkerError);

impl From<sqlx::Error> for WorkerError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
