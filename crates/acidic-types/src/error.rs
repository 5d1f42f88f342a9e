use thiserror::Error;

/// Errors from repository operations (used by trait definitions in acidic-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors reported by the external job queue when handing it a job.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job rejected by queue: {0}")]
    Rejected(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}
