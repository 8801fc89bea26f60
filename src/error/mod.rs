use std::fmt;

use color_eyre::eyre::eyre;
use thiserror::Error;
use uuid::Uuid;

use crate::core::client::database::DatabaseError;
use crate::core::client::publisher::PublisherError;

pub type JobResult<T> = Result<T, JobError>;

/// Error types for job lifecycle operations
#[derive(Error, Debug)]
pub enum JobError {
    /// Indicates the requested job could not be found. Raised by the
    /// terminal-state operations, where a missing job means the caller holds
    /// a stale reference.
    #[error("Failed to find job with id {id:?}")]
    JobNotFound { id: Uuid },

    /// Indicates an attempt to record consumed resources on a job that
    /// carries no cost information at all.
    #[error("Job {id} has no cost information, cannot update consumed resources")]
    MissingCost { id: Uuid },

    /// Indicates an update was requested with no field to change
    #[error("No field to be updated, likely a false call")]
    NoUpdateFound,

    /// Wraps errors from the job store
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Wraps errors from the event publisher. The state transition has
    /// already committed when this is raised; the write is not rolled back.
    #[error("Event publisher error: {0}")]
    Publisher(#[from] PublisherError),

    /// Wraps general errors that don't fit other categories
    #[error("Other error: {0}")]
    Other(#[from] OtherError),
}

/// Wrapper type for the `Other(<>)` job error variant
///
/// Provides a generic error type for cases that don't fit into specific
/// error categories while maintaining error chain context.
#[derive(Debug)]
pub struct OtherError(color_eyre::eyre::Error);

impl fmt::Display for OtherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for OtherError {}

impl From<color_eyre::eyre::Error> for OtherError {
    fn from(err: color_eyre::eyre::Error) -> Self {
        OtherError(err)
    }
}

impl From<String> for OtherError {
    fn from(error_string: String) -> Self {
        OtherError(eyre!(error_string))
    }
}

impl From<color_eyre::Report> for JobError {
    fn from(err: color_eyre::Report) -> Self {
        JobError::Other(OtherError(err))
    }
}
