pub mod constant;
pub mod error;
pub mod mongodb;

use ::mongodb::bson::Document;
use async_trait::async_trait;
use uuid::Uuid;

pub use error::DatabaseError;

use crate::types::jobs::job_item::JobItem;

/// Persistence contract for job documents.
///
/// All filters and updates are expressed as BSON documents so callers keep
/// full control over the query shape. Every write that returns a document
/// returns the post-update state, and implementations are expected to stamp
/// audit fields (`updated_at`, `version`) on each mutation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job document. Fails if a job with the same id exists.
    async fn create_job(&self, job: JobItem) -> Result<JobItem, DatabaseError>;

    /// Fetch a job by its id.
    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<JobItem>, DatabaseError>;

    /// Fetch the first job matching the filter.
    async fn find_one(&self, filter: Document) -> Result<Option<JobItem>, DatabaseError>;

    /// Fetch all jobs matching the filter, optionally sorted.
    async fn find_many(&self, filter: Document, sort: Option<Document>) -> Result<Vec<JobItem>, DatabaseError>;

    /// Atomically find one job matching the filter, apply the update, and
    /// return the updated document. Returns `None` when no job matched,
    /// which is how competing claimers lose a race without erroring.
    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        array_filters: Option<Vec<Document>>,
    ) -> Result<Option<JobItem>, DatabaseError>;

    /// Update the first job matching the filter. Returns the number of
    /// documents modified (0 or 1).
    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        array_filters: Option<Vec<Document>>,
    ) -> Result<u64, DatabaseError>;

    /// Update every job matching the filter. Returns the number of
    /// documents modified.
    async fn update_many(&self, filter: Document, update: Document) -> Result<u64, DatabaseError>;

    /// Distinct string values of a field across jobs matching the filter.
    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<String>, DatabaseError>;
}
