//! Job queue repository trait definition.
//!
//! The storage interface behind [`crate::engine::queue::JobQueue`]. The one
//! operation that needs store-level atomicity is `claim_next`: it must pick
//! the winning eligible job and mark it `Active` in a single step, so two
//! workers never receive the same job.

use chrono::{DateTime, Utc};
use gantry_types::error::RepositoryError;
use gantry_types::job::{Job, JobStatus};
use uuid::Uuid;

/// Repository trait for persisted queue jobs.
pub trait JobRepository: Send + Sync {
    /// Insert a job. The store assigns the insertion-order `seq` and returns
    /// the stored record.
    fn insert_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<Job, RepositoryError>> + Send;

    /// Get a job by id.
    fn get_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Replace a job record by id.
    fn update_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically claim the next eligible job: claimable status
    /// (`Waiting`/`Delayed`), `available_at <= now`, optionally restricted to
    /// one instance. Ordering: priority descending, `available_at` ascending,
    /// then insertion order. The claimed job is returned already `Active`.
    fn claim_next(
        &self,
        instance: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// List jobs in a status, optionally restricted to one instance,
    /// insertion order.
    fn list_jobs(
        &self,
        status: JobStatus,
        instance: Option<Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    /// Delete every job belonging to an instance. Returns the count removed.
    fn delete_jobs_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Delete terminal (completed/failed) jobs created before `cutoff`.
    /// Returns the count removed.
    fn delete_jobs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
