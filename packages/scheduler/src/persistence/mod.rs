//! Transactional job store.
//!
//! The database is the system of record and the only cross-thread
//! synchronizer: scheduler, retrier, submitter, reaper, and cleaner all
//! coordinate exclusively through these operations. Every operation is a
//! single transaction; readers only ever observe committed state.

mod postgres;
pub mod testing;

use async_trait::async_trait;

use crate::models::{AttemptOutput, ConfigType, Job, JobConfig, JobStatus};

pub use postgres::PostgresPersistence;
pub use testing::InMemoryPersistence;

/// Metadata key holding the platform version written by the config server.
pub const VERSION_KEY: &str = "version";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("job {0} not found")]
    NotFound(i64),
    /// An operation was applied to a job in the wrong state, e.g. an attempt
    /// created on a terminal job. Fatal to the current dispatch tick, never
    /// to the process.
    #[error("invalid job state: {0}")]
    InvalidStatus(String),
    /// Storage fault; retried on the next tick.
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl PersistenceError {
    /// Whether the next tick may plausibly succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::Storage(_))
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// The job lifecycle API. All job and attempt mutations flow through here;
/// no other writer is permitted.
#[async_trait]
pub trait JobPersistence: Send + Sync {
    /// Create a PENDING job for the scope. Returns `None` when a
    /// non-terminal job of the same config type already exists for that
    /// scope (the uniqueness guard).
    async fn enqueue_job(&self, scope: &str, config: JobConfig) -> PersistenceResult<Option<i64>>;

    /// Create the next attempt and move the job to RUNNING. Only valid on
    /// PENDING or INCOMPLETE jobs; returns the dense attempt number.
    async fn create_attempt(&self, job_id: i64, log_path: &str) -> PersistenceResult<i32>;

    /// Mark an attempt FAILED; the job becomes INCOMPLETE. Terminal failure
    /// is a separate decision made by the retrier via [`fail_job`].
    ///
    /// [`fail_job`]: JobPersistence::fail_job
    async fn fail_attempt(&self, job_id: i64, attempt_number: i32) -> PersistenceResult<()>;

    /// Mark an attempt SUCCEEDED with its output; the job becomes SUCCEEDED.
    async fn succeed_attempt(
        &self,
        job_id: i64,
        attempt_number: i32,
        output: AttemptOutput,
    ) -> PersistenceResult<()>;

    /// Mark a job CANCELLED, failing any RUNNING attempt. No-op once the job
    /// is terminal.
    async fn cancel_job(&self, job_id: i64) -> PersistenceResult<()>;

    /// Terminal failure, used when the retry budget is exhausted.
    async fn fail_job(&self, job_id: i64) -> PersistenceResult<()>;

    /// Move an INCOMPLETE job back to PENDING so the submitter picks it up.
    async fn requeue_job(&self, job_id: i64) -> PersistenceResult<()>;

    async fn get_job(&self, job_id: i64) -> PersistenceResult<Job>;

    /// Jobs in `status`, oldest first, attempts loaded.
    async fn list_jobs_with_status(&self, status: JobStatus) -> PersistenceResult<Vec<Job>>;

    /// Page through a scope's jobs for the API surface, newest first.
    async fn list_jobs(
        &self,
        config_type: ConfigType,
        scope: &str,
        page_size: i64,
        offset: i64,
    ) -> PersistenceResult<Vec<Job>>;

    /// The oldest PENDING job whose scope has no RUNNING job. Locked with
    /// `FOR UPDATE SKIP LOCKED` so concurrent submitters never hand the same
    /// job to two workers.
    async fn get_next_job(&self) -> PersistenceResult<Option<Job>>;

    /// Most recent terminal SYNC job for the scope, for cadence computation.
    async fn get_last_replication_job(&self, scope: &str) -> PersistenceResult<Option<Job>>;

    /// Platform version recorded by the config server's migrations, when
    /// present.
    async fn get_version(&self) -> PersistenceResult<Option<String>>;

    async fn set_version(&self, version: &str) -> PersistenceResult<()>;
}
