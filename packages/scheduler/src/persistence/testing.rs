//! In-memory persistence for tests.
//!
//! Mirrors the Postgres implementation's semantics over a mutex-guarded map
//! so scheduler components can be exercised without a database.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{JobPersistence, PersistenceError, PersistenceResult};
use crate::models::{
    Attempt, AttemptOutput, AttemptStatus, ConfigType, Job, JobConfig, JobStatus,
};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<i64, Job>,
    next_id: i64,
    version: Option<String>,
}

/// Map-backed stand-in for [`super::PostgresPersistence`].
#[derive(Default)]
pub struct InMemoryPersistence {
    inner: Mutex<Inner>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job, for assertions.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.lock().unwrap().jobs.values().cloned().collect()
    }

    /// Backdate an attempt end so cadence and backoff windows can be
    /// exercised without sleeping.
    pub fn set_attempt_ended_at(&self, job_id: i64, attempt_number: i32, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if let Some(attempt) = job
                .attempts
                .iter_mut()
                .find(|a| a.attempt_number == attempt_number)
            {
                attempt.ended_at = Some(at);
            }
        }
    }
}

#[async_trait]
impl JobPersistence for InMemoryPersistence {
    async fn enqueue_job(&self, scope: &str, config: JobConfig) -> PersistenceResult<Option<i64>> {
        let mut inner = self.inner.lock().unwrap();

        let config_type = config.config_type();
        let duplicate = inner.jobs.values().any(|j| {
            j.scope == scope && j.config_type == config_type && !j.status.is_terminal()
        });
        if duplicate {
            return Ok(None);
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        inner.jobs.insert(
            id,
            Job {
                id,
                scope: scope.to_string(),
                config_type,
                config,
                status: JobStatus::Pending,
                created_at: now,
                updated_at: now,
                attempts: vec![],
            },
        );
        Ok(Some(id))
    }

    async fn create_attempt(&self, job_id: i64, log_path: &str) -> PersistenceResult<i32> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(PersistenceError::NotFound(job_id))?;

        if !matches!(job.status, JobStatus::Pending | JobStatus::Incomplete) {
            return Err(PersistenceError::InvalidStatus(format!(
                "cannot create an attempt on job {job_id} in status {:?}",
                job.status
            )));
        }

        let attempt_number = job.next_attempt_number();
        let now = Utc::now();
        job.attempts.push(Attempt {
            job_id,
            attempt_number,
            status: AttemptStatus::Running,
            log_path: log_path.to_string(),
            output: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        });
        job.status = JobStatus::Running;
        job.updated_at = now;
        Ok(attempt_number)
    }

    async fn fail_attempt(&self, job_id: i64, attempt_number: i32) -> PersistenceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(PersistenceError::NotFound(job_id))?;

        let now = Utc::now();
        let attempt = job
            .attempts
            .iter_mut()
            .find(|a| a.attempt_number == attempt_number)
            .ok_or_else(|| {
                PersistenceError::InvalidStatus(format!(
                    "attempt {attempt_number} of job {job_id} does not exist"
                ))
            })?;
        attempt.status = AttemptStatus::Failed;
        attempt.ended_at = Some(now);
        attempt.updated_at = now;

        if !job.status.is_terminal() {
            job.status = JobStatus::Incomplete;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn succeed_attempt(
        &self,
        job_id: i64,
        attempt_number: i32,
        output: AttemptOutput,
    ) -> PersistenceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(PersistenceError::NotFound(job_id))?;

        let now = Utc::now();
        let attempt = job
            .attempts
            .iter_mut()
            .find(|a| a.attempt_number == attempt_number)
            .ok_or_else(|| {
                PersistenceError::InvalidStatus(format!(
                    "attempt {attempt_number} of job {job_id} does not exist"
                ))
            })?;
        attempt.status = AttemptStatus::Succeeded;
        attempt.output = Some(output);
        attempt.ended_at = Some(now);
        attempt.updated_at = now;

        if !job.status.is_terminal() {
            job.status = JobStatus::Succeeded;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn cancel_job(&self, job_id: i64) -> PersistenceResult<()> {
        self.terminate_job(job_id, JobStatus::Cancelled)
    }

    async fn fail_job(&self, job_id: i64) -> PersistenceResult<()> {
        self.terminate_job(job_id, JobStatus::Failed)
    }

    async fn requeue_job(&self, job_id: i64) -> PersistenceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(PersistenceError::NotFound(job_id))?;
        if job.status != JobStatus::Incomplete {
            return Err(PersistenceError::InvalidStatus(format!(
                "job {job_id} is not INCOMPLETE"
            )));
        }
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> PersistenceResult<Job> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(PersistenceError::NotFound(job_id))
    }

    async fn list_jobs_with_status(&self, status: JobStatus) -> PersistenceResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn list_jobs(
        &self,
        config_type: ConfigType,
        scope: &str,
        page_size: i64,
        offset: i64,
    ) -> PersistenceResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.config_type == config_type && j.scope == scope)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse((j.created_at, j.id)));
        Ok(jobs
            .into_iter()
            .skip(offset as usize)
            .take(page_size as usize)
            .collect())
    }

    async fn get_next_job(&self) -> PersistenceResult<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| {
                !inner
                    .jobs
                    .values()
                    .any(|r| r.scope == j.scope && r.status == JobStatus::Running)
            })
            .collect();
        candidates.sort_by_key(|j| (j.created_at, j.id));
        Ok(candidates.first().map(|j| (*j).clone()))
    }

    async fn get_last_replication_job(&self, scope: &str) -> PersistenceResult<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|j| {
                j.scope == scope && j.config_type == ConfigType::Sync && j.status.is_terminal()
            })
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs.last().map(|j| (*j).clone()))
    }

    async fn get_version(&self) -> PersistenceResult<Option<String>> {
        Ok(self.inner.lock().unwrap().version.clone())
    }

    async fn set_version(&self, version: &str) -> PersistenceResult<()> {
        self.inner.lock().unwrap().version = Some(version.to_string());
        Ok(())
    }
}

impl InMemoryPersistence {
    fn terminate_job(&self, job_id: i64, terminal: JobStatus) -> PersistenceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(PersistenceError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        job.status = terminal;
        job.updated_at = now;
        for attempt in &mut job.attempts {
            if attempt.status == AttemptStatus::Running {
                attempt.status = AttemptStatus::Failed;
                attempt.ended_at = Some(now);
                attempt.updated_at = now;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncConfig, SyncSummary};

    fn sync_config() -> JobConfig {
        JobConfig::Sync(SyncConfig {
            source_image: "airbyte/source-postgres:0.1.0".into(),
            destination_image: "airbyte/destination-csv:0.1.0".into(),
            source_configuration: serde_json::json!({}),
            destination_configuration: serde_json::json!({}),
            catalog: serde_json::json!({"streams": []}),
        })
    }

    fn sync_output() -> AttemptOutput {
        AttemptOutput::Sync {
            summary: SyncSummary::default(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_succeed_round_trip() {
        let store = InMemoryPersistence::new();
        let job_id = store.enqueue_job("c1", sync_config()).await.unwrap().unwrap();
        let attempt = store.create_attempt(job_id, "/workspace/1/0").await.unwrap();
        assert_eq!(attempt, 0);

        store.succeed_attempt(job_id, attempt, sync_output()).await.unwrap();

        let succeeded = store
            .list_jobs_with_status(JobStatus::Succeeded)
            .await
            .unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].id, job_id);
    }

    #[tokio::test]
    async fn uniqueness_guard_suppresses_duplicate_enqueue() {
        let store = InMemoryPersistence::new();
        let first = store.enqueue_job("c1", sync_config()).await.unwrap();
        let second = store.enqueue_job("c1", sync_config()).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        // Once the first job is terminal a new one is allowed again.
        let job_id = first.unwrap();
        let attempt = store.create_attempt(job_id, "/workspace/1/0").await.unwrap();
        store.succeed_attempt(job_id, attempt, sync_output()).await.unwrap();
        assert!(store.enqueue_job("c1", sync_config()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn attempt_numbers_are_dense() {
        let store = InMemoryPersistence::new();
        let job_id = store.enqueue_job("c1", sync_config()).await.unwrap().unwrap();

        assert_eq!(store.create_attempt(job_id, "/workspace/1/0").await.unwrap(), 0);
        store.fail_attempt(job_id, 0).await.unwrap();
        assert_eq!(store.create_attempt(job_id, "/workspace/1/1").await.unwrap(), 1);

        let job = store.get_job(job_id).await.unwrap();
        let numbers: Vec<i32> = job.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, [0, 1]);
    }

    #[tokio::test]
    async fn create_attempt_rejects_running_job() {
        let store = InMemoryPersistence::new();
        let job_id = store.enqueue_job("c1", sync_config()).await.unwrap().unwrap();
        store.create_attempt(job_id, "/workspace/1/0").await.unwrap();

        let err = store.create_attempt(job_id, "/workspace/1/1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn next_job_skips_scopes_with_running_work() {
        let store = InMemoryPersistence::new();
        let busy = store.enqueue_job("c1", sync_config()).await.unwrap().unwrap();
        store.create_attempt(busy, "/workspace/1/0").await.unwrap();

        // c1 has a RUNNING job; a new PENDING job for c2 is the only
        // candidate even though other pending work exists for c1.
        let other = store.enqueue_job("c2", sync_config()).await.unwrap().unwrap();
        let next = store.get_next_job().await.unwrap().unwrap();
        assert_eq!(next.id, other);
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_on_terminal_jobs() {
        let store = InMemoryPersistence::new();
        let job_id = store.enqueue_job("c1", sync_config()).await.unwrap().unwrap();
        let attempt = store.create_attempt(job_id, "/workspace/1/0").await.unwrap();
        store.succeed_attempt(job_id, attempt, sync_output()).await.unwrap();

        store.cancel_job(job_id).await.unwrap();
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancel_fails_running_attempts() {
        let store = InMemoryPersistence::new();
        let job_id = store.enqueue_job("c1", sync_config()).await.unwrap().unwrap();
        store.create_attempt(job_id, "/workspace/1/0").await.unwrap();

        store.cancel_job(job_id).await.unwrap();
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempts[0].status, AttemptStatus::Failed);
        assert!(job.attempts[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn version_round_trips() {
        let store = InMemoryPersistence::new();
        assert!(store.get_version().await.unwrap().is_none());
        store.set_version("0.29.0").await.unwrap();
        assert_eq!(store.get_version().await.unwrap().as_deref(), Some("0.29.0"));
    }
}
