//! Postgres-backed job persistence.
//!
//! Plain SQL through sqlx; every trait operation runs in one transaction.
//! Jobs and attempts are separate tables keyed by the monotonic job id, with
//! config and output payloads as JSONB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use super::{JobPersistence, PersistenceError, PersistenceResult, VERSION_KEY};
use crate::models::{Attempt, AttemptOutput, AttemptStatus, ConfigType, Job, JobConfig, JobStatus};

const JOB_COLUMNS: &str = "id, scope, config_type, config, status, created_at, updated_at";
const ATTEMPT_COLUMNS: &str =
    "job_id, attempt_number, status, log_path, output, created_at, updated_at, ended_at";

pub struct PostgresPersistence {
    pool: PgPool,
}

#[derive(FromRow)]
struct JobRow {
    id: i64,
    scope: String,
    config_type: ConfigType,
    config: Json<JobConfig>,
    status: JobStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct AttemptRow {
    job_id: i64,
    attempt_number: i32,
    status: AttemptStatus,
    log_path: String,
    output: Option<Json<AttemptOutput>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<AttemptRow> for Attempt {
    fn from(row: AttemptRow) -> Self {
        Attempt {
            job_id: row.job_id,
            attempt_number: row.attempt_number,
            status: row.status,
            log_path: row.log_path,
            output: row.output.map(|o| o.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            ended_at: row.ended_at,
        }
    }
}

fn to_job(row: JobRow, attempts: Vec<Attempt>) -> Job {
    Job {
        id: row.id,
        scope: row.scope,
        config_type: row.config_type,
        config: row.config.0,
        status: row.status,
        created_at: row.created_at,
        updated_at: row.updated_at,
        attempts,
    }
}

async fn fetch_attempts<'e, E>(executor: E, job_id: i64) -> Result<Vec<Attempt>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, AttemptRow>(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE job_id = $1 ORDER BY attempt_number ASC"
    ))
    .bind(job_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(Attempt::from).collect())
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the jobs-schema migrations. Idempotent; runs at startup.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        use anyhow::Context;
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run scheduler migrations")
    }

    async fn load_jobs(&self, rows: Vec<JobRow>) -> PersistenceResult<Vec<Job>> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let attempts = fetch_attempts(&self.pool, row.id).await?;
            jobs.push(to_job(row, attempts));
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobPersistence for PostgresPersistence {
    async fn enqueue_job(&self, scope: &str, config: JobConfig) -> PersistenceResult<Option<i64>> {
        let config_type = config.config_type();
        let mut tx = self.pool.begin().await?;

        // Uniqueness guard: one non-terminal job per (scope, config type).
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE scope = $1
              AND config_type = $2
              AND status NOT IN ('FAILED', 'SUCCEEDED', 'CANCELLED')
            LIMIT 1
            "#,
        )
        .bind(scope)
        .bind(config_type)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            tx.commit().await?;
            return Ok(None);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (scope, config_type, config, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'PENDING', NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(scope)
        .bind(config_type)
        .bind(Json(config))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(id))
    }

    async fn create_attempt(&self, job_id: i64, log_path: &str) -> PersistenceResult<i32> {
        let mut tx = self.pool.begin().await?;

        let status: Option<JobStatus> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        match status {
            None => return Err(PersistenceError::NotFound(job_id)),
            Some(JobStatus::Pending) | Some(JobStatus::Incomplete) => {}
            Some(other) => {
                return Err(PersistenceError::InvalidStatus(format!(
                    "cannot create an attempt on job {job_id} in status {other:?}"
                )))
            }
        }

        let attempt_number: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_number) + 1, 0) FROM attempts WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO attempts (job_id, attempt_number, status, log_path, created_at, updated_at)
            VALUES ($1, $2, 'RUNNING', $3, NOW(), NOW())
            "#,
        )
        .bind(job_id)
        .bind(attempt_number)
        .bind(log_path)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET status = 'RUNNING', updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(attempt_number)
    }

    async fn fail_attempt(&self, job_id: i64, attempt_number: i32) -> PersistenceResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE attempts
            SET status = 'FAILED', ended_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND attempt_number = $2
            "#,
        )
        .bind(job_id)
        .bind(attempt_number)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PersistenceError::InvalidStatus(format!(
                "attempt {attempt_number} of job {job_id} does not exist"
            )));
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'INCOMPLETE', updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('FAILED', 'SUCCEEDED', 'CANCELLED')
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn succeed_attempt(
        &self,
        job_id: i64,
        attempt_number: i32,
        output: AttemptOutput,
    ) -> PersistenceResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE attempts
            SET status = 'SUCCEEDED', output = $3, ended_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND attempt_number = $2
            "#,
        )
        .bind(job_id)
        .bind(attempt_number)
        .bind(Json(output))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PersistenceError::InvalidStatus(format!(
                "attempt {attempt_number} of job {job_id} does not exist"
            )));
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'SUCCEEDED', updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('FAILED', 'SUCCEEDED', 'CANCELLED')
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: i64) -> PersistenceResult<()> {
        self.terminate_job(job_id, JobStatus::Cancelled).await
    }

    async fn fail_job(&self, job_id: i64) -> PersistenceResult<()> {
        self.terminate_job(job_id, JobStatus::Failed).await
    }

    async fn requeue_job(&self, job_id: i64) -> PersistenceResult<()> {
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'PENDING', updated_at = NOW() WHERE id = $1 AND status = 'INCOMPLETE'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(PersistenceError::InvalidStatus(format!(
                "job {job_id} is not INCOMPLETE"
            )));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> PersistenceResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PersistenceError::NotFound(job_id))?;

        let attempts = fetch_attempts(&self.pool, job_id).await?;
        Ok(to_job(row, attempts))
    }

    async fn list_jobs_with_status(&self, status: JobStatus) -> PersistenceResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        self.load_jobs(rows).await
    }

    async fn list_jobs(
        &self,
        config_type: ConfigType,
        scope: &str,
        page_size: i64,
        offset: i64,
    ) -> PersistenceResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE config_type = $1 AND scope = $2
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(config_type)
        .bind(scope)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        self.load_jobs(rows).await
    }

    async fn get_next_job(&self) -> PersistenceResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        // Oldest eligible job first so older scopes make progress under
        // contention. SKIP LOCKED keeps concurrent submitters from handing
        // the same job to two workers.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs j
            WHERE j.status = 'PENDING'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs r WHERE r.scope = j.scope AND r.status = 'RUNNING'
              )
            ORDER BY j.created_at ASC
            LIMIT 1
            FOR UPDATE OF j SKIP LOCKED
            "#
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let job = match row {
            None => None,
            Some(row) => {
                let attempts = fetch_attempts(&mut *tx, row.id).await?;
                Some(to_job(row, attempts))
            }
        };

        tx.commit().await?;
        Ok(job)
    }

    async fn get_last_replication_job(&self, scope: &str) -> PersistenceResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE scope = $1
              AND config_type = 'SYNC'
              AND status IN ('FAILED', 'SUCCEEDED', 'CANCELLED')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let attempts = fetch_attempts(&self.pool, row.id).await?;
                Ok(Some(to_job(row, attempts)))
            }
        }
    }

    async fn get_version(&self) -> PersistenceResult<Option<String>> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM airbyte_metadata WHERE key = $1")
                .bind(VERSION_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version)
    }

    async fn set_version(&self, version: &str) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO airbyte_metadata (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(VERSION_KEY)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl PostgresPersistence {
    /// Shared terminal transition: CANCELLED or FAILED, failing any RUNNING
    /// attempt. A no-op when the job already reached a terminal status.
    async fn terminate_job(&self, job_id: i64, terminal: JobStatus) -> PersistenceResult<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<JobStatus> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = status.ok_or(PersistenceError::NotFound(job_id))?;
        if status.is_terminal() {
            tx.commit().await?;
            return Ok(());
        }

        sqlx::query("UPDATE jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(terminal)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE attempts
            SET status = 'FAILED', ended_at = NOW(), updated_at = NOW()
            WHERE job_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
