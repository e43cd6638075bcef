//! Hands PENDING jobs to the workflow runtime on a bounded worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::models::Job;
use crate::persistence::JobPersistence;
use crate::tracking::TrackingClient;
use crate::workflow::{workflow_identity, AttemptInput, AttemptOutcome, WorkflowClient};

pub struct JobSubmitter {
    persistence: Arc<dyn JobPersistence>,
    workflow: Arc<dyn WorkflowClient>,
    tracking: TrackingClient,
    workspace_root: PathBuf,
    /// Bounded pool; an exhausted pool ends the tick.
    workers: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl JobSubmitter {
    pub fn new(
        persistence: Arc<dyn JobPersistence>,
        workflow: Arc<dyn WorkflowClient>,
        tracking: TrackingClient,
        workspace_root: impl Into<PathBuf>,
        max_workers: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            persistence,
            workflow,
            tracking,
            workspace_root: workspace_root.into(),
            workers: Arc::new(Semaphore::new(max_workers)),
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    /// In-flight attempt tasks; the app waits on this during shutdown.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Drain eligible PENDING jobs onto the worker pool. Non-blocking at
    /// tick granularity: a slow workflow holds a worker slot, never the
    /// dispatch thread.
    pub async fn tick(&self) -> Result<u32> {
        let mut submitted = 0;
        loop {
            // Reserve the worker slot before popping a job so a saturated
            // pool leaves jobs PENDING for the next tick.
            let permit = match self.workers.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("worker pool saturated, ending submission tick");
                    break;
                }
            };

            let Some(job) = self.persistence.get_next_job().await? else {
                break;
            };

            let attempt_number = job.next_attempt_number();
            let workspace = self
                .workspace_root
                .join(job.id.to_string())
                .join(attempt_number.to_string());
            prepare_workspace(&workspace).await?;

            let attempt_number = self
                .persistence
                .create_attempt(job.id, &workspace.to_string_lossy())
                .await?;
            submitted += 1;

            let persistence = self.persistence.clone();
            let workflow = self.workflow.clone();
            let tracking = self.tracking.clone();
            let cancel = self.shutdown.child_token();
            self.tasks.spawn(async move {
                let _slot = permit;
                run_attempt(persistence, workflow, tracking, job, attempt_number, workspace, cancel)
                    .await;
            });
        }
        Ok(submitted)
    }
}

/// The attempt workspace must exist and be empty before the worker starts.
async fn prepare_workspace(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("failed to clear workspace {}", path.display()))?;
    }
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("failed to create workspace {}", path.display()))?;
    Ok(())
}

/// One attempt from submission to recorded outcome. Always writes the
/// attempt row before returning, so a crash here is recoverable by the
/// zombie reaper.
async fn run_attempt(
    persistence: Arc<dyn JobPersistence>,
    workflow: Arc<dyn WorkflowClient>,
    tracking: TrackingClient,
    job: Job,
    attempt_number: i32,
    workspace: PathBuf,
    cancel: CancellationToken,
) {
    let identity = workflow_identity(&job.scope, job.id, attempt_number);
    let input = AttemptInput {
        job_id: job.id,
        attempt_number,
        scope: job.scope.clone(),
        workspace_path: workspace.to_string_lossy().into_owned(),
        config: job.config.clone(),
    };

    tracking.job_started(&job, attempt_number);
    let started = Instant::now();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("attempt cancelled by shutdown")),
        result = workflow.submit(&identity, input) => result,
    };
    let duration = started.elapsed();

    match outcome {
        Ok(AttemptOutcome::Succeeded { output }) => {
            let records = output.records_synced();
            match persistence
                .succeed_attempt(job.id, attempt_number, output)
                .await
            {
                Ok(()) => {
                    info!(job_id = job.id, attempt = attempt_number, "attempt succeeded");
                    tracking.job_succeeded(&job, attempt_number, duration, records);
                }
                Err(e) => {
                    error!(job_id = job.id, error = %e, "failed to record attempt success");
                }
            }
        }
        Ok(AttemptOutcome::Failed { reason }) => {
            record_failure(&*persistence, &tracking, &job, attempt_number, duration, &reason).await;
        }
        Err(e) => {
            record_failure(
                &*persistence,
                &tracking,
                &job,
                attempt_number,
                duration,
                &e.to_string(),
            )
            .await;
        }
    }
}

async fn record_failure(
    persistence: &dyn JobPersistence,
    tracking: &TrackingClient,
    job: &Job,
    attempt_number: i32,
    duration: std::time::Duration,
    reason: &str,
) {
    warn!(job_id = job.id, attempt = attempt_number, reason, "attempt failed");
    if let Err(e) = persistence.fail_attempt(job.id, attempt_number).await {
        error!(job_id = job.id, error = %e, "failed to record attempt failure");
        return;
    }
    tracking.job_failed(job, attempt_number, duration, reason);
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::models::{
        AttemptOutput, AttemptStatus, GetSpecConfig, JobConfig, JobStatus, SyncSummary,
    };
    use crate::persistence::InMemoryPersistence;
    use crate::tracking::{TrackingClient, TrackingIdentity, TrackingStrategy};
    use crate::workflow::ScriptedWorkflowClient;

    fn tracking() -> TrackingClient {
        TrackingClient::new(
            TrackingStrategy::Logging,
            TrackingIdentity {
                airbyte_version: "0.29.0".into(),
                airbyte_role: None,
            },
        )
    }

    fn spec_config() -> JobConfig {
        JobConfig::GetSpec(GetSpecConfig {
            image: "airbyte/source-postgres:0.1.0".into(),
        })
    }

    fn submitter(
        store: Arc<InMemoryPersistence>,
        workflow: Arc<dyn WorkflowClient>,
        root: &Path,
        max_workers: usize,
        shutdown: CancellationToken,
    ) -> JobSubmitter {
        JobSubmitter::new(store, workflow, tracking(), root, max_workers, shutdown)
    }

    /// Workflow client that parks every submission until released.
    struct BlockingWorkflowClient {
        release: Notify,
    }

    impl BlockingWorkflowClient {
        fn new() -> Self {
            Self {
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl WorkflowClient for BlockingWorkflowClient {
        async fn submit(&self, _identity: &str, _input: AttemptInput) -> Result<AttemptOutcome> {
            self.release.notified().await;
            Ok(AttemptOutcome::Succeeded {
                output: AttemptOutput::Sync {
                    summary: SyncSummary::default(),
                },
            })
        }
    }

    #[tokio::test]
    async fn successful_attempt_lands_in_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryPersistence::new());
        let workflow = Arc::new(ScriptedWorkflowClient::new());
        workflow.push_outcome(AttemptOutcome::Succeeded {
            output: AttemptOutput::Spec {
                spec: serde_json::json!({}),
            },
        });

        let job_id = store.enqueue_job("c1", spec_config()).await.unwrap().unwrap();
        let submitter = submitter(
            store.clone(),
            workflow.clone(),
            dir.path(),
            4,
            CancellationToken::new(),
        );

        assert_eq!(submitter.tick().await.unwrap(), 1);
        submitter.tasks().close();
        submitter.tasks().wait().await;

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts.len(), 1);
        assert_eq!(workflow.submitted(), [format!("connection-c1-{job_id}-0")]);

        // The attempt workspace was created under <root>/<job>/<attempt>.
        assert!(dir.path().join(job_id.to_string()).join("0").is_dir());
    }

    #[tokio::test]
    async fn failed_attempt_lands_in_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryPersistence::new());
        let workflow = Arc::new(ScriptedWorkflowClient::new());
        workflow.push_outcome(AttemptOutcome::Failed {
            reason: "connector crashed".into(),
        });

        let job_id = store.enqueue_job("c1", spec_config()).await.unwrap().unwrap();
        let submitter = submitter(
            store.clone(),
            workflow,
            dir.path(),
            4,
            CancellationToken::new(),
        );

        submitter.tick().await.unwrap();
        submitter.tasks().close();
        submitter.tasks().wait().await;

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Incomplete);
        assert_eq!(job.attempts[0].status, AttemptStatus::Failed);
        assert!(job.attempts[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn saturated_pool_ends_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryPersistence::new());
        let workflow = Arc::new(BlockingWorkflowClient::new());

        store.enqueue_job("c1", spec_config()).await.unwrap().unwrap();
        store.enqueue_job("c2", spec_config()).await.unwrap().unwrap();

        let submitter = submitter(
            store.clone(),
            workflow.clone(),
            dir.path(),
            1,
            CancellationToken::new(),
        );

        // One worker slot: the first job occupies it, the second stays
        // PENDING for a later tick.
        assert_eq!(submitter.tick().await.unwrap(), 1);
        assert_eq!(
            store
                .list_jobs_with_status(JobStatus::Pending)
                .await
                .unwrap()
                .len(),
            1
        );

        // notify_one stores a permit, so the worker wakes even if it has
        // not reached its await yet.
        workflow.release.notify_one();
        submitter.tasks().close();
        submitter.tasks().wait().await;

        assert_eq!(submitter.tick().await.unwrap(), 1);
        workflow.release.notify_one();
        submitter.tasks().wait().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryPersistence::new());
        let workflow = Arc::new(BlockingWorkflowClient::new());
        let shutdown = CancellationToken::new();

        let job_id = store.enqueue_job("c1", spec_config()).await.unwrap().unwrap();
        let submitter = submitter(store.clone(), workflow, dir.path(), 4, shutdown.clone());

        submitter.tick().await.unwrap();
        shutdown.cancel();
        submitter.tasks().close();
        submitter.tasks().wait().await;

        // The cancelled attempt is recorded as failed, never left RUNNING.
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Incomplete);
        assert_eq!(job.attempts[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn second_attempt_gets_the_next_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryPersistence::new());
        let workflow = Arc::new(ScriptedWorkflowClient::new());
        workflow.push_outcome(AttemptOutcome::Failed { reason: "x".into() });
        workflow.push_outcome(AttemptOutcome::Succeeded {
            output: AttemptOutput::Spec {
                spec: serde_json::json!({}),
            },
        });

        let job_id = store.enqueue_job("c1", spec_config()).await.unwrap().unwrap();
        let submitter = submitter(
            store.clone(),
            workflow.clone(),
            dir.path(),
            4,
            CancellationToken::new(),
        );

        submitter.tick().await.unwrap();
        submitter.tasks().close();
        submitter.tasks().wait().await;
        store.requeue_job(job_id).await.unwrap();

        submitter.tick().await.unwrap();
        submitter.tasks().wait().await;

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        let numbers: Vec<i32> = job.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, [0, 1]);
        assert_eq!(
            workflow.submitted(),
            [
                format!("connection-c1-{job_id}-0"),
                format!("connection-c1-{job_id}-1"),
            ]
        );
    }
}
