//! Advances INCOMPLETE jobs: back to PENDING under the backoff policy, or
//! to terminal FAILED once the retry budget is spent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::models::{AttemptStatus, JobStatus};
use crate::notify::Notifier;
use crate::persistence::JobPersistence;

/// Exponential backoff with a hard attempt budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget exhausted: fail the job for good.
    Terminalize,
    /// Backoff elapsed: hand the job back to the submitter.
    Requeue,
    /// Still inside the backoff window.
    Wait,
}

impl RetryPolicy {
    /// Delay before retry number `failed_attempts`, doubling per failure and
    /// capped at `max_delay`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn decide(
        &self,
        failed_attempts: usize,
        last_failed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if failed_attempts >= self.max_attempts {
            return RetryDecision::Terminalize;
        }
        let Some(last) = last_failed_at else {
            // No recorded failure end; nothing to wait on.
            return RetryDecision::Requeue;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= self.backoff(failed_attempts as u32) {
            RetryDecision::Requeue
        } else {
            RetryDecision::Wait
        }
    }
}

pub struct JobRetrier {
    persistence: Arc<dyn JobPersistence>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl JobRetrier {
    pub fn new(
        persistence: Arc<dyn JobPersistence>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            persistence,
            notifier,
            policy,
        }
    }

    /// Walk all INCOMPLETE jobs once. The retrier never mutates attempts;
    /// the PENDING -> RUNNING step always belongs to the submitter.
    pub async fn tick(&self) -> Result<u32> {
        let jobs = self
            .persistence
            .list_jobs_with_status(JobStatus::Incomplete)
            .await?;

        let now = Utc::now();
        let mut advanced = 0;
        for job in jobs {
            let failed_attempts = job.failed_attempt_count();
            let last_failed_at = job
                .attempts
                .iter()
                .filter(|a| a.status == AttemptStatus::Failed)
                .filter_map(|a| a.ended_at)
                .max();

            let decision = self.policy.decide(failed_attempts, last_failed_at, now);
            let applied = match decision {
                RetryDecision::Wait => Ok(()),
                RetryDecision::Requeue => {
                    info!(job_id = job.id, failed_attempts, "requeueing job for retry");
                    self.persistence.requeue_job(job.id).await.map_err(Into::into)
                }
                RetryDecision::Terminalize => {
                    info!(job_id = job.id, failed_attempts, "retry budget exhausted");
                    match self.persistence.fail_job(job.id).await {
                        Ok(()) => self
                            .notifier
                            .job_terminal(&job, "exhausted retry budget")
                            .await,
                        Err(e) => Err(e.into()),
                    }
                }
            };

            match applied {
                Ok(()) if decision != RetryDecision::Wait => advanced += 1,
                Ok(()) => {}
                Err(e) => warn!(job_id = job.id, error = %e, "failed to advance job"),
            }
        }
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::models::{GetSpecConfig, JobConfig};
    use crate::notify::RecordingNotifier;
    use crate::persistence::InMemoryPersistence;

    fn spec_config() -> JobConfig {
        JobConfig::GetSpec(GetSpecConfig {
            image: "airbyte/source-postgres:0.1.0".into(),
        })
    }

    /// Enqueue a job and fail `failures` attempts in a row.
    async fn job_with_failures(store: &InMemoryPersistence, failures: usize) -> i64 {
        let job_id = store.enqueue_job("c1", spec_config()).await.unwrap().unwrap();
        for n in 0..failures {
            let attempt = store
                .create_attempt(job_id, &format!("/workspace/{job_id}/{n}"))
                .await
                .unwrap();
            store.fail_attempt(job_id, attempt).await.unwrap();
        }
        job_id
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
        // Far past the cap.
        assert_eq!(policy.backoff(12), Duration::from_secs(600));
    }

    #[test]
    fn decision_boundaries_around_the_attempt_budget() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let long_ago = Some(now - ChronoDuration::hours(1));

        // One short of the budget still retries.
        assert_eq!(
            policy.decide(policy.max_attempts - 1, long_ago, now),
            RetryDecision::Requeue
        );
        // At the budget the job terminalizes.
        assert_eq!(
            policy.decide(policy.max_attempts, long_ago, now),
            RetryDecision::Terminalize
        );
    }

    #[test]
    fn waits_inside_the_backoff_window() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(
            policy.decide(1, Some(now - ChronoDuration::seconds(5)), now),
            RetryDecision::Wait
        );
        assert_eq!(
            policy.decide(1, Some(now - ChronoDuration::seconds(10)), now),
            RetryDecision::Requeue
        );
    }

    #[tokio::test]
    async fn requeues_after_backoff_elapses() {
        let store = Arc::new(InMemoryPersistence::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let job_id = job_with_failures(&store, 1).await;
        store.set_attempt_ended_at(job_id, 0, Utc::now() - ChronoDuration::seconds(11));

        let retrier = JobRetrier::new(store.clone(), notifier.clone(), RetryPolicy::default());
        assert_eq!(retrier.tick().await.unwrap(), 1);

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(notifier.notifications().is_empty());
    }

    #[tokio::test]
    async fn fresh_failure_waits() {
        let store = Arc::new(InMemoryPersistence::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let job_id = job_with_failures(&store, 1).await;

        let retrier = JobRetrier::new(store.clone(), notifier.clone(), RetryPolicy::default());
        assert_eq!(retrier.tick().await.unwrap(), 0);
        assert_eq!(
            store.get_job(job_id).await.unwrap().status,
            JobStatus::Incomplete
        );
    }

    #[tokio::test]
    async fn exhausted_budget_fails_the_job_and_notifies_once() {
        let store = Arc::new(InMemoryPersistence::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let job_id = job_with_failures(&store, 3).await;

        let retrier = JobRetrier::new(store.clone(), notifier.clone(), RetryPolicy::default());
        assert_eq!(retrier.tick().await.unwrap(), 1);

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(notifier.notifications().len(), 1);
        assert_eq!(notifier.notifications()[0].0, job_id);

        // A second tick sees no INCOMPLETE work and does not notify again.
        assert_eq!(retrier.tick().await.unwrap(), 0);
        assert_eq!(notifier.notifications().len(), 1);
    }
}
