//! Startup crash recovery.
//!
//! A scheduler crash leaves jobs RUNNING with no live worker behind them.
//! Before the periodic dispatcher starts, every such job is cancelled (not
//! failed: the workflow never observed a terminal signal, so failure
//! attribution would be ambiguous) and its running attempt marked FAILED.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::models::JobStatus;
use crate::notify::Notifier;
use crate::persistence::JobPersistence;

const ZOMBIE_REASON: &str = "zombie job was cancelled";

pub struct ZombieReaper {
    persistence: Arc<dyn JobPersistence>,
    notifier: Arc<dyn Notifier>,
}

impl ZombieReaper {
    pub fn new(persistence: Arc<dyn JobPersistence>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            persistence,
            notifier,
        }
    }

    /// Cancel every RUNNING job. Runs synchronously before the dispatcher so
    /// the submitter can never pick up stale RUNNING state.
    pub async fn run(&self) -> Result<u32> {
        let zombies = self
            .persistence
            .list_jobs_with_status(JobStatus::Running)
            .await?;

        let mut reaped = 0;
        for job in zombies {
            warn!(job_id = job.id, scope = %job.scope, "cancelling zombie job");
            self.persistence.cancel_job(job.id).await?;
            if let Err(e) = self.notifier.job_terminal(&job, ZOMBIE_REASON).await {
                warn!(job_id = job.id, error = %e, "failed to notify zombie cancellation");
            }
            reaped += 1;
        }
        Ok(reaped)
    }
}
