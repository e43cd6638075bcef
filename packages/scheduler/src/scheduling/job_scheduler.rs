//! Creates SYNC jobs for connections whose cadence has elapsed.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config_repo::ConfigRepository;
use crate::models::{ConnectionStatus, JobConfig, StandardSync, SyncConfig};
use crate::persistence::JobPersistence;

pub struct JobScheduler {
    persistence: Arc<dyn JobPersistence>,
    config_repo: Arc<ConfigRepository>,
}

impl JobScheduler {
    pub fn new(persistence: Arc<dyn JobPersistence>, config_repo: Arc<ConfigRepository>) -> Self {
        Self {
            persistence,
            config_repo,
        }
    }

    /// Walk every connection once; returns how many jobs were enqueued.
    /// Per-connection failures are logged and the rest of the tick proceeds.
    pub async fn tick(&self) -> Result<u32> {
        let syncs = self.config_repo.list_standard_syncs().await?;
        let mut enqueued = 0;
        for sync in syncs {
            match self.schedule_connection(&sync).await {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        connection_id = %sync.connection_id,
                        error = %e,
                        "failed to schedule connection"
                    );
                }
            }
        }
        Ok(enqueued)
    }

    async fn schedule_connection(&self, sync: &StandardSync) -> Result<bool> {
        if sync.status != ConnectionStatus::Active {
            return Ok(false);
        }
        let Some(schedule) = sync.schedule else {
            return Ok(false);
        };

        let scope = sync.scope();
        let last = self.persistence.get_last_replication_job(&scope).await?;
        let last_ended = last.map(|job| job.last_activity_at());
        if !sync_due(last_ended, schedule.interval(), Utc::now()) {
            return Ok(false);
        }

        let config = self.build_sync_config(sync).await?;
        // The uniqueness guard silently suppresses duplicates, so a pending
        // job from an earlier tick is not an error here.
        let enqueued = self.persistence.enqueue_job(&scope, config).await?;
        if let Some(job_id) = enqueued {
            debug!(connection_id = %sync.connection_id, job_id, "scheduled sync job");
        }
        Ok(enqueued.is_some())
    }

    async fn build_sync_config(&self, sync: &StandardSync) -> Result<JobConfig> {
        let source = self.config_repo.get_source_connection(sync.source_id).await?;
        let source_definition = self
            .config_repo
            .get_source_definition(source.source_definition_id)
            .await?;
        let destination = self
            .config_repo
            .get_destination_connection(sync.destination_id)
            .await?;
        let destination_definition = self
            .config_repo
            .get_destination_definition(destination.destination_definition_id)
            .await?;

        Ok(JobConfig::Sync(SyncConfig {
            source_image: source_definition.image(),
            destination_image: destination_definition.image(),
            source_configuration: source.configuration,
            destination_configuration: destination.configuration,
            catalog: sync.catalog.clone(),
        }))
    }
}

/// A sync is due when at least one interval has passed since the last
/// terminal sync; a connection that never synced is due immediately.
fn sync_due(last_ended: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    let last = last_ended.unwrap_or(DateTime::UNIX_EPOCH);
    now - last >= interval
}
