//! Terminal-job notifications.
//!
//! The retrier and the zombie reaper tell the notifier when a job reaches a
//! terminal status it did not earn through a successful attempt. The default
//! implementation logs and emits a tracking event; tests count invocations.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::models::Job;
use crate::tracking::TrackingClient;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// The job reached FAILED or CANCELLED; `reason` explains why.
    async fn job_terminal(&self, job: &Job, reason: &str) -> Result<()>;
}

pub struct LoggingNotifier {
    tracking: TrackingClient,
    /// When set, notifications carry a link into the web UI.
    webapp_url: Option<String>,
}

impl LoggingNotifier {
    pub fn new(tracking: TrackingClient, webapp_url: Option<String>) -> Self {
        Self {
            tracking,
            webapp_url,
        }
    }
}

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn job_terminal(&self, job: &Job, reason: &str) -> Result<()> {
        let connection_url = self
            .webapp_url
            .as_deref()
            .map(|base| format!("{}/connections/{}", base.trim_end_matches('/'), job.scope));
        warn!(
            job_id = job.id,
            scope = %job.scope,
            reason,
            connection_url = connection_url.as_deref().unwrap_or("-"),
            "job reached terminal failure"
        );
        self.tracking.track(
            "job_terminal",
            json!({
                "jobId": job.id,
                "scope": job.scope,
                "configType": job.config_type,
                "reason": reason,
            }),
        );
        Ok(())
    }
}

/// Records every notification, for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<(i64, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(i64, String)> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn job_terminal(&self, job: &Job, reason: &str) -> Result<()> {
        self.notified
            .lock()
            .unwrap()
            .push((job.id, reason.to_string()));
        Ok(())
    }
}
