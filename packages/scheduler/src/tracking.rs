//! Usage tracking.
//!
//! An explicit client value passed into the components that emit events,
//! never a process-wide global. The strategy decides where events land:
//! structured logs for self-hosted deployments, Segment otherwise.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::models::Job;

const SEGMENT_TRACK_URL: &str = "https://api.segment.io/v1/track";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingStrategy {
    #[default]
    Logging,
    Segment,
}

impl FromStr for TrackingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOGGING" => Ok(TrackingStrategy::Logging),
            "SEGMENT" => Ok(TrackingStrategy::Segment),
            other => Err(anyhow::anyhow!("unknown tracking strategy: {other}")),
        }
    }
}

/// Deployment identity attached to every event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingIdentity {
    pub airbyte_version: String,
    pub airbyte_role: Option<String>,
}

#[derive(Clone)]
pub struct TrackingClient {
    strategy: TrackingStrategy,
    identity: TrackingIdentity,
    http: Arc<reqwest::Client>,
}

impl TrackingClient {
    pub fn new(strategy: TrackingStrategy, identity: TrackingIdentity) -> Self {
        Self {
            strategy,
            identity,
            http: Arc::new(reqwest::Client::new()),
        }
    }

    /// Emit one event. Never blocks the caller on the network and never
    /// fails: tracking is strictly best-effort.
    pub fn track(&self, event: &str, properties: serde_json::Value) {
        match self.strategy {
            TrackingStrategy::Logging => {
                info!(event, identity = ?self.identity, %properties, "track");
            }
            TrackingStrategy::Segment => {
                let http = self.http.clone();
                let body = json!({
                    "event": event,
                    "properties": properties,
                    "context": self.identity,
                });
                let event = event.to_string();
                tokio::spawn(async move {
                    let sent = http
                        .post(SEGMENT_TRACK_URL)
                        .timeout(Duration::from_secs(10))
                        .json(&body)
                        .send()
                        .await;
                    if let Err(e) = sent {
                        warn!(event, error = %e, "failed to deliver tracking event");
                    }
                });
            }
        }
    }

    pub fn job_started(&self, job: &Job, attempt_number: i32) {
        self.track(
            "job_started",
            json!({
                "jobId": job.id,
                "scope": job.scope,
                "configType": job.config_type,
                "attempt": attempt_number,
            }),
        );
    }

    pub fn job_succeeded(&self, job: &Job, attempt_number: i32, duration: Duration, records: i64) {
        self.track(
            "job_succeeded",
            json!({
                "jobId": job.id,
                "scope": job.scope,
                "configType": job.config_type,
                "attempt": attempt_number,
                "durationMs": duration.as_millis() as u64,
                "recordsSynced": records,
            }),
        );
    }

    pub fn job_failed(&self, job: &Job, attempt_number: i32, duration: Duration, reason: &str) {
        self.track(
            "job_failed",
            json!({
                "jobId": job.id,
                "scope": job.scope,
                "configType": job.config_type,
                "attempt": attempt_number,
                "durationMs": duration.as_millis() as u64,
                "reason": reason,
            }),
        );
    }
}
