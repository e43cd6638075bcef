//! Job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::{Attempt, AttemptStatus};

/// Job status, stored as UPPERCASE text.
///
/// Always a deterministic function of the job's attempts: PENDING with no
/// attempts, RUNNING/INCOMPLETE tracking the last attempt, and the three
/// terminal states which never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Incomplete,
    Failed,
    Succeeded,
    Cancelled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 3] = [JobStatus::Failed, JobStatus::Succeeded, JobStatus::Cancelled];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

/// Kind of work a job performs, stored as UPPERCASE text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigType {
    Sync,
    ResetConnection,
    GetSpec,
    CheckConnection,
    DiscoverSchema,
}

/// Replication payload: which images to run against which configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub source_image: String,
    pub destination_image: String,
    pub source_configuration: serde_json::Value,
    pub destination_configuration: serde_json::Value,
    pub catalog: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSpecConfig {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConnectionConfig {
    pub image: String,
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverCatalogConfig {
    pub image: String,
    pub configuration: serde_json::Value,
}

/// Job payload, stored as JSONB tagged by config type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "configType")]
pub enum JobConfig {
    #[serde(rename = "SYNC")]
    Sync(SyncConfig),
    /// A reset replays a sync with an empty source so the destination is
    /// wiped to match.
    #[serde(rename = "RESET_CONNECTION")]
    ResetConnection(SyncConfig),
    #[serde(rename = "GET_SPEC")]
    GetSpec(GetSpecConfig),
    #[serde(rename = "CHECK_CONNECTION")]
    CheckConnection(CheckConnectionConfig),
    #[serde(rename = "DISCOVER_SCHEMA")]
    DiscoverSchema(DiscoverCatalogConfig),
}

impl JobConfig {
    pub fn config_type(&self) -> ConfigType {
        match self {
            JobConfig::Sync(_) => ConfigType::Sync,
            JobConfig::ResetConnection(_) => ConfigType::ResetConnection,
            JobConfig::GetSpec(_) => ConfigType::GetSpec,
            JobConfig::CheckConnection(_) => ConfigType::CheckConnection,
            JobConfig::DiscoverSchema(_) => ConfigType::DiscoverSchema,
        }
    }
}

/// One invocation of work for a connection, with its attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Connection this job belongs to.
    pub scope: String,
    pub config_type: ConfigType,
    pub config: JobConfig,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Attempts ordered by attempt number.
    pub attempts: Vec<Attempt>,
}

impl Job {
    /// The attempt with the highest number, when any exist.
    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Number the submitter will give the next attempt.
    pub fn next_attempt_number(&self) -> i32 {
        self.attempts.len() as i32
    }

    pub fn failed_attempt_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Failed)
            .count()
    }

    /// When the job last stopped doing work: the latest attempt end, falling
    /// back to the job's own update time.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.attempts
            .iter()
            .filter_map(|a| a.ended_at)
            .max()
            .unwrap_or(self.updated_at)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
