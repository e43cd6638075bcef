//! Attempt model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attempt status, stored as UPPERCASE text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptStatus {
    Running,
    Failed,
    Succeeded,
}

/// Totals reported by a finished sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub records_synced: i64,
    pub bytes_synced: i64,
}

/// What a successful attempt produced, tagged by the job kind that ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outputType")]
pub enum AttemptOutput {
    #[serde(rename = "SYNC")]
    Sync { summary: SyncSummary },
    #[serde(rename = "SPEC")]
    Spec { spec: serde_json::Value },
    #[serde(rename = "CATALOG")]
    Catalog { catalog: serde_json::Value },
    #[serde(rename = "CHECK")]
    Check {
        success: bool,
        message: Option<String>,
    },
}

impl AttemptOutput {
    /// Records moved, for tracking; zero for non-sync outputs.
    pub fn records_synced(&self) -> i64 {
        match self {
            AttemptOutput::Sync { summary } => summary.records_synced,
            _ => 0,
        }
    }
}

/// One execution try of a job.
///
/// The workspace directory at `log_path` belongs to this attempt until the
/// cleaner reclaims it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub job_id: i64,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub log_path: String,
    pub output: Option<AttemptOutput>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_round_trips_with_tag() {
        let output = AttemptOutput::Sync {
            summary: SyncSummary {
                records_synced: 120,
                bytes_synced: 4096,
            },
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["outputType"], "SYNC");
        assert_eq!(json["summary"]["recordsSynced"], 120);

        let back: AttemptOutput = serde_json::from_value(json).unwrap();
        assert_eq!(back.records_synced(), 120);
    }

    #[test]
    fn non_sync_outputs_report_zero_records() {
        let output = AttemptOutput::Check {
            success: true,
            message: None,
        };
        assert_eq!(output.records_synced(), 0);
    }
}
