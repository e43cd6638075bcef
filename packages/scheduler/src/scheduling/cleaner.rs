//! Retention-bounded reclamation of attempt workspaces.
//!
//! Sweeps `<workspaceRoot>/<jobId>/<attemptNumber>` directories: anything
//! past the maximum age goes; past the size budget the oldest directories go
//! too, as long as they are past the minimum age. Workspaces of non-terminal
//! jobs are never touched, and per-directory failures never abort a sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::persistence::{JobPersistence, PersistenceError};

#[derive(Debug, Clone)]
pub struct WorkspaceRetentionConfig {
    pub min_age_hours: u64,
    pub max_age_hours: u64,
    pub max_size_bytes: u64,
}

impl Default for WorkspaceRetentionConfig {
    fn default() -> Self {
        Self {
            min_age_hours: 24,
            max_age_hours: 24 * 30,
            max_size_bytes: 5 * 1024 * 1024 * 1024,
        }
    }
}

/// One attempt workspace on disk.
#[derive(Debug, Clone)]
struct AttemptWorkspace {
    path: PathBuf,
    job_id: i64,
    modified: SystemTime,
    size_bytes: u64,
}

pub struct JobCleaner {
    persistence: Arc<dyn JobPersistence>,
    workspace_root: PathBuf,
    retention: WorkspaceRetentionConfig,
}

impl JobCleaner {
    pub fn new(
        persistence: Arc<dyn JobPersistence>,
        workspace_root: impl Into<PathBuf>,
        retention: WorkspaceRetentionConfig,
    ) -> Self {
        Self {
            persistence,
            workspace_root: workspace_root.into(),
            retention,
        }
    }

    /// One sweep; returns how many workspaces were deleted.
    pub async fn sweep(&self) -> Result<u32> {
        let workspaces = scan_workspaces(&self.workspace_root);

        // Workspaces of non-terminal jobs are owned by their attempts.
        let mut reclaimable = Vec::new();
        for workspace in workspaces {
            match self.persistence.get_job(workspace.job_id).await {
                Ok(job) if !job.is_terminal() => continue,
                Ok(_) => reclaimable.push(workspace),
                // A directory with no job row is an orphan; age it out like
                // the rest.
                Err(PersistenceError::NotFound(_)) => reclaimable.push(workspace),
                Err(e) => {
                    warn!(job_id = workspace.job_id, error = %e, "skipping workspace, job lookup failed");
                }
            }
        }

        let doomed = select_for_deletion(&reclaimable, &self.retention, SystemTime::now());
        let mut deleted = 0;
        for path in doomed {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "deleted attempt workspace");
                    deleted += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete workspace"),
            }
        }
        if deleted > 0 {
            info!(deleted, "workspace sweep reclaimed directories");
        }
        Ok(deleted)
    }
}

/// Pick the workspaces to delete: everything past `max_age_hours`, and once
/// cumulative size (newest first) exceeds `max_size_bytes`, the remainder
/// past `min_age_hours` as well.
fn select_for_deletion(
    workspaces: &[AttemptWorkspace],
    retention: &WorkspaceRetentionConfig,
    now: SystemTime,
) -> Vec<PathBuf> {
    let max_age = Duration::from_secs(retention.max_age_hours * 3600);
    let min_age = Duration::from_secs(retention.min_age_hours * 3600);

    let mut newest_first: Vec<&AttemptWorkspace> = workspaces.iter().collect();
    newest_first.sort_by_key(|w| std::cmp::Reverse(w.modified));

    let mut cumulative = 0u64;
    let mut doomed = Vec::new();
    for workspace in newest_first {
        let age = now
            .duration_since(workspace.modified)
            .unwrap_or(Duration::ZERO);
        if age >= max_age {
            doomed.push(workspace.path.clone());
            continue;
        }
        cumulative += workspace.size_bytes;
        if cumulative > retention.max_size_bytes && age >= min_age {
            doomed.push(workspace.path.clone());
        }
    }
    doomed
}

/// Find `<root>/<jobId>/<attemptNumber>` directories. Anything that does not
/// parse as a job/attempt pair is left alone.
fn scan_workspaces(root: &Path) -> Vec<AttemptWorkspace> {
    let mut workspaces = Vec::new();
    let Ok(job_dirs) = std::fs::read_dir(root) else {
        return workspaces;
    };

    for job_dir in job_dirs.flatten() {
        let job_path = job_dir.path();
        let Some(job_id) = job_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<i64>().ok())
        else {
            continue;
        };
        let Ok(attempt_dirs) = std::fs::read_dir(&job_path) else {
            continue;
        };
        for attempt_dir in attempt_dirs.flatten() {
            let path = attempt_dir.path();
            if !path.is_dir() {
                continue;
            }
            let is_attempt = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.parse::<i32>().is_ok())
                .unwrap_or(false);
            if !is_attempt {
                continue;
            }
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            workspaces.push(AttemptWorkspace {
                size_bytes: dir_size(&path),
                path,
                job_id,
                modified,
            });
        }
    }
    workspaces
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}
