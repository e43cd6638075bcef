//! Process handle and factory contracts.
//!
//! A [`WorkerProcess`] looks like a POSIX child process regardless of whether
//! it runs as a local docker container or as a pod in a remote cluster. The
//! scheduler side only ever talks to this contract.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use typed_builder::TypedBuilder;

/// Everything needed to launch one worker container.
///
/// `files` are materialized in the container's working directory before the
/// entrypoint starts; `entrypoint` overrides the image's own.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct LaunchSpec {
    /// Job this process belongs to.
    pub job_id: i64,
    /// Attempt within the job.
    pub attempt_number: i32,
    /// Attempt workspace directory on the scheduler host.
    pub job_root: PathBuf,
    /// Connector image to run.
    pub image: String,
    /// Whether the caller will stream data into the process.
    #[builder(default = false)]
    pub uses_stdin: bool,
    /// Filename -> contents, staged into the working directory.
    #[builder(default)]
    pub files: HashMap<String, String>,
    /// Entrypoint override.
    pub entrypoint: String,
    /// Arguments passed after the entrypoint.
    #[builder(default)]
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Container name shared by both launch variants.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.job_id, self.attempt_number)
    }
}

/// Handle to a launched worker, shaped like a POSIX process.
///
/// Stdio takers return the stream once; later calls return `None`.
#[async_trait]
pub trait WorkerProcess: Send {
    /// Take the process stdin, when the launch asked for one.
    fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Take the process stdout.
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    /// Take the process stderr. Not every variant exposes one.
    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;

    /// Block until the process terminates and return its exit code.
    async fn wait(&mut self) -> Result<i32>;

    /// Exit code, when the process has already been observed to terminate.
    fn exit_value(&self) -> Option<i32>;

    /// Whether the process is still running.
    async fn is_alive(&mut self) -> bool;

    /// Tear the process down and release any held resources.
    async fn destroy(&mut self) -> Result<()>;
}

/// Launches worker processes.
///
/// Two variants exist: local docker containers and ephemeral Kubernetes
/// pods. Both share this capability set; callers never branch on the
/// concrete type.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    /// Launch a worker for `spec`. Blocks while launch resources (worker
    /// ports) are exhausted.
    async fn create(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerProcess>>;

    /// Release factory-wide resources at shutdown.
    async fn close(&self) -> Result<()>;
}
