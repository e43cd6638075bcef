//! Local docker launching.
//!
//! Runs one worker as `docker run --rm` with the workspace and local-data
//! mounts, an entrypoint override, and piped stdio. Input files are staged
//! into the attempt workspace on the host, which docker then mounts into the
//! container's working directory.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::process::{LaunchSpec, ProcessFactory, WorkerProcess};

/// Where the workspace and local mounts land inside worker containers.
const WORKSPACE_DEST: &str = "/data";
const LOCAL_DEST: &str = "/local";

/// Host-side mount configuration for docker workers.
#[derive(Debug, Clone)]
pub struct DockerMounts {
    /// Docker volume (or host path) mounted as the workspace.
    pub workspace_mount: String,
    /// Docker volume (or host path) mounted for local data.
    pub local_mount: String,
    /// Docker network the worker joins.
    pub network: String,
}

/// Launches workers as local docker containers.
pub struct DockerProcessFactory {
    mounts: DockerMounts,
}

impl DockerProcessFactory {
    pub fn new(mounts: DockerMounts) -> Self {
        Self { mounts }
    }

    /// Assemble the `docker run` argument vector for a launch.
    fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            spec.container_name(),
        ];
        if spec.uses_stdin {
            args.push("-i".into());
        }
        args.extend([
            "-v".into(),
            format!("{}:{}", self.mounts.workspace_mount, WORKSPACE_DEST),
            "-v".into(),
            format!("{}:{}", self.mounts.local_mount, LOCAL_DEST),
            "-w".into(),
            format!("{}/{}/{}", WORKSPACE_DEST, spec.job_id, spec.attempt_number),
            "--network".into(),
            self.mounts.network.clone(),
            "--log-driver".into(),
            "none".into(),
            "--entrypoint".into(),
            spec.entrypoint.clone(),
        ]);
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

/// Write the launch's input files into the attempt workspace.
async fn stage_files(spec: &LaunchSpec) -> Result<()> {
    tokio::fs::create_dir_all(&spec.job_root)
        .await
        .with_context(|| format!("failed to create workspace {}", spec.job_root.display()))?;
    for (name, contents) in &spec.files {
        let path = spec.job_root.join(name);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to stage {}", path.display()))?;
    }
    Ok(())
}

#[async_trait]
impl ProcessFactory for DockerProcessFactory {
    async fn create(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerProcess>> {
        stage_files(&spec).await?;

        let args = self.run_args(&spec);
        debug!(image = %spec.image, "docker {}", args.join(" "));

        let mut command = Command::new("docker");
        command
            .args(&args)
            .stdin(if spec.uses_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("failed to launch docker worker {}", spec.container_name()))?;

        info!(
            job_id = spec.job_id,
            attempt = spec.attempt_number,
            image = %spec.image,
            "docker worker started"
        );

        Ok(Box::new(DockerProcess { child, exit: None }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle to a running docker worker.
pub struct DockerProcess {
    child: Child,
    exit: Option<i32>,
}

#[async_trait]
impl WorkerProcess for DockerProcess {
    fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>)
    }

    async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for docker worker")?;
        let code = status.code().unwrap_or(-1);
        self.exit = Some(code);
        Ok(code)
    }

    fn exit_value(&self) -> Option<i32> {
        self.exit
    }

    async fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit = Some(status.code().unwrap_or(-1));
                false
            }
            Err(_) => false,
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        // start_kill errors when the process already finished; wait settles it
        // either way.
        let _ = self.child.start_kill();
        let status = self
            .child
            .wait()
            .await
            .context("failed to reap destroyed docker worker")?;
        self.exit = Some(status.code().unwrap_or(-1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> DockerProcessFactory {
        DockerProcessFactory::new(DockerMounts {
            workspace_mount: "airbyte_workspace".into(),
            local_mount: "airbyte_local".into(),
            network: "airbyte_default".into(),
        })
    }

    fn spec(uses_stdin: bool) -> LaunchSpec {
        LaunchSpec::builder()
            .job_id(7i64)
            .attempt_number(2)
            .job_root("/tmp/workspace/7/2")
            .image("airbyte/source-postgres:0.1.0")
            .uses_stdin(uses_stdin)
            .entrypoint("/airbyte/base.sh")
            .args(vec!["read".to_string(), "--config".to_string()])
            .build()
    }

    #[test]
    fn run_args_mounts_workspace_and_overrides_entrypoint() {
        let args = factory().run_args(&spec(false));

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"airbyte_workspace:/data".to_string()));
        assert!(args.contains(&"airbyte_local:/local".to_string()));
        assert!(args.contains(&"/data/7/2".to_string()));
        assert!(args.contains(&"airbyte_default".to_string()));

        // --entrypoint <entrypoint> must precede the image, args follow it.
        let entry = args.iter().position(|a| a == "--entrypoint").unwrap();
        let image = args
            .iter()
            .position(|a| a == "airbyte/source-postgres:0.1.0")
            .unwrap();
        assert_eq!(args[entry + 1], "/airbyte/base.sh");
        assert!(entry < image);
        assert_eq!(&args[image + 1..], &["read", "--config"]);
    }

    #[test]
    fn stdin_flag_only_when_requested() {
        assert!(!factory().run_args(&spec(false)).contains(&"-i".to_string()));
        assert!(factory().run_args(&spec(true)).contains(&"-i".to_string()));
    }

    #[test]
    fn container_name_matches_job_and_attempt() {
        let args = factory().run_args(&spec(false));
        let name = args.iter().position(|a| a == "--name").unwrap();
        assert_eq!(args[name + 1], "7-2");
    }

    #[tokio::test]
    async fn stage_files_writes_into_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec(false);
        spec.job_root = dir.path().join("7").join("2");
        spec.files
            .insert("source_config.json".into(), "{\"host\":\"db\"}".into());

        stage_files(&spec).await.unwrap();

        let written = tokio::fs::read_to_string(spec.job_root.join("source_config.json"))
            .await
            .unwrap();
        assert_eq!(written, "{\"host\":\"db\"}");
    }
}
