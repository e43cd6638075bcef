//! Kubernetes pod launching.
//!
//! Each worker runs as an ephemeral pod of three containers sharing one
//! `emptyDir` at `/workspace`:
//! - `init` creates the stdio named pipes and polls until input files have
//!   been staged, then exits.
//! - `main` runs the connector image with the entrypoint rewritten to stream
//!   through the pipes and to record its exit code in
//!   `/workspace/TERMINATION` (surfaced through the container's termination
//!   message).
//! - `heartbeat` relays the stdio pipes over the two allocated worker ports
//!   and probes the scheduler's heartbeat endpoint; after three consecutive
//!   misses it kills the main process so no pod outlives a dead scheduler.
//!
//! Input files are tarred over an exec into the init container; stdio flows
//! over plain TCP connections to the pod's relay ports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::ports::PortPool;
use crate::process::{LaunchSpec, ProcessFactory, WorkerProcess};

const INIT_CONTAINER: &str = "init";
const MAIN_CONTAINER: &str = "main";
const SIDECAR_CONTAINER: &str = "heartbeat";

const INIT_IMAGE: &str = "busybox:1.36";
const SIDECAR_IMAGE: &str = "alpine/socat:1.7.4.4";

const WORKSPACE_VOLUME: &str = "airbyte-worker";
const WORKSPACE_MOUNT: &str = "/workspace";

/// Seconds between sidecar heartbeat probes.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Consecutive missed probes before the sidecar tears the pod down.
const MAX_HEARTBEAT_MISSES: u32 = 3;
/// Exit code recorded when the heartbeat sidecar kills the worker.
const HEARTBEAT_KILL_EXIT: i32 = 125;
/// Exit code inferred when the pod failed without ever running the
/// entrypoint.
const COMMAND_NOT_FOUND_EXIT: i32 = 127;

const POD_POLL_INTERVAL: Duration = Duration::from_secs(5);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STARTUP_POLL_LIMIT: u32 = 240;
const RELAY_CONNECT_ATTEMPTS: u32 = 20;

/// Launches workers as ephemeral pods.
pub struct KubeProcessFactory {
    pods: Api<Pod>,
    /// `host:port` the pod sidecars probe for scheduler liveness.
    heartbeat_url: String,
    ports: Arc<PortPool>,
}

impl KubeProcessFactory {
    pub fn new(
        client: Client,
        namespace: &str,
        heartbeat_url: impl Into<String>,
        ports: Arc<PortPool>,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            heartbeat_url: heartbeat_url.into(),
            ports,
        }
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        stdin_port: u16,
        stdout_port: u16,
    ) -> Result<KubePodProcess> {
        let pod_name = format!("airbyte-worker-{}-{}", spec.job_id, spec.attempt_number);
        let pod = build_pod(&pod_name, spec, stdin_port, stdout_port, &self.heartbeat_url);

        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .with_context(|| format!("failed to create worker pod {pod_name}"))?;
        debug!(pod = %pod_name, "worker pod created");

        self.await_init_running(&pod_name).await?;
        self.stage_files(&pod_name, spec).await?;
        let pod_ip = self.await_main_running(&pod_name).await?;

        info!(
            pod = %pod_name,
            job_id = spec.job_id,
            attempt = spec.attempt_number,
            image = %spec.image,
            "kube worker started"
        );

        let stdout = connect_relay(&pod_ip, stdout_port).await?;
        let stdin = if spec.uses_stdin {
            Some(connect_relay(&pod_ip, stdin_port).await?)
        } else {
            None
        };

        Ok(KubePodProcess {
            pods: self.pods.clone(),
            pod_name,
            ports: self.ports.clone(),
            stdin_port,
            stdout_port,
            ports_released: false,
            stdin: stdin.map(|s| {
                let (_, write) = s.into_split();
                Box::new(write) as Box<dyn AsyncWrite + Send + Unpin>
            }),
            stdout: {
                let (read, _) = stdout.into_split();
                Some(Box::new(read) as Box<dyn AsyncRead + Send + Unpin>)
            },
            exit: None,
        })
    }

    /// Tar the input files over an exec into the init container, then drop
    /// the marker the init poll loop is watching for.
    async fn stage_files(&self, pod_name: &str, spec: &LaunchSpec) -> Result<()> {
        let archive = tar_archive(&spec.files)?;

        let attach = AttachParams::default()
            .container(INIT_CONTAINER)
            .stdin(true)
            .stdout(false)
            .stderr(false);
        let mut exec = self
            .pods
            .exec(
                pod_name,
                vec![
                    "sh",
                    "-c",
                    "tar xf - -C /workspace && touch /workspace/FINISHED_UPLOADING",
                ],
                &attach,
            )
            .await
            .with_context(|| format!("failed to exec into {pod_name} for file staging"))?;

        let mut stdin = exec
            .stdin()
            .ok_or_else(|| anyhow!("staging exec exposed no stdin"))?;
        stdin.write_all(&archive).await?;
        stdin.shutdown().await?;
        drop(stdin);

        exec.join()
            .await
            .with_context(|| format!("file staging into {pod_name} failed"))?;
        debug!(pod = %pod_name, files = spec.files.len(), "input files staged");
        Ok(())
    }

    async fn await_init_running(&self, pod_name: &str) -> Result<()> {
        for _ in 0..STARTUP_POLL_LIMIT {
            let pod = self.pods.get(pod_name).await?;
            let init_running = pod
                .status
                .as_ref()
                .and_then(|s| s.init_container_statuses.as_ref())
                .map(|statuses| {
                    statuses.iter().any(|st| {
                        st.name == INIT_CONTAINER
                            && st
                                .state
                                .as_ref()
                                .map(|state| state.running.is_some())
                                .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if init_running {
                return Ok(());
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
        bail!("init container of {pod_name} never started")
    }

    /// Wait until the main container is up and return the pod IP.
    async fn await_main_running(&self, pod_name: &str) -> Result<String> {
        for _ in 0..STARTUP_POLL_LIMIT {
            let pod = self.pods.get(pod_name).await?;
            let status = pod.status.as_ref();
            let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("");
            if phase == "Failed" {
                bail!("worker pod {pod_name} failed during startup");
            }
            if phase == "Running" || phase == "Succeeded" {
                if let Some(ip) = status.and_then(|s| s.pod_ip.clone()) {
                    return Ok(ip);
                }
            }
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
        bail!("worker pod {pod_name} never reached Running")
    }
}

#[async_trait]
impl ProcessFactory for KubeProcessFactory {
    async fn create(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerProcess>> {
        // Two ports per worker: stdin injection and stdout relay. Blocks
        // while the pool is dry, which is the launch back-pressure.
        let stdin_port = self.ports.take().await?;
        let stdout_port = match self.ports.take().await {
            Ok(port) => port,
            Err(e) => {
                self.ports.release(stdin_port).await;
                return Err(e);
            }
        };

        match self.launch(&spec, stdin_port, stdout_port).await {
            Ok(process) => Ok(Box::new(process)),
            Err(e) => {
                self.ports.release(stdin_port).await;
                self.ports.release(stdout_port).await;
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle to a running worker pod.
pub struct KubePodProcess {
    pods: Api<Pod>,
    pod_name: String,
    ports: Arc<PortPool>,
    stdin_port: u16,
    stdout_port: u16,
    ports_released: bool,
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    exit: Option<i32>,
}

impl KubePodProcess {
    async fn release_ports(&mut self) {
        if !self.ports_released {
            self.ports_released = true;
            self.ports.release(self.stdin_port).await;
            self.ports.release(self.stdout_port).await;
        }
    }
}

#[async_trait]
impl WorkerProcess for KubePodProcess {
    fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        // stderr is folded into the stdout relay inside the pod.
        None
    }

    async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        loop {
            let pod = self
                .pods
                .get(&self.pod_name)
                .await
                .with_context(|| format!("failed to poll worker pod {}", self.pod_name))?;
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("");
            if phase == "Succeeded" || phase == "Failed" {
                let code = exit_code_of(&pod);
                self.exit = Some(code);
                return Ok(code);
            }
            tokio::time::sleep(POD_POLL_INTERVAL).await;
        }
    }

    fn exit_value(&self) -> Option<i32> {
        self.exit
    }

    async fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.pods.get(&self.pod_name).await {
            Ok(pod) => {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("");
                if phase == "Succeeded" || phase == "Failed" {
                    self.exit = Some(exit_code_of(&pod));
                    false
                } else {
                    true
                }
            }
            Err(_) => false,
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        match self
            .pods
            .delete(&self.pod_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => {
                // Still hand the ports back; a leaked pod is recoverable, a
                // leaked port starves every future launch.
                self.release_ports().await;
                return Err(e)
                    .with_context(|| format!("failed to delete worker pod {}", self.pod_name));
            }
        }
        self.release_ports().await;
        info!(pod = %self.pod_name, "worker pod destroyed");
        Ok(())
    }
}

/// Read the worker exit code out of a terminal pod.
///
/// The main container's termination message carries the TERMINATION file
/// contents; when it is missing the container status supplies the fallback.
fn exit_code_of(pod: &Pod) -> i32 {
    let terminated = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|st| st.name == MAIN_CONTAINER))
        .and_then(|st| st.state.as_ref())
        .and_then(|state| state.terminated.as_ref());

    match terminated {
        Some(t) => t
            .message
            .as_deref()
            .and_then(|m| m.trim().parse::<i32>().ok())
            .unwrap_or(t.exit_code),
        None => COMMAND_NOT_FOUND_EXIT,
    }
}

async fn connect_relay(pod_ip: &str, port: u16) -> Result<TcpStream> {
    let mut last_err = None;
    for _ in 0..RELAY_CONNECT_ATTEMPTS {
        match TcpStream::connect((pod_ip, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            }
        }
    }
    warn!(pod_ip, port, "worker relay never accepted a connection");
    Err(anyhow!(
        "failed to connect to worker relay {pod_ip}:{port}: {:?}",
        last_err
    ))
}

/// Serialize the input files as an uncompressed tar stream.
fn tar_archive(files: &std::collections::HashMap<String, String>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .with_context(|| format!("failed to add {name} to staging archive"))?;
    }
    builder
        .into_inner()
        .context("failed to finish staging archive")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn init_script() -> String {
    format!(
        r#"mkfifo {m}/stdin.pipe {m}/stdout.pipe
I=0
while [ ! -f {m}/FINISHED_UPLOADING ]; do
  I=$((I+1))
  if [ $I -gt 6000 ]; then exit 1; fi
  sleep 0.1
done"#,
        m = WORKSPACE_MOUNT
    )
}

/// Wrapper around the user entrypoint: stream through the pipes, record the
/// exit code, and die promptly when the heartbeat sidecar drops the KILL
/// marker.
fn main_script(spec: &LaunchSpec) -> String {
    let mut cmd = shell_quote(&spec.entrypoint);
    for arg in &spec.args {
        cmd.push(' ');
        cmd.push_str(&shell_quote(arg));
    }
    let stdin_redirect = if spec.uses_stdin {
        format!("< {WORKSPACE_MOUNT}/stdin.pipe ")
    } else {
        String::new()
    };
    format!(
        r#"({cmd} {stdin_redirect}> {m}/stdout.pipe 2>&1) &
CHILD=$!
while kill -0 $CHILD 2> /dev/null; do
  if [ -f {m}/KILL ]; then
    kill $CHILD
    wait $CHILD
    echo {kill_exit} > {m}/TERMINATION
    exit {kill_exit}
  fi
  sleep 1
done
wait $CHILD
EC=$?
echo $EC > {m}/TERMINATION
exit $EC"#,
        m = WORKSPACE_MOUNT,
        kill_exit = HEARTBEAT_KILL_EXIT,
    )
}

/// Sidecar: relay the stdio pipes over TCP and gate the pod on scheduler
/// liveness.
fn sidecar_script(stdin_port: u16, stdout_port: u16, heartbeat_url: &str) -> String {
    format!(
        r#"socat -d -u TCP-L:{stdin_port},reuseaddr OPEN:{m}/stdin.pipe,wronly &
socat -d -u OPEN:{m}/stdout.pipe,rdonly TCP-L:{stdout_port},reuseaddr &
MISSES=0
while true; do
  if [ -f {m}/TERMINATION ]; then exit 0; fi
  if wget -q -O /dev/null http://{heartbeat_url}/; then MISSES=0; else MISSES=$((MISSES+1)); fi
  if [ $MISSES -ge {max_misses} ]; then
    touch {m}/KILL
    exit 1
  fi
  sleep {interval}
done"#,
        m = WORKSPACE_MOUNT,
        max_misses = MAX_HEARTBEAT_MISSES,
        interval = HEARTBEAT_INTERVAL_SECS,
    )
}

fn workspace_mount() -> VolumeMount {
    VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_MOUNT.to_string(),
        ..Default::default()
    }
}

fn build_pod(
    name: &str,
    spec: &LaunchSpec,
    stdin_port: u16,
    stdout_port: u16,
    heartbeat_url: &str,
) -> Pod {
    let labels = [
        ("app".to_string(), "airbyte-worker".to_string()),
        ("job-id".to_string(), spec.job_id.to_string()),
        ("attempt-id".to_string(), spec.attempt_number.to_string()),
    ]
    .into_iter()
    .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            init_containers: Some(vec![Container {
                name: INIT_CONTAINER.to_string(),
                image: Some(INIT_IMAGE.to_string()),
                command: Some(vec!["sh".to_string(), "-c".to_string(), init_script()]),
                volume_mounts: Some(vec![workspace_mount()]),
                ..Default::default()
            }]),
            containers: vec![
                Container {
                    name: MAIN_CONTAINER.to_string(),
                    image: Some(spec.image.clone()),
                    command: Some(vec!["sh".to_string(), "-c".to_string(), main_script(spec)]),
                    working_dir: Some(WORKSPACE_MOUNT.to_string()),
                    termination_message_path: Some(format!("{WORKSPACE_MOUNT}/TERMINATION")),
                    volume_mounts: Some(vec![workspace_mount()]),
                    ..Default::default()
                },
                Container {
                    name: SIDECAR_CONTAINER.to_string(),
                    image: Some(SIDECAR_IMAGE.to_string()),
                    command: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        sidecar_script(stdin_port, stdout_port, heartbeat_url),
                    ]),
                    ports: Some(vec![
                        ContainerPort {
                            container_port: i32::from(stdin_port),
                            name: Some("worker-stdin".to_string()),
                            ..Default::default()
                        },
                        ContainerPort {
                            container_port: i32::from(stdout_port),
                            name: Some("worker-stdout".to_string()),
                            ..Default::default()
                        },
                    ]),
                    volume_mounts: Some(vec![workspace_mount()]),
                    ..Default::default()
                },
            ],
            volumes: Some(vec![Volume {
                name: WORKSPACE_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec::builder()
            .job_id(11i64)
            .attempt_number(0)
            .job_root("/tmp/workspace/11/0")
            .image("airbyte/source-postgres:0.1.0")
            .uses_stdin(true)
            .entrypoint("/airbyte/base.sh")
            .args(vec!["read".to_string()])
            .build()
    }

    #[test]
    fn pod_has_three_containers_sharing_the_workspace() {
        let pod = build_pod("airbyte-worker-11-0", &spec(), 9001, 9002, "scheduler:9000");
        let pod_spec = pod.spec.unwrap();

        let init = &pod_spec.init_containers.unwrap()[0];
        assert_eq!(init.name, "init");

        let names: Vec<_> = pod_spec.containers.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, ["main", "heartbeat"]);

        for container in &pod_spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert_eq!(mounts[0].mount_path, "/workspace");
        }
    }

    #[test]
    fn main_container_records_termination() {
        let pod = build_pod("airbyte-worker-11-0", &spec(), 9001, 9002, "scheduler:9000");
        let main = &pod.spec.unwrap().containers[0];

        assert_eq!(
            main.termination_message_path.as_deref(),
            Some("/workspace/TERMINATION")
        );
        let script = &main.command.as_ref().unwrap()[2];
        assert!(script.contains("'/airbyte/base.sh' 'read'"));
        assert!(script.contains("< /workspace/stdin.pipe"));
        assert!(script.contains("echo $EC > /workspace/TERMINATION"));
    }

    #[test]
    fn sidecar_probes_heartbeat_and_relays_both_ports() {
        let pod = build_pod("airbyte-worker-11-0", &spec(), 9001, 9002, "scheduler:9000");
        let sidecar = &pod.spec.unwrap().containers[1];

        let script = &sidecar.command.as_ref().unwrap()[2];
        assert!(script.contains("http://scheduler:9000/"));
        assert!(script.contains("TCP-L:9001"));
        assert!(script.contains("TCP-L:9002"));
        assert!(script.contains("-ge 3"));

        let ports = sidecar.ports.as_ref().unwrap();
        assert_eq!(ports[0].container_port, 9001);
        assert_eq!(ports[1].container_port, 9002);
    }

    #[test]
    fn no_stdin_redirect_without_uses_stdin() {
        let mut spec = spec();
        spec.uses_stdin = false;
        let script = main_script(&spec);
        assert!(!script.contains("stdin.pipe"));
    }

    #[test]
    fn exit_code_prefers_termination_message() {
        use k8s_openapi::api::core::v1::{
            ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
        };

        let pod_with = |message: Option<&str>, exit_code: i32| Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: MAIN_CONTAINER.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            message: message.map(String::from),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        // Termination file content wins.
        assert_eq!(exit_code_of(&pod_with(Some("2\n"), 1)), 2);
        // Missing terminator falls back to the container status.
        assert_eq!(exit_code_of(&pod_with(None, 1)), 1);
        // No terminated state at all reads as command-not-found.
        assert_eq!(exit_code_of(&Pod::default()), 127);
    }

    #[test]
    fn tar_archive_round_trips_files() {
        let files = std::collections::HashMap::from([
            ("source_config.json".to_string(), "{}".to_string()),
            ("catalog.json".to_string(), "{\"streams\":[]}".to_string()),
        ]);
        let bytes = tar_archive(&files).unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut seen = std::collections::HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = String::new();
            std::io::Read::read_to_string(&mut entry, &mut contents).unwrap();
            seen.insert(path, contents);
        }
        assert_eq!(seen, files);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }
}
