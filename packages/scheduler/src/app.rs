//! Startup sequencing and the periodic loops.
//!
//! Order matters here: database (with retry) -> migrations -> wait for the
//! config server's version -> compatibility check -> process factory ->
//! heartbeat server (kube only) -> zombie reaper -> dispatch and cleaner
//! loops. Both loops are fixed-delay, so a slow tick never stacks ticks.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use workers::heartbeat::KUBE_HEARTBEAT_PORT;
use workers::{
    DockerProcessFactory, HeartbeatServer, KubeProcessFactory, PortPool, ProcessFactory,
};

use crate::config::{Config, WorkerEnvironment};
use crate::config_repo::ConfigRepository;
use crate::notify::{LoggingNotifier, Notifier};
use crate::persistence::{JobPersistence, PostgresPersistence};
use crate::scheduling::{
    JobCleaner, JobRetrier, JobScheduler, JobSubmitter, RetryPolicy, WorkspaceRetentionConfig,
    ZombieReaper,
};
use crate::tracking::{TrackingClient, TrackingIdentity};
use crate::workflow::{RuntimeWorkflowClient, WorkflowClient};

const DISPATCH_INTERVAL: Duration = Duration::from_secs(5);
const CLEANING_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
const VERSION_WAIT_LIMIT: Duration = Duration::from_secs(300);
const VERSION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DB_CONNECT_ATTEMPTS: u32 = 10;
const KUBE_NAMESPACE: &str = "default";

pub struct SchedulerApp {
    config: Config,
}

impl SchedulerApp {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let pool = connect_with_retry(&config).await?;
        let store = PostgresPersistence::new(pool);
        store.migrate().await?;
        let persistence: Arc<dyn JobPersistence> = Arc::new(store);

        // The config server publishes the platform version once its own
        // migrations are done; nothing may run before that.
        let db_version = wait_for_version(persistence.as_ref()).await?;
        check_version_compat(&config.airbyte_version, &db_version)?;
        info!(version = %db_version, "database version verified");

        let factory = build_process_factory(&config).await?;

        let shutdown = CancellationToken::new();

        if config.worker_environment == WorkerEnvironment::Kubernetes {
            let server = HeartbeatServer::new(KUBE_HEARTBEAT_PORT);
            let heartbeat_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(heartbeat_shutdown).await {
                    error!(error = %e, "heartbeat server failed");
                }
            });
        }

        let tracking = TrackingClient::new(
            config.tracking_strategy,
            TrackingIdentity {
                airbyte_version: config.airbyte_version.clone(),
                airbyte_role: config.airbyte_role.clone(),
            },
        );
        let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier::new(
            tracking.clone(),
            config.webapp_url.clone(),
        ));

        // Crash recovery must finish before the dispatcher starts so the
        // submitter can never observe stale RUNNING jobs.
        let reaped = ZombieReaper::new(persistence.clone(), notifier.clone())
            .run()
            .await?;
        if reaped > 0 {
            info!(reaped, "cancelled zombie jobs from a previous run");
        }

        let config_repo = Arc::new(ConfigRepository::new(&config.config_root));
        let workflow: Arc<dyn WorkflowClient> =
            Arc::new(RuntimeWorkflowClient::new(config.temporal_host.clone()));

        let scheduler = JobScheduler::new(persistence.clone(), config_repo);
        let retrier = JobRetrier::new(persistence.clone(), notifier, RetryPolicy::default());
        let submitter = Arc::new(JobSubmitter::new(
            persistence.clone(),
            workflow,
            tracking,
            &config.workspace_root,
            config.submitter_max_workers,
            shutdown.clone(),
        ));
        let cleaner = JobCleaner::new(
            persistence,
            &config.workspace_root,
            WorkspaceRetentionConfig::default(),
        );

        let dispatch_handle = {
            let shutdown = shutdown.clone();
            let submitter = submitter.clone();
            tokio::spawn(async move {
                info!("dispatcher started");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(DISPATCH_INTERVAL) => {}
                    }
                    if let Err(e) = retrier.tick().await {
                        warn!(error = %e, "retrier tick failed");
                    }
                    if let Err(e) = scheduler.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                    if let Err(e) = submitter.tick().await {
                        warn!(error = %e, "submitter tick failed");
                    }
                }
                info!("dispatcher stopped");
            })
        };

        let cleaner_handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(CLEANING_INTERVAL) => {}
                    }
                    if let Err(e) = cleaner.sweep().await {
                        warn!(error = %e, "workspace sweep failed");
                    }
                }
            })
        };

        info!("scheduler started");
        wait_for_signal().await;
        info!("shutdown signal received");

        // Stop accepting new work, then give in-flight attempts a bounded
        // window before hard cancellation.
        shutdown.cancel();
        let _ = dispatch_handle.await;
        let _ = cleaner_handle.await;

        submitter.tasks().close();
        if tokio::time::timeout(config.graceful_shutdown, submitter.tasks().wait())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = config.graceful_shutdown.as_secs(),
                "graceful shutdown timed out, abandoning in-flight attempts"
            );
        }

        factory.close().await?;
        info!("scheduler stopped");
        Ok(())
    }
}

async fn connect_with_retry(config: &Config) -> Result<PgPool> {
    let mut options = PgConnectOptions::from_str(&config.database_url)
        .context("DATABASE_URL is not a valid postgres URL")?;
    if let Some(user) = &config.database_user {
        options = options.username(user);
    }
    if let Some(password) = &config.database_password {
        options = options.password(password);
    }

    let mut delay = Duration::from_secs(1);
    for attempt in 1..=DB_CONNECT_ATTEMPTS {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => {
                info!("database connected");
                return Ok(pool);
            }
            Err(e) => {
                warn!(attempt, error = %e, "database not reachable yet");
                sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
        }
    }
    bail!("database unreachable after {DB_CONNECT_ATTEMPTS} attempts")
}

/// Poll until the config server has published a version, up to the limit.
async fn wait_for_version(persistence: &dyn JobPersistence) -> Result<String> {
    let deadline = tokio::time::Instant::now() + VERSION_WAIT_LIMIT;
    loop {
        match persistence.get_version().await {
            Ok(Some(version)) => return Ok(version),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "version lookup failed"),
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "config server never published a version (waited {}s)",
                VERSION_WAIT_LIMIT.as_secs()
            );
        }
        sleep(VERSION_POLL_INTERVAL).await;
    }
}

/// The scheduler refuses to run against a database from another minor
/// version line; dev builds bypass the check.
fn check_version_compat(app_version: &str, db_version: &str) -> Result<()> {
    if app_version == "dev" || db_version == "dev" {
        return Ok(());
    }
    if major_minor(app_version)? != major_minor(db_version)? {
        bail!("version mismatch: scheduler {app_version} vs database {db_version}");
    }
    Ok(())
}

fn major_minor(version: &str) -> Result<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .with_context(|| format!("unparsable version: {version}"))?;
    let minor = parts
        .next()
        .and_then(|p| p.parse().ok())
        .with_context(|| format!("unparsable version: {version}"))?;
    Ok((major, minor))
}

async fn build_process_factory(config: &Config) -> Result<Arc<dyn ProcessFactory>> {
    match config.worker_environment {
        WorkerEnvironment::Docker => {
            let mounts = workers::docker::DockerMounts {
                workspace_mount: config
                    .workspace_docker_mount
                    .clone()
                    .unwrap_or_else(|| config.workspace_root.to_string_lossy().into_owned()),
                local_mount: config
                    .local_docker_mount
                    .clone()
                    .unwrap_or_else(|| config.local_root.to_string_lossy().into_owned()),
                network: config.docker_network.clone(),
            };
            Ok(Arc::new(DockerProcessFactory::new(mounts)))
        }
        WorkerEnvironment::Kubernetes => {
            let client = kube::Client::try_default()
                .await
                .context("failed to build kubernetes client")?;
            let ports = Arc::new(PortPool::new(config.temporal_worker_ports.clone()));
            // Worker pods call back to this host's heartbeat endpoint.
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            Ok(Arc::new(KubeProcessFactory::new(
                client,
                KUBE_NAMESPACE,
                format!("{host}:{KUBE_HEARTBEAT_PORT}"),
                ports,
            )))
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
