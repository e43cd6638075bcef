//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::tracking::TrackingStrategy;

/// Where worker containers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEnvironment {
    Docker,
    Kubernetes,
}

impl FromStr for WorkerEnvironment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DOCKER" => Ok(WorkerEnvironment::Docker),
            "KUBERNETES" => Ok(WorkerEnvironment::Kubernetes),
            other => Err(anyhow::anyhow!("unknown worker environment: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub local_root: PathBuf,
    pub config_root: PathBuf,
    pub database_url: String,
    pub database_user: Option<String>,
    pub database_password: Option<String>,
    pub worker_environment: WorkerEnvironment,
    pub temporal_host: String,
    pub airbyte_version: String,
    pub airbyte_role: Option<String>,
    pub tracking_strategy: TrackingStrategy,
    pub temporal_worker_ports: Vec<u16>,
    pub workspace_docker_mount: Option<String>,
    pub local_docker_mount: Option<String>,
    pub docker_network: String,
    pub webapp_url: Option<String>,
    pub submitter_max_workers: usize,
    pub graceful_shutdown: Duration,
}

impl Config {
    /// Load configuration from environment variables. Missing mandatory
    /// variables are a startup-fatal error.
    pub fn from_env() -> Result<Self> {
        // Load .env if present (development).
        let _ = dotenv();

        Ok(Self {
            workspace_root: required("WORKSPACE_ROOT")?.into(),
            local_root: required("LOCAL_ROOT")?.into(),
            config_root: required("CONFIG_ROOT")?.into(),
            database_url: required("DATABASE_URL")?,
            database_user: env::var("DATABASE_USER").ok(),
            database_password: env::var("DATABASE_PASSWORD").ok(),
            worker_environment: env::var("WORKER_ENVIRONMENT")
                .unwrap_or_else(|_| "DOCKER".to_string())
                .parse()?,
            temporal_host: env::var("TEMPORAL_HOST")
                .unwrap_or_else(|_| "localhost:7233".to_string()),
            airbyte_version: required("AIRBYTE_VERSION")?,
            airbyte_role: env::var("AIRBYTE_ROLE").ok(),
            tracking_strategy: env::var("TRACKING_STRATEGY")
                .unwrap_or_else(|_| "LOGGING".to_string())
                .parse()?,
            temporal_worker_ports: parse_ports(
                &env::var("TEMPORAL_WORKER_PORTS").unwrap_or_default(),
            )?,
            workspace_docker_mount: env::var("WORKSPACE_DOCKER_MOUNT").ok(),
            local_docker_mount: env::var("LOCAL_DOCKER_MOUNT").ok(),
            docker_network: env::var("DOCKER_NETWORK").unwrap_or_else(|_| "host".to_string()),
            webapp_url: env::var("WEBAPP_URL").ok(),
            submitter_max_workers: parse_or("SUBMITTER_MAX_WORKERS", 4)?,
            graceful_shutdown: Duration::from_secs(parse_or("GRACEFUL_SHUTDOWN_SECONDS", 30)?),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} must be set"))
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

/// Comma-separated port list, e.g. `9001,9002,9003`.
fn parse_ports(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .with_context(|| format!("invalid worker port: {s}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_ports() {
        assert_eq!(
            parse_ports("9001, 9002,9003").unwrap(),
            vec![9001, 9002, 9003]
        );
        assert!(parse_ports("").unwrap().is_empty());
        assert!(parse_ports("9001,nope").is_err());
    }

    #[test]
    fn worker_environment_parses_case_insensitively() {
        assert_eq!(
            "docker".parse::<WorkerEnvironment>().unwrap(),
            WorkerEnvironment::Docker
        );
        assert_eq!(
            "KUBERNETES".parse::<WorkerEnvironment>().unwrap(),
            WorkerEnvironment::Kubernetes
        );
        assert!("mesos".parse::<WorkerEnvironment>().is_err());
    }
}
