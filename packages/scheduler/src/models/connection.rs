//! Connection-side configuration models.
//!
//! These mirror the JSON documents in the file-based config store. The
//! scheduler only reads them; the config server owns all writes.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

/// Periodic cadence. A connection without one is manual-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub units: i64,
    pub time_unit: TimeUnit,
}

impl Schedule {
    /// The minimum gap between two scheduled syncs.
    pub fn interval(&self) -> Duration {
        match self.time_unit {
            TimeUnit::Minutes => Duration::minutes(self.units),
            TimeUnit::Hours => Duration::hours(self.units),
            TimeUnit::Days => Duration::days(self.units),
            TimeUnit::Weeks => Duration::weeks(self.units),
            // Months have no fixed length; thirty days matches what the
            // config store promises users.
            TimeUnit::Months => Duration::days(30 * self.units),
        }
    }
}

/// A connection: replicate from a source to a destination on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardSync {
    pub connection_id: Uuid,
    pub name: String,
    pub source_id: Uuid,
    pub destination_id: Uuid,
    pub status: ConnectionStatus,
    /// None means manual: only triggered through the API.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Catalog of streams to replicate, embedded verbatim.
    #[serde(default)]
    pub catalog: serde_json::Value,
}

impl StandardSync {
    pub fn is_manual(&self) -> bool {
        self.schedule.is_none()
    }

    /// Jobs for this connection are scoped by the connection id.
    pub fn scope(&self) -> String {
        self.connection_id.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConnection {
    pub source_id: Uuid,
    pub source_definition_id: Uuid,
    pub name: String,
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConnection {
    pub destination_id: Uuid,
    pub destination_definition_id: Uuid,
    pub name: String,
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardSourceDefinition {
    pub source_definition_id: Uuid,
    pub name: String,
    pub docker_repository: String,
    pub docker_image_tag: String,
}

impl StandardSourceDefinition {
    pub fn image(&self) -> String {
        format!("{}:{}", self.docker_repository, self.docker_image_tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardDestinationDefinition {
    pub destination_definition_id: Uuid,
    pub name: String,
    pub docker_repository: String,
    pub docker_image_tag: String,
}

impl StandardDestinationDefinition {
    pub fn image(&self) -> String {
        format!("{}:{}", self.docker_repository, self.docker_image_tag)
    }
}
