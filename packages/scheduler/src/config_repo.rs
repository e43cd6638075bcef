//! Read-through accessor for the file-based config store.
//!
//! The config server owns a tree of JSON documents under the config root,
//! partitioned by kind:
//!
//! ```text
//! <configRoot>/STANDARD_SYNC/<uuid>.json
//! <configRoot>/SOURCE_CONNECTION/<uuid>.json
//! <configRoot>/DESTINATION_CONNECTION/<uuid>.json
//! <configRoot>/STANDARD_SOURCE_DEFINITION/<uuid>.json
//! <configRoot>/STANDARD_DESTINATION_DEFINITION/<uuid>.json
//! ```
//!
//! The scheduler only reads; every accessor hits the disk so config edits
//! take effect on the next tick.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::models::{
    DestinationConnection, SourceConnection, StandardDestinationDefinition,
    StandardSourceDefinition, StandardSync,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigRepoError {
    #[error("no {kind} config with id {id}")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type ConfigRepoResult<T> = Result<T, ConfigRepoError>;

const STANDARD_SYNC: &str = "STANDARD_SYNC";
const SOURCE_CONNECTION: &str = "SOURCE_CONNECTION";
const DESTINATION_CONNECTION: &str = "DESTINATION_CONNECTION";
const STANDARD_SOURCE_DEFINITION: &str = "STANDARD_SOURCE_DEFINITION";
const STANDARD_DESTINATION_DEFINITION: &str = "STANDARD_DESTINATION_DEFINITION";

pub struct ConfigRepository {
    root: PathBuf,
}

impl ConfigRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every connection in the store, in directory order.
    pub async fn list_standard_syncs(&self) -> ConfigRepoResult<Vec<StandardSync>> {
        let dir = self.root.join(STANDARD_SYNC);
        let mut syncs = Vec::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // An absent kind directory is an empty store, not an error; the
            // config server creates it lazily.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(syncs),
            Err(e) => {
                return Err(ConfigRepoError::Io {
                    path: dir,
                    source: e,
                })
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| ConfigRepoError::Io {
            path: dir.clone(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            syncs.push(read_json(&path).await?);
        }
        Ok(syncs)
    }

    pub async fn get_standard_sync(&self, id: Uuid) -> ConfigRepoResult<StandardSync> {
        self.get(STANDARD_SYNC, id).await
    }

    pub async fn get_source_connection(&self, id: Uuid) -> ConfigRepoResult<SourceConnection> {
        self.get(SOURCE_CONNECTION, id).await
    }

    pub async fn get_destination_connection(
        &self,
        id: Uuid,
    ) -> ConfigRepoResult<DestinationConnection> {
        self.get(DESTINATION_CONNECTION, id).await
    }

    pub async fn get_source_definition(
        &self,
        id: Uuid,
    ) -> ConfigRepoResult<StandardSourceDefinition> {
        self.get(STANDARD_SOURCE_DEFINITION, id).await
    }

    pub async fn get_destination_definition(
        &self,
        id: Uuid,
    ) -> ConfigRepoResult<StandardDestinationDefinition> {
        self.get(STANDARD_DESTINATION_DEFINITION, id).await
    }

    async fn get<T: DeserializeOwned>(&self, kind: &'static str, id: Uuid) -> ConfigRepoResult<T> {
        let path = self.root.join(kind).join(format!("{id}.json"));
        if !path.exists() {
            return Err(ConfigRepoError::NotFound { kind, id });
        }
        read_json(&path).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> ConfigRepoResult<T> {
    let bytes = tokio::fs::read(path).await.map_err(|e| ConfigRepoError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| ConfigRepoError::Malformed {
        path: path.to_path_buf(),
        source: e,
    })
}
