//! Data model for the scheduler.
//!
//! The graph is a strict tree: a connection describes what to replicate, a
//! job is one invocation of work for a connection, an attempt is one
//! execution try of a job. Jobs and attempts live in Postgres; connections
//! live in the file-based config store.

mod attempt;
mod connection;
mod job;

pub use attempt::{Attempt, AttemptOutput, AttemptStatus, SyncSummary};
pub use connection::{
    ConnectionStatus, DestinationConnection, Schedule, SourceConnection,
    StandardDestinationDefinition, StandardSourceDefinition, StandardSync, TimeUnit,
};
pub use job::{
    CheckConnectionConfig, ConfigType, DiscoverCatalogConfig, GetSpecConfig, Job, JobConfig,
    JobStatus, SyncConfig,
};
