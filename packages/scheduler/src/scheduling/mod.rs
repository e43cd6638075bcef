//! The periodic scheduling components.
//!
//! Each dispatch tick runs retrier -> scheduler -> submitter against the
//! shared persistence; the reaper runs once at startup and the cleaner on
//! its own slow cadence. Ticks are independent: a failure in one never
//! prevents the next.

pub mod cleaner;
pub mod job_scheduler;
pub mod reaper;
pub mod retrier;
pub mod submitter;

pub use cleaner::{JobCleaner, WorkspaceRetentionConfig};
pub use job_scheduler::JobScheduler;
pub use reaper::ZombieReaper;
pub use retrier::{JobRetrier, RetryDecision, RetryPolicy};
pub use submitter::JobSubmitter;
