//! Worker-process launching for the scheduler.
//!
//! This crate owns everything between "run this connector image" and a live,
//! observable process handle:
//! - [`process::WorkerProcess`] - the POSIX-shaped handle contract
//! - [`docker::DockerProcessFactory`] - local `docker run` launching
//! - [`kubernetes::KubeProcessFactory`] - ephemeral pod launching with
//!   heartbeat-gated liveness
//! - [`ports::PortPool`] - bounded allocation of worker ports
//! - [`heartbeat::HeartbeatServer`] - the liveness endpoint worker pods probe
//!
//! # Architecture
//!
//! ```text
//! ProcessFactory::create(LaunchSpec)
//!     │
//!     ├─► Docker: stage files on disk, `docker run --rm --entrypoint ...`
//!     │
//!     └─► Kube: take two ports ──► build pod (init / main / heartbeat)
//!              ──► stage files (tar over exec) ──► connect stdio relays
//! ```

pub mod docker;
pub mod heartbeat;
pub mod kubernetes;
pub mod ports;
pub mod process;

pub use docker::DockerProcessFactory;
pub use heartbeat::HeartbeatServer;
pub use kubernetes::KubeProcessFactory;
pub use ports::PortPool;
pub use process::{LaunchSpec, ProcessFactory, WorkerProcess};
