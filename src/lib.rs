//! # backend-wire
//!
//! Agent side of the framed pipe protocol between a backup agent plugin and
//! its backend processes.
//!
//! A backend is any executable that speaks the protocol on its stdin/stdout
//! and writes free-form error text to stderr. The agent spawns one backend per
//! distinct plugin command, walks it through handshake, job description,
//! parameters and a phase start, then exchanges per-item metadata and data.
//!
//! ## Layers
//!
//! - **protocol**: 8-byte text headers (`<status><6 digits>\n`) and frames
//! - **transport**: child process pipes with one shared timeout
//! - **link**: command/data/ack/EOD vocabulary and sticky error flags
//! - **registry**: one link per plugin command string
//! - **orchestrator**: backup, restore, estimate, listing and query jobs
//!
//! ## Example
//!
//! ```ignore
//! use backend_wire::{JobEvent, JobOrchestrator, PluginConfig};
//!
//! #[tokio::main]
//! async fn main() -> backend_wire::Result<()> {
//!     let config = PluginConfig::from_json(&std::fs::read_to_string("docker.json")?)?;
//!     let mut job = JobOrchestrator::builder(config).build();
//!
//!     job.handle_event(JobEvent::Level('F')).await?;
//!     job.handle_event(JobEvent::BackupCommand("docker: container=web".into())).await?;
//!     while let Some(item) = job.start_backup_file().await? {
//!         println!("{}", item.path());
//!         job.end_backup_file().await?;
//!     }
//!     job.handle_event(JobEvent::JobEnd).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod link;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ItemKind, ItemValue, PluginConfig, RestoreItemSpec, RestoreOverlay};
pub use error::{BackendError, Result};
pub use host::{Host, HostValue, HostVariable, MessageLevel, TracingHost};
pub use link::{BackendLink, LinkConfig, LinkState};
pub use orchestrator::{
    BackupItem, CreateStatus, ItemMetadata, ItemStatus, JobEvent, JobOrchestrator, Launcher,
    OrchestratorBuilder, ProcessLauncher, QueryReply, QueryValue,
};
pub use registry::{BackendRegistry, Resolution};
