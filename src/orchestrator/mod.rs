//! Job orchestrator - drives backends through backup, restore, estimate,
//! listing and query jobs.
//!
//! The embedding agent calls one entry point per job-lifecycle callback:
//! [`JobOrchestrator::handle_event`] for job events, the `*_backup_file` pair
//! and the `io_*` family for the per-item loop, [`JobOrchestrator::create_file`]
//! during restore, and [`JobOrchestrator::query_parameter`] for interactive
//! queries. Every call talks to the backend selected by the last plugin
//! command event and returns once the request/response exchange is complete.
//!
//! # Example
//!
//! ```ignore
//! use backend_wire::{ItemStatus, JobEvent, JobOrchestrator, PluginConfig};
//!
//! let mut job = JobOrchestrator::builder(PluginConfig::new("docker", "/opt/docker-backend"))
//!     .build();
//! job.handle_event(JobEvent::Level('F')).await?;
//! job.handle_event(JobEvent::BackupCommand("docker: container=web".into())).await?;
//! while let Some(item) = job.start_backup_file().await? {
//!     // save item, pull data with io_open/io_read/io_close
//!     if job.end_backup_file().await? == ItemStatus::Done {
//!         break;
//!     }
//! }
//! job.handle_event(JobEvent::JobEnd).await?;
//! ```

mod attributes;
mod item;
mod job;
mod params;
mod phase;
mod query;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::config::{PluginConfig, RestoreOverlay, RESTORE_OBJECT_NAME};
use crate::error::{BackendError, Result};
use crate::host::{Host, HostVariable, MessageLevel, TracingHost};
use crate::link::{BackendLink, LinkConfig};
use crate::registry::{BackendRegistry, Resolution};

pub use attributes::{parse_stat, parse_tstamp, render_stat, render_tstamp, StatRecord};
pub use item::{BackupItem, FileType, ItemMetadata, PluginObject, RestoreObject, StatInfo};
pub use job::{BackupLevel, JobDescriptor, JobMode, JobType, ReplacePolicy};
pub use params::{is_valid_param, ParamSet, PluginCommand};
pub use phase::PhaseStart;
pub use query::QueryValue;

/// Job-lifecycle events delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Job started; job id and name are read from the host.
    JobStart,
    /// Job finished; every backend is terminated.
    JobEnd,
    /// Backup level character (`F`, `I`, `D`).
    Level(char),
    /// Reference time for incremental/differential levels.
    Since(i64),
    StartBackupJob,
    EndBackupJob,
    /// Restore started; restore location and policy are read from the host.
    StartRestoreJob,
    /// Restore finished; every backend gets `FINISH`.
    EndRestoreJob,
    EstimateCommand(String),
    BackupCommand(String),
    RestoreCommand(String),
    /// Plugin command seen while building the file set.
    PluginCommand(String),
    /// Plugin command used as an option plugin, which is not supported.
    OptionPlugin(String),
    EndFileSet,
    RestoreObject(RestoreObject),
    /// Job cancelled by the operator.
    Cancel,
}

/// What follows an item in the backup loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Another item is pending.
    More,
    /// No more items from this backend.
    Done,
}

/// Backend decision on a file to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    /// Send the file data.
    Extract,
    /// Do not restore this file.
    Skip,
}

/// One step of an interactive query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    /// A reply line; more may follow.
    More(QueryValue),
    /// The backend finished answering.
    Done,
}

/// Starts a backend process for a link.
///
/// The default [`ProcessLauncher`] spawns the configured executable; other
/// implementations may attach any connected transport.
pub trait Launcher: Send + Sync {
    /// Make `link` live for the backend described by `config`.
    fn launch(&self, link: &mut BackendLink, config: &PluginConfig) -> Result<()>;
}

/// Spawns `config.backend` with `config.backend_args`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, link: &mut BackendLink, config: &PluginConfig) -> Result<()> {
        tracing::debug!("Executing: {}", config.backend.display());
        link.open(&config.backend, &config.backend_args)
    }
}

/// Builder for a [`JobOrchestrator`].
pub struct OrchestratorBuilder {
    plugin: PluginConfig,
    link: LinkConfig,
    host: Option<Arc<dyn Host>>,
    launcher: Option<Arc<dyn Launcher>>,
}

impl OrchestratorBuilder {
    /// Start from a plugin configuration.
    pub fn new(plugin: PluginConfig) -> Self {
        Self {
            plugin,
            link: LinkConfig::default(),
            host: None,
            launcher: None,
        }
    }

    /// Set the transport settings shared by every link.
    pub fn link_config(mut self, config: LinkConfig) -> Self {
        self.link = config;
        self
    }

    /// Set the per-call backend timeout.
    ///
    /// Default: 300 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.link = self.link.timeout(timeout);
        self
    }

    /// Set the host facilities. Default: [`TracingHost`].
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Set how backends are started. Default: [`ProcessLauncher`].
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Build the orchestrator, checking that the backend is executable.
    pub fn build(self) -> JobOrchestrator {
        let host = self.host.unwrap_or_else(|| Arc::new(TracingHost));
        let backend_error = match self.plugin.backend_available() {
            Ok(()) => {
                tracing::debug!("Backend available");
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Unable to use backend: {} Err={}",
                    self.plugin.backend.display(),
                    e
                );
                Some(e)
            }
        };
        JobOrchestrator {
            registry: BackendRegistry::new(host.clone(), self.link),
            host,
            launcher: self.launcher.unwrap_or_else(|| Arc::new(ProcessLauncher)),
            config: self.plugin,
            job: JobDescriptor::default(),
            backend_error,
            restore_object_sent: false,
            next_item: None,
            plugin_object_sent: false,
            open_error: false,
            no_data: false,
            acl: None,
            xattr: None,
            query_started: false,
        }
    }
}

/// Attribute command announcing a metadata payload.
const METADATA_STREAM: &str = "METADATA_STREAM";

/// Item announced by the backend and not yet handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NextItem {
    File(String),
    PluginObject(String),
}

/// Protocol state machine for one job.
pub struct JobOrchestrator {
    host: Arc<dyn Host>,
    launcher: Arc<dyn Launcher>,
    config: PluginConfig,
    registry: BackendRegistry,
    job: JobDescriptor,
    /// Why the backend cannot be executed, if it cannot.
    backend_error: Option<String>,
    restore_object_sent: bool,
    next_item: Option<NextItem>,
    plugin_object_sent: bool,
    open_error: bool,
    /// Backup: the current item has no data. Restore: `DATA` not sent yet.
    no_data: bool,
    acl: Option<Bytes>,
    xattr: Option<Bytes>,
    query_started: bool,
}

impl JobOrchestrator {
    /// Create a builder.
    pub fn builder(plugin: PluginConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(plugin)
    }

    /// Current job facts.
    pub fn job(&self) -> &JobDescriptor {
        &self.job
    }

    /// The plugin configuration.
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Backends started by this job.
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    fn fatal(&self, msg: &str) {
        tracing::error!("{}", msg);
        self.host.job_message(MessageLevel::Fatal, msg);
    }

    fn current_link(&mut self) -> Result<&mut BackendLink> {
        self.registry.current_link().ok_or(BackendError::Closed)
    }

    /// Terminate the current backend when a failure left it fatal.
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::debug!("Operation failed: {}", e);
            if let Some(link) = self.registry.current_link() {
                if link.is_fatal() && !link.is_closed() {
                    let _ = BackendRegistry::terminate_one(link).await;
                }
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Handle one job-lifecycle event.
    pub async fn handle_event(&mut self, event: JobEvent) -> Result<()> {
        tracing::debug!("Event: {:?}", event);
        match event {
            JobEvent::JobStart => {
                if let Some(id) = self
                    .host
                    .get_variable(HostVariable::JobId)
                    .and_then(|v| v.as_int())
                {
                    self.job.job_id = id;
                }
                if let Some(name) = self.host.get_variable(HostVariable::JobName) {
                    self.job.job_name = name.to_wire();
                }
                Ok(())
            }
            JobEvent::JobEnd => self.registry.terminate_all().await,
            JobEvent::Level(c) => {
                self.job.level = Some(BackupLevel::from_char(c)?);
                Ok(())
            }
            JobEvent::Since(since) => {
                self.job.since = Some(since);
                Ok(())
            }
            JobEvent::StartBackupJob | JobEvent::EndBackupJob | JobEvent::EndFileSet => Ok(()),
            JobEvent::StartRestoreJob => {
                let host = &self.host;
                let text = |var| host.get_variable(var).map(|v| v.to_wire());
                self.job.where_ = text(HostVariable::Where);
                self.job.regex_where = text(HostVariable::RegexWhere);
                self.job.replace = text(HostVariable::Replace)
                    .and_then(|r| r.chars().next())
                    .and_then(ReplacePolicy::from_char);
                self.job.mode = JobMode::Restore;
                Ok(())
            }
            JobEvent::EndRestoreJob => self.registry.finish_all().await,
            JobEvent::EstimateCommand(command) => {
                if !self.job.mode.is_estimate() {
                    self.job.mode = JobMode::Estimate;
                }
                self.prepare_backend(JobType::Estimate, &command).await
            }
            JobEvent::BackupCommand(command) => {
                self.restore_object_sent = false;
                self.job.mode = JobMode::Backup(self.job.level.unwrap_or(BackupLevel::Full));
                self.prepare_backend(JobType::Backup, &command).await
            }
            JobEvent::RestoreCommand(command) => {
                self.job.mode = JobMode::Restore;
                self.prepare_backend(JobType::Restore, &command).await
            }
            JobEvent::PluginCommand(command) => {
                if self.config.is_our_command(&command) {
                    if let Some(err) = &self.backend_error {
                        let msg = format!(
                            "Unable to use backend: {} Err={}",
                            self.config.backend.display(),
                            err
                        );
                        self.fatal(&msg);
                        return Err(BackendError::Config(msg));
                    }
                }
                Ok(())
            }
            JobEvent::OptionPlugin(command) => {
                if self.config.is_our_command(&command) {
                    let msg = format!(
                        "The {} plugin doesn't support the Option Plugin configuration. \
                         Please review your FileSet and move the Plugin={}... command into the Include {{}} block.",
                        self.config.name, self.config.prefix
                    );
                    self.fatal(&msg);
                    return Err(BackendError::Config(msg));
                }
                Ok(())
            }
            JobEvent::RestoreObject(object) => self.accept_restore_object(object),
            JobEvent::Cancel => {
                if let Some(link) = self.registry.current_link() {
                    if !link.is_closed() {
                        link.signal_error("CANCEL").await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Attach a user-edited restore configuration to its plugin command.
    fn accept_restore_object(&mut self, object: RestoreObject) -> Result<()> {
        if object.name != RESTORE_OBJECT_NAME {
            tracing::debug!("Ignoring restore object {}", object.name);
            return Ok(());
        }
        tracing::debug!("Restore configuration for: {}", object.command);
        let overlay = match RestoreOverlay::parse(&object.data, &self.config.restore_items) {
            Ok(overlay) => overlay,
            Err(e) => {
                tracing::error!("Restore object parse failed: {}", e);
                self.fatal("Unable to parse user set restore configuration.");
                return Err(e);
            }
        };
        self.registry.switch_to(&object.command).set_overlay(overlay);
        Ok(())
    }

    /// Spawn and prepare the backend for `command`, or reuse a live one.
    async fn prepare_backend(&mut self, job_type: JobType, command: &str) -> Result<()> {
        if !self.config.is_our_command(command) {
            return Ok(());
        }

        if job_type != JobType::Restore && self.registry.contains(command) {
            let msg = format!(
                "Plugin command already defined: \"{}\" Cannot proceed. You should correct FileSet configuration.",
                command
            );
            self.fatal(&msg);
            let _ = self.registry.terminate_all().await;
            return Err(BackendError::Config(msg));
        }

        let parsed = match PluginCommand::parse(command) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fatal("Unable to parse Plugin command line.");
                return Err(e);
            }
        };
        let overlay = self
            .registry
            .iter()
            .find(|e| e.command() == command)
            .and_then(|e| e.overlay().cloned());
        let params = ParamSet::assemble(&parsed, overlay.as_ref());
        if job_type == JobType::Estimate {
            if let Some(mode) = params.mode {
                self.job.mode = mode;
            }
        }
        let start = match job_type {
            JobType::Backup => PhaseStart::Backup,
            JobType::Restore => PhaseStart::Restore,
            JobType::Estimate => match self.job.mode {
                JobMode::Listing | JobMode::Query => PhaseStart::Listing,
                _ => PhaseStart::Estimate,
            },
        };
        let job_info = self
            .job
            .job_info_lines(job_type, self.config.namespace.as_deref());

        let link = match self.registry.resolve(command) {
            Resolution::AlreadyReady => {
                tracing::debug!("Backend already prepared");
                return Ok(());
            }
            Resolution::Fresh(link) | Resolution::Reused(link) => link,
        };
        self.launcher.launch(link, &self.config)?;
        if let Err(e) = phase::prepare_link(link, &self.config, &job_info, &params, start).await {
            link.terminate().await;
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backup loop
    // ------------------------------------------------------------------

    /// Next item to save, or `None` when the backend has nothing more.
    pub async fn start_backup_file(&mut self) -> Result<Option<BackupItem>> {
        let result = self.next_backup_item().await;
        self.settle(result).await
    }

    async fn next_backup_item(&mut self) -> Result<Option<BackupItem>> {
        if self.job.mode == JobMode::Backup(BackupLevel::Full) && !self.restore_object_sent {
            let command = self
                .registry
                .current()
                .map(|e| e.command().to_string())
                .unwrap_or_default();
            tracing::debug!("Prepared restore object");
            return Ok(Some(BackupItem::RestoreObject(RestoreObject {
                command,
                name: RESTORE_OBJECT_NAME.to_string(),
                data: self.config.restore_object_text(),
            })));
        }

        if self.next_item.is_none() {
            self.read_metadata().await?;
        }
        let item = match self.next_item.clone() {
            None => return Ok(None),
            Some(NextItem::File(path)) => {
                let host = self.host.clone();
                let (has_acl, has_xattr) = (self.acl.is_some(), self.xattr.is_some());
                let link = self.current_link()?;
                let mut meta = read_attributes(link, host.as_ref(), path).await?;
                meta.has_acl = has_acl;
                meta.has_xattr = has_xattr;
                BackupItem::File(meta)
            }
            Some(NextItem::PluginObject(path)) => {
                let link = self.current_link()?;
                let object = read_plugin_object(link, path).await?;
                self.plugin_object_sent = true;
                BackupItem::PluginObject(object)
            }
        };

        if self.current_link()?.is_error() {
            return Err(BackendError::Protocol(
                "backend reported an error for this item".to_string(),
            ));
        }
        Ok(Some(item))
    }

    /// Finish the current item and tell whether another follows.
    pub async fn end_backup_file(&mut self) -> Result<ItemStatus> {
        let result = self.finish_backup_item().await;
        self.settle(result).await
    }

    async fn finish_backup_item(&mut self) -> Result<ItemStatus> {
        if self.job.mode == JobMode::Backup(BackupLevel::Full) && !self.restore_object_sent {
            self.restore_object_sent = true;
            return Ok(ItemStatus::More);
        }

        // items without a data phase, or whose data phase failed to open,
        // never reach io_close
        if self.job.mode.is_estimate() || self.plugin_object_sent || self.open_error {
            self.plugin_object_sent = false;
            self.open_error = false;
            self.read_metadata().await?;
        }
        Ok(if self.next_item.is_some() {
            ItemStatus::More
        } else {
            ItemStatus::Done
        })
    }

    /// Read commands until the backend names the next item or sends EOD.
    ///
    /// ACL and XATTR blobs and FileIndex queries are handled on the way.
    /// Blobs left over from the previous item are dropped.
    async fn read_metadata(&mut self) -> Result<()> {
        self.next_item = None;
        // side-channel blobs belong to the item that follows them
        self.acl = None;
        self.xattr = None;
        let host = self.host.clone();
        let link = self.registry.current_link().ok_or(BackendError::Closed)?;
        loop {
            let cmd = match link.read_command().await {
                Ok(Some(cmd)) => cmd,
                Ok(None) => {
                    tracing::debug!("No more files to backup from backend");
                    return Ok(());
                }
                Err(e) if !link.is_fatal() && !link.is_closed() => {
                    tracing::debug!("Skipping backend error: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(path) = cmd.strip_prefix("FNAME:") {
                self.next_item = Some(NextItem::File(path.to_string()));
                return Ok(());
            }
            if let Some(path) = cmd.strip_prefix("PLUGINOBJ:") {
                self.next_item = Some(NextItem::PluginObject(path.to_string()));
                return Ok(());
            }
            match cmd.as_str() {
                "ACL" => match read_blob(link).await {
                    Ok(blob) => self.acl = Some(blob),
                    Err(e) => tracing::error!("Cannot read ACL data from backend: {}", e),
                },
                "XATTR" => match read_blob(link).await {
                    Ok(blob) => self.xattr = Some(blob),
                    Err(e) => tracing::error!("Cannot read XATTR data from backend: {}", e),
                },
                "FileIndex" => {
                    let index = host
                        .get_variable(HostVariable::FileIndex)
                        .and_then(|v| v.as_int())
                        .unwrap_or(0);
                    link.write_command(&format!("{}\n", index)).await?;
                }
                other => {
                    let msg = format!("Protocol error, got unknown command: {}", other);
                    tracing::error!("{}", msg);
                    host.job_message(MessageLevel::Fatal, &msg);
                    return Err(BackendError::Protocol(msg));
                }
            }
        }
    }

    /// ACL blob sent with the last item, consumed once.
    pub fn take_acl(&mut self) -> Option<Bytes> {
        self.acl.take()
    }

    /// XATTR blob sent with the last item, consumed once.
    pub fn take_xattr(&mut self) -> Option<Bytes> {
        self.xattr.take()
    }

    // ------------------------------------------------------------------
    // Data transfer
    // ------------------------------------------------------------------

    /// Open the data phase of the current item.
    pub async fn io_open(&mut self) -> Result<()> {
        let result = self.open_data().await;
        self.settle(result).await
    }

    async fn open_data(&mut self) -> Result<()> {
        match self.job.mode {
            JobMode::Backup(_) => {
                self.no_data = false;
                self.open_error = false;
                let link = self.registry.current_link().ok_or(BackendError::Closed)?;
                let outcome = match link.read_command().await {
                    Ok(Some(cmd)) if cmd == "DATA" => return Ok(()),
                    Ok(None) if link.is_eod() => {
                        self.no_data = true;
                        return Ok(());
                    }
                    Ok(Some(cmd)) => {
                        BackendError::Protocol(format!("expected DATA command, got: {}", cmd))
                    }
                    Ok(None) => BackendError::Closed,
                    Err(e) => e,
                };
                self.open_error = !link.is_fatal();
                Err(outcome)
            }
            JobMode::Restore => {
                self.no_data = true;
                Ok(())
            }
            mode => Err(BackendError::Protocol(format!(
                "data transfer is not available in {:?} mode",
                mode
            ))),
        }
    }

    /// Read backup data into `buf`; 0 means end of data.
    pub async fn io_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.read_item_data(buf).await;
        self.settle(result).await
    }

    async fn read_item_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !matches!(self.job.mode, JobMode::Backup(_)) {
            return Err(BackendError::Protocol("read outside of backup".to_string()));
        }
        if self.no_data {
            return Ok(0);
        }
        self.current_link()?.read_data_fixed(buf).await
    }

    /// Send restore data for the current item.
    pub async fn io_write(&mut self, buf: &[u8]) -> Result<usize> {
        let result = self.write_item_data(buf).await;
        self.settle(result).await
    }

    async fn write_item_data(&mut self, buf: &[u8]) -> Result<usize> {
        if self.job.mode != JobMode::Restore {
            return Err(BackendError::Protocol("write outside of restore".to_string()));
        }
        let send_data = self.no_data;
        let link = self.registry.current_link().ok_or(BackendError::Closed)?;
        if send_data {
            link.write_command("DATA\n").await?;
        }
        self.no_data = false;
        link.write_data(buf).await?;
        Ok(buf.len())
    }

    /// Close the data phase of the current item.
    ///
    /// Backup: fetch the next item's metadata. Restore: acknowledge the end
    /// of data when any was sent.
    pub async fn io_close(&mut self) -> Result<()> {
        let result = self.close_data().await;
        self.settle(result).await
    }

    async fn close_data(&mut self) -> Result<()> {
        match self.job.mode {
            JobMode::Backup(_) => {
                self.current_link()?.close_ext_pipe().await?;
                self.read_metadata().await
            }
            JobMode::Restore => {
                let no_data = self.no_data;
                let link = self.current_link()?;
                // later files go back to Data frames
                link.close_ext_pipe().await?;
                if !no_data {
                    link.send_ack().await?;
                }
                Ok(())
            }
            mode => Err(BackendError::Protocol(format!(
                "data transfer is not available in {:?} mode",
                mode
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Announce a file to restore and get the backend's decision.
    pub async fn create_file(&mut self, item: &ItemMetadata) -> Result<CreateStatus> {
        let result = self.announce_file(item).await;
        self.settle(result).await
    }

    async fn announce_file(&mut self, item: &ItemMetadata) -> Result<CreateStatus> {
        let link = self.current_link()?;
        link.write_command(&format!("FNAME:{}\n", item.path)).await?;
        link.write_command(&render_stat(&item.stat)).await?;
        if let Some(tstamp) = render_tstamp(&item.stat) {
            link.write_command(&tstamp).await?;
        }
        if item.stat.file_type == FileType::Symlink {
            if let Some(target) = &item.link_target {
                link.write_command(&format!("LSTAT:{}\n", target)).await?;
            }
        }
        link.signal_eod().await?;

        let reply = link.read_command().await?;
        tracing::debug!("createFile response: {:?}", reply);
        match reply.as_deref() {
            Some("OK") => Ok(CreateStatus::Extract),
            Some("SKIP") => Ok(CreateStatus::Skip),
            other => {
                let got = other.unwrap_or("EOD");
                let msg = format!("Wrong backend response to create file, got: {}", got);
                tracing::error!("{}", msg);
                link.job_message(link.error_level(), &msg);
                Err(BackendError::Protocol(msg))
            }
        }
    }

    /// Send a restored ACL blob; empty input sends nothing.
    pub async fn restore_acl(&mut self, data: &[u8]) -> Result<()> {
        let result = self.send_blob("ACL\n", data).await;
        self.settle(result).await
    }

    /// Send a restored XATTR blob; empty input sends nothing.
    pub async fn restore_xattr(&mut self, data: &[u8]) -> Result<()> {
        let result = self.send_blob("XATTR\n", data).await;
        self.settle(result).await
    }

    /// Send a restored metadata stream; empty input sends nothing.
    pub async fn restore_metadata(&mut self, data: &[u8]) -> Result<()> {
        let result = self.send_blob("METADATA_STREAM\n", data).await;
        self.settle(result).await
    }

    async fn send_blob(&mut self, command: &str, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let link = self.current_link()?;
        link.write_command(command).await?;
        tracing::debug!("{} {} bytes", command.trim_end(), data.len());
        link.write_data(data).await?;
        link.send_ack().await
    }

    // ------------------------------------------------------------------
    // Query and file checks
    // ------------------------------------------------------------------

    /// One step of an interactive query of `parameter` for `command`.
    ///
    /// The first call starts a backend in query mode; later calls read the
    /// next reply line until the backend sends EOD.
    pub async fn query_parameter(&mut self, command: &str, parameter: &str) -> Result<QueryReply> {
        if !self.query_started {
            self.query_started = true;
            self.job.mode = JobMode::Query;
            let command = format!("{} query={}", command, parameter);
            self.prepare_backend(JobType::Estimate, &command).await?;
        }

        let link = self.current_link()?;
        match link.read_command().await {
            Ok(Some(line)) => Ok(QueryReply::More(
                QueryValue::parse(&line).unwrap_or(QueryValue::List(Vec::new())),
            )),
            Ok(None) => {
                tracing::debug!("Query finished");
                if !link.is_closed() {
                    let _ = link.signal_term().await;
                }
                link.terminate().await;
                Ok(QueryReply::Done)
            }
            Err(e) => {
                let msg = format!(
                    "Cannot read backend query response for {} command.",
                    parameter
                );
                tracing::error!("{}", msg);
                link.job_message(link.error_level(), &msg);
                Err(e)
            }
        }
    }

    /// True when `path` belongs to this plugin, so the host must treat it
    /// as seen instead of deleted.
    pub fn check_file(&self, path: &str) -> bool {
        self.config.is_our_path(path)
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("job", &self.job)
            .field("registry", &self.registry)
            .field("next_item", &self.next_item)
            .finish()
    }
}

async fn read_blob(link: &mut BackendLink) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    link.read_data(&mut buf).await?;
    link.read_ack().await?;
    Ok(buf.freeze())
}

/// Drain `STAT:`/`TSTAMP:`/`LSTAT:`/`PIPE:` lines of one file until EOD.
async fn read_attributes(link: &mut BackendLink, host: &dyn Host, path: String) -> Result<ItemMetadata> {
    let mut meta = ItemMetadata::new(path, StatInfo::default());
    let mut required: i32 = 1;

    while let Some(cmd) = link.read_command().await? {
        if let Some(rec) = parse_stat(&cmd) {
            let stat = &mut meta.stat;
            stat.size = rec.size;
            stat.uid = rec.uid;
            stat.gid = rec.gid;
            stat.mode = rec.mode;
            stat.nlink = rec.nlink;
            stat.file_type = match FileType::from_char(rec.type_char) {
                Some(FileType::Directory) => {
                    meta.link_target = Some(meta.path.clone());
                    FileType::Directory
                }
                Some(FileType::Symlink) => {
                    required += 1;
                    FileType::Symlink
                }
                Some(FileType::HardLinkSaved) => match rec.link_fi {
                    Some(fi) => {
                        stat.link_fi = fi;
                        FileType::HardLinkSaved
                    }
                    None => {
                        let msg = format!("Invalid stat packet: {}", cmd);
                        tracing::error!("{}", msg);
                        link.job_message(link.error_level(), &msg);
                        return Err(BackendError::Protocol(msg));
                    }
                },
                Some(other) => other,
                None => {
                    let msg = format!("Invalid file type: {} for {}", rec.type_char, meta.path);
                    tracing::error!("{}", msg);
                    host.job_message(MessageLevel::Error, &msg);
                    FileType::Regular
                }
            };
            required -= 1;
            continue;
        }
        if let Some((atime, mtime, ctime)) = parse_tstamp(&cmd) {
            meta.stat.atime = atime;
            meta.stat.mtime = mtime;
            meta.stat.ctime = ctime;
            continue;
        }
        if let Some(target) = cmd.strip_prefix("LSTAT:") {
            meta.link_target = Some(target.to_string());
            required -= 1;
            continue;
        }
        if let Some(pipe) = cmd.strip_prefix("PIPE:") {
            tracing::debug!("read pipe at: {}", pipe);
            let timeout = link.config().timeout;
            match phase::open_ext_pipe(Path::new(pipe), false, timeout).await {
                Ok(file) => {
                    link.set_ext_pipe(file);
                    link.write_command("OK\n").await?;
                }
                Err(e) => return Err(phase::ext_pipe_failed(link, e).await),
            }
            continue;
        }

        if cmd == METADATA_STREAM {
            match read_blob(link).await {
                Ok(blob) => {
                    tracing::debug!("read METADATA info len: {}", blob.len());
                    meta.metadata.push(blob);
                }
                Err(e) => {
                    let msg = "Cannot read metadata stream from backend.";
                    tracing::error!("{} {}", msg, e);
                    link.job_message(link.error_level(), msg);
                    return Err(e);
                }
            }
            continue;
        }

        let msg = format!("Invalid File Attributes command: {}", cmd);
        tracing::error!("{}", msg);
        link.job_message(link.error_level(), &msg);
        return Err(BackendError::Protocol(msg));
    }

    if required > 0 {
        let msg = "Protocol error, not enough file attributes from backend.";
        tracing::error!("{}", msg);
        host.job_message(MessageLevel::Fatal, msg);
        return Err(BackendError::Protocol(msg.to_string()));
    }
    Ok(meta)
}

/// Drain the `PLUGINOBJ_*` fields of one plugin object until EOD.
async fn read_plugin_object(link: &mut BackendLink, path: String) -> Result<PluginObject> {
    let mut object = PluginObject {
        path,
        ..Default::default()
    };
    while let Some(cmd) = link.read_command().await? {
        let field = |prefix: &str| cmd.strip_prefix(prefix).map(str::to_string);
        if let Some(v) = field("PLUGINOBJ_CAT:") {
            object.category = Some(v);
        } else if let Some(v) = field("PLUGINOBJ_TYPE:") {
            object.object_type = Some(v);
        } else if let Some(v) = field("PLUGINOBJ_NAME:") {
            object.name = Some(v);
        } else if let Some(v) = field("PLUGINOBJ_SRC:") {
            object.source = Some(v);
        } else if let Some(v) = field("PLUGINOBJ_UUID:") {
            object.uuid = Some(v);
        } else if let Some(v) = field("PLUGINOBJ_SIZE:") {
            object.size = match v.trim().parse() {
                Ok(size) => size,
                Err(_) => {
                    let msg = format!("Cannot convert Plugin Object Size to integer! p={}", v);
                    tracing::error!("{}", msg);
                    link.job_message(MessageLevel::Error, &msg);
                    return Err(BackendError::Protocol(msg));
                }
            };
        } else {
            let msg = format!("Protocol error, got unknown command: {}", cmd);
            tracing::error!("{}", msg);
            link.job_message(MessageLevel::Fatal, &msg);
            return Err(BackendError::Protocol(msg));
        }
    }
    tracing::debug!("No more Plugin Object params from backend");
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ItemKind, RestoreItemSpec};
    use crate::host::HostValue;
    use crate::protocol::FrameKind;
    use crate::testing::{Peer, QueueLauncher, RecordingHost};

    fn config() -> PluginConfig {
        PluginConfig::new("test", "/nonexistent/test-backend")
    }

    fn orchestrator(
        config: PluginConfig,
        host: Arc<RecordingHost>,
        launcher: Arc<QueueLauncher>,
    ) -> JobOrchestrator {
        JobOrchestrator::builder(config)
            .host(host)
            .launcher(launcher)
            .build()
    }

    /// Backend side of handshake, Job Info, Params and the start command.
    async fn prepare(peer: &mut Peer, job_info: &[&str], params: &[&str], start: &str) {
        describe(peer, job_info, params).await;
        peer.expect_command(start).await;
        peer.send(FrameKind::Eod, b"").await;
    }

    /// Backend side of handshake, Job Info and Params.
    async fn describe(peer: &mut Peer, job_info: &[&str], params: &[&str]) {
        peer.expect_command("Hello test 1").await;
        peer.send_command("Hello Bacula\n").await;
        for line in job_info {
            peer.expect_command(line).await;
        }
        peer.ack_block().await;
        peer.expect_command("Params").await;
        for line in params {
            peer.expect_command(line).await;
        }
        peer.ack_block().await;
    }

    async fn end_job(peer: &mut Peer) {
        peer.expect_command("END").await;
        peer.send(FrameKind::Eod, b"").await;
        peer.expect(FrameKind::Terminate, b"").await;
    }

    #[tokio::test]
    async fn test_backup_single_file() {
        let host = RecordingHost::new();
        host.set(HostVariable::JobId, HostValue::Int(7));
        host.set(HostVariable::JobName, HostValue::Str("job1".into()));
        host.set(HostVariable::FileIndex, HostValue::Int(3));
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=job1", "JobID=7", "Type=B", "Level=F"],
                &["vm=alpha"],
                "BackupStart",
            )
            .await;
            peer.send_command("FileIndex\n").await;
            peer.expect_command("3").await;
            peer.send_command("FNAME:/test/vm/alpha.img\n").await;
            peer.send_command("STAT:F 5 0 0 100644 1\n").await;
            peer.send_command("TSTAMP:1 2 3\n").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.send_command("DATA\n").await;
            peer.send(FrameKind::Data, b"hello").await;
            peer.send(FrameKind::Eod, b"").await;
            // no more files
            peer.send(FrameKind::Eod, b"").await;
            end_job(&mut peer).await;
        });

        job.handle_event(JobEvent::JobStart).await.unwrap();
        job.handle_event(JobEvent::Level('F')).await.unwrap();
        job.handle_event(JobEvent::BackupCommand("test: vm=alpha".into()))
            .await
            .unwrap();

        let item = job.start_backup_file().await.unwrap().unwrap();
        assert!(matches!(item, BackupItem::RestoreObject(ref o) if o.name == RESTORE_OBJECT_NAME));
        assert_eq!(job.end_backup_file().await.unwrap(), ItemStatus::More);

        let meta = match job.start_backup_file().await.unwrap() {
            Some(BackupItem::File(meta)) => meta,
            other => panic!("expected a file, got {:?}", other),
        };
        assert_eq!(meta.path, "/test/vm/alpha.img");
        assert_eq!(meta.stat.size, 5);
        assert_eq!(meta.stat.mode, 0o100644);
        assert_eq!((meta.stat.atime, meta.stat.mtime, meta.stat.ctime), (1, 2, 3));

        job.io_open().await.unwrap();
        let mut buf = [0u8; 64];
        let n = job.io_read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(job.io_read(&mut buf).await.unwrap(), 0);
        job.io_close().await.unwrap();
        assert_eq!(job.end_backup_file().await.unwrap(), ItemStatus::Done);

        job.handle_event(JobEvent::JobEnd).await.unwrap();
        backend.await.unwrap();
        assert!(host.messages().is_empty(), "{:?}", host.messages());
    }

    #[tokio::test]
    async fn test_estimate_skips_backend_error() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=E"],
                &["vm=alpha"],
                "EstimateStart",
            )
            .await;
            peer.send(FrameKind::Error, b"cannot stat vm beta\n").await;
            peer.send_command("FNAME:/test/vm/alpha.img\n").await;
            peer.send_command("STAT:E 0 0 0 100644 1\n").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.send(FrameKind::Eod, b"").await;
        });

        job.handle_event(JobEvent::EstimateCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        let meta = match job.start_backup_file().await.unwrap() {
            Some(BackupItem::File(meta)) => meta,
            other => panic!("expected a file, got {:?}", other),
        };
        assert_eq!(meta.stat.file_type, FileType::RegularEmpty);
        assert_eq!(job.end_backup_file().await.unwrap(), ItemStatus::Done);
        backend.await.unwrap();

        assert_eq!(host.count(MessageLevel::Error), 1);
        assert_eq!(host.count(MessageLevel::Fatal), 0);
    }

    #[tokio::test]
    async fn test_acl_exchange() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=E"],
                &["vm=alpha"],
                "EstimateStart",
            )
            .await;
            peer.send_command("ACL\n").await;
            peer.send(FrameKind::Data, b"user::rw-").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.send_command("FNAME:/test/vm/alpha.img\n").await;
            peer.send_command("STAT:F 5 0 0 100644 1\n").await;
            peer.send(FrameKind::Eod, b"").await;

            peer.expect_command("XATTR").await;
            peer.expect(FrameKind::Data, b"user.k=v").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;
        });

        job.handle_event(JobEvent::EstimateCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        assert!(job.start_backup_file().await.unwrap().is_some());
        assert_eq!(job.take_acl().as_deref(), Some(&b"user::rw-"[..]));
        assert_eq!(job.take_acl(), None);
        assert_eq!(job.take_xattr(), None);

        job.restore_acl(b"").await.unwrap();
        job.restore_xattr(b"user.k=v").await.unwrap();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_acl_belongs_to_one_item() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=E"],
                &["vm=alpha"],
                "EstimateStart",
            )
            .await;
            peer.send_command("ACL\n").await;
            peer.send(FrameKind::Data, b"acl-of-a").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.send_command("FNAME:/test/a\n").await;
            peer.send_command("STAT:F 1 0 0 100644 1\n").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.send_command("FNAME:/test/b\n").await;
            peer.send_command("STAT:F 1 0 0 100644 1\n").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.send(FrameKind::Eod, b"").await;
        });

        job.handle_event(JobEvent::EstimateCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        match job.start_backup_file().await.unwrap() {
            Some(BackupItem::File(meta)) => {
                assert_eq!(meta.path, "/test/a");
                assert!(meta.has_acl);
                assert!(!meta.has_xattr);
            }
            other => panic!("expected a file, got {:?}", other),
        }
        // the blob of /test/a is never taken
        assert_eq!(job.end_backup_file().await.unwrap(), ItemStatus::More);

        match job.start_backup_file().await.unwrap() {
            Some(BackupItem::File(meta)) => {
                assert_eq!(meta.path, "/test/b");
                assert!(!meta.has_acl);
            }
            other => panic!("expected a file, got {:?}", other),
        }
        assert_eq!(job.take_acl(), None);
        assert_eq!(job.end_backup_file().await.unwrap(), ItemStatus::Done);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_stream() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=E"],
                &["vm=alpha"],
                "EstimateStart",
            )
            .await;
            peer.send_command("FNAME:/test/a\n").await;
            peer.send_command("STAT:F 1 0 0 100644 1\n").await;
            peer.send_command("METADATA_STREAM\n").await;
            peer.send(FrameKind::Data, b"{\"k\":1}").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.send(FrameKind::Eod, b"").await;

            peer.expect_command("METADATA_STREAM").await;
            peer.expect(FrameKind::Data, b"{\"k\":1}").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;
        });

        job.handle_event(JobEvent::EstimateCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        let meta = match job.start_backup_file().await.unwrap() {
            Some(BackupItem::File(meta)) => meta,
            other => panic!("expected a file, got {:?}", other),
        };
        assert_eq!(meta.metadata, vec![Bytes::from_static(b"{\"k\":1}")]);
        assert_eq!(meta.delta_seq, 0);

        job.restore_metadata(b"").await.unwrap();
        job.restore_metadata(&meta.metadata[0]).await.unwrap();
        backend.await.unwrap();
        assert!(host.messages().is_empty(), "{:?}", host.messages());
    }

    #[tokio::test]
    async fn test_restore_pipe_closed_after_each_file() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("restore.pipe");
        std::fs::write(&pipe, b"").unwrap();
        let pipe_path = pipe.display().to_string();

        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            describe(&mut peer, &["Job", "Name=", "JobID=0", "Type=R"], &["vm=alpha"]).await;
            peer.expect_command("RestoreStart").await;
            peer.send_command(&format!("PIPE:{}\n", pipe_path)).await;
            peer.expect_command("OK").await;

            peer.expect_command("FNAME:/test/a").await;
            peer.expect_command("STAT:F 4 0 0 100644 1 0").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;
            peer.expect_command("DATA").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;

            peer.expect_command("FNAME:/test/b").await;
            peer.expect_command("STAT:F 4 0 0 100644 1 0").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;
            peer.expect_command("DATA").await;
            peer.expect(FrameKind::Data, b"BBBB").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;
        });

        job.handle_event(JobEvent::StartRestoreJob).await.unwrap();
        job.handle_event(JobEvent::RestoreCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        assert!(job.registry().current().unwrap().link().has_ext_pipe());

        let stat = StatInfo {
            size: 4,
            mode: 0o100644,
            nlink: 1,
            ..Default::default()
        };
        for (path, data) in [("/test/a", b"AAAA"), ("/test/b", b"BBBB")] {
            let item = ItemMetadata::new(path, stat);
            assert_eq!(job.create_file(&item).await.unwrap(), CreateStatus::Extract);
            job.io_open().await.unwrap();
            job.io_write(data).await.unwrap();
            job.io_close().await.unwrap();
            assert!(!job.registry().current().unwrap().link().has_ext_pipe());
        }
        backend.await.unwrap();

        assert_eq!(std::fs::read(&pipe).unwrap(), b"AAAA");
        assert!(host.messages().is_empty(), "{:?}", host.messages());
    }

    #[tokio::test]
    async fn test_symlink_without_target() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=E"],
                &["vm=alpha"],
                "EstimateStart",
            )
            .await;
            peer.send_command("FNAME:/test/link\n").await;
            peer.send_command("STAT:S 4 0 0 120777 1\n").await;
            peer.send(FrameKind::Eod, b"").await;
        });

        job.handle_event(JobEvent::EstimateCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        assert!(job.start_backup_file().await.is_err());
        backend.await.unwrap();
        assert_eq!(host.count(MessageLevel::Fatal), 1);
    }

    #[tokio::test]
    async fn test_restore_skip_and_extract() {
        let host = RecordingHost::new();
        host.set(HostVariable::JobId, HostValue::Int(8));
        host.set(HostVariable::JobName, HostValue::Str("restore1".into()));
        host.set(HostVariable::Where, HostValue::Str("/tmp/r".into()));
        host.set(HostVariable::Replace, HostValue::Str("a".into()));
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=restore1", "JobID=8", "Type=R", "Where=/tmp/r", "Replace=a"],
                &["vm=alpha"],
                "RestoreStart",
            )
            .await;
            peer.expect_command("FNAME:/test/vm/skip.img").await;
            peer.expect_command("STAT:F 5 0 0 100644 1 0").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("SKIP\n").await;

            peer.expect_command("FNAME:/test/vm/alpha.img").await;
            peer.expect_command("STAT:F 5 0 0 100644 1 0").await;
            peer.expect_command("TSTAMP:0 10 0").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;

            peer.expect_command("DATA").await;
            peer.expect(FrameKind::Data, b"payload").await;
            peer.expect(FrameKind::Eod, b"").await;
            peer.send_command("OK\n").await;

            peer.expect_command("FINISH").await;
            peer.send(FrameKind::Eod, b"").await;
            end_job(&mut peer).await;
        });

        job.handle_event(JobEvent::JobStart).await.unwrap();
        job.handle_event(JobEvent::StartRestoreJob).await.unwrap();
        assert_eq!(job.job().replace, Some(ReplacePolicy::Always));
        job.handle_event(JobEvent::RestoreCommand("test: vm=alpha".into()))
            .await
            .unwrap();

        let stat = StatInfo {
            size: 5,
            mode: 0o100644,
            nlink: 1,
            ..Default::default()
        };
        let skipped = ItemMetadata::new("/test/vm/skip.img", stat);
        assert_eq!(job.create_file(&skipped).await.unwrap(), CreateStatus::Skip);

        let wanted = ItemMetadata::new("/test/vm/alpha.img", StatInfo { mtime: 10, ..stat });
        assert_eq!(job.create_file(&wanted).await.unwrap(), CreateStatus::Extract);
        job.io_open().await.unwrap();
        assert_eq!(job.io_write(b"payload").await.unwrap(), 7);
        job.io_close().await.unwrap();

        job.handle_event(JobEvent::EndRestoreJob).await.unwrap();
        job.handle_event(JobEvent::JobEnd).await.unwrap();
        backend.await.unwrap();
        assert!(host.messages().is_empty(), "{:?}", host.messages());
    }

    #[tokio::test]
    async fn test_restore_object_overlay() {
        let host = RecordingHost::new();
        let mut config = config();
        config.restore_items = vec![
            RestoreItemSpec::new("vm", ItemKind::Str),
            RestoreItemSpec::new("force", ItemKind::Bool),
        ];
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config, host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=R"],
                &["vm=beta", "force=1"],
                "RestoreStart",
            )
            .await;
        });

        job.handle_event(JobEvent::RestoreObject(RestoreObject {
            command: "test: vm=alpha".into(),
            name: RESTORE_OBJECT_NAME.into(),
            data: "vm=\"beta\"\n# comment\nforce=yes\n".into(),
        }))
        .await
        .unwrap();
        job.handle_event(JobEvent::StartRestoreJob).await.unwrap();
        job.handle_event(JobEvent::RestoreCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        backend.await.unwrap();
        assert_eq!(job.registry().len(), 1);

        let bad = RestoreObject {
            command: "test: vm=gamma".into(),
            name: RESTORE_OBJECT_NAME.into(),
            data: "bogus=1\n".into(),
        };
        assert!(job.handle_event(JobEvent::RestoreObject(bad)).await.is_err());
        assert_eq!(host.count(MessageLevel::Fatal), 1);
    }

    #[tokio::test]
    async fn test_duplicate_command() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=B"],
                &["vm=alpha"],
                "BackupStart",
            )
            .await;
            end_job(&mut peer).await;
        });

        let command = "test: vm=alpha".to_string();
        job.handle_event(JobEvent::BackupCommand(command.clone()))
            .await
            .unwrap();
        let err = job
            .handle_event(JobEvent::BackupCommand(command))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
        backend.await.unwrap();

        assert_eq!(job.registry().len(), 1);
        assert!(job.registry().iter().all(|e| e.link().is_closed()));
        let messages = host.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.starts_with("Plugin command already defined"));
    }

    #[tokio::test]
    async fn test_query() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=E"],
                &["ns=x", "query=namespaces"],
                "ListingStart",
            )
            .await;
            peer.send_command("ns=a,ns=b\n").await;
            peer.send(FrameKind::Eod, b"").await;
            peer.expect(FrameKind::Terminate, b"").await;
        });

        let reply = job.query_parameter("test: ns=x", "namespaces").await.unwrap();
        assert_eq!(
            reply,
            QueryReply::More(QueryValue::List(vec![
                ("ns".into(), "a".into()),
                ("ns".into(), "b".into()),
            ]))
        );
        assert_eq!(job.job().mode, JobMode::Query);
        let reply = job.query_parameter("test: ns=x", "namespaces").await.unwrap();
        assert_eq!(reply, QueryReply::Done);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel() {
        let host = RecordingHost::new();
        let (launcher, mut peers) = QueueLauncher::with_peers(1);
        let mut peer = peers.pop().unwrap();
        let mut job = orchestrator(config(), host.clone(), launcher);

        let backend = tokio::spawn(async move {
            prepare(
                &mut peer,
                &["Job", "Name=", "JobID=0", "Type=E"],
                &["vm=alpha"],
                "EstimateStart",
            )
            .await;
            peer.expect(FrameKind::Error, b"CANCEL").await;
        });

        job.handle_event(JobEvent::EstimateCommand("test: vm=alpha".into()))
            .await
            .unwrap();
        job.handle_event(JobEvent::Cancel).await.unwrap();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_commands_ignored() {
        let host = RecordingHost::new();
        let (launcher, _peers) = QueueLauncher::with_peers(0);
        let mut job = orchestrator(config(), host.clone(), launcher);

        job.handle_event(JobEvent::BackupCommand("other: a=b".into()))
            .await
            .unwrap();
        job.handle_event(JobEvent::PluginCommand("other: a=b".into()))
            .await
            .unwrap();
        assert!(job.registry().is_empty());
        assert!(host.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_backend_and_option_plugin() {
        let host = RecordingHost::new();
        let (launcher, _peers) = QueueLauncher::with_peers(0);
        let mut job = orchestrator(config(), host.clone(), launcher);

        assert!(job
            .handle_event(JobEvent::PluginCommand("test: vm=alpha".into()))
            .await
            .is_err());
        assert!(job
            .handle_event(JobEvent::OptionPlugin("test: vm=alpha".into()))
            .await
            .is_err());
        assert_eq!(host.count(MessageLevel::Fatal), 2);
        assert!(host.messages()[0].1.starts_with("Unable to use backend: /nonexistent/test-backend"));
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let host = RecordingHost::new();
        let (launcher, _peers) = QueueLauncher::with_peers(0);
        let mut job = orchestrator(config(), host, launcher);

        let err = job
            .handle_event(JobEvent::BackupCommand("test: vm=alpha".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
        assert_eq!(job.registry().len(), 1);
        assert!(job.registry().current().unwrap().link().is_closed());
    }

    #[test]
    fn test_check_file() {
        let mut job = JobOrchestrator::builder(config()).build();
        assert!(job.check_file("test:/vm/alpha"));
        assert!(job.check_file("/test:/vm/alpha"));
        assert!(!job.check_file("/etc/passwd"));

        job.config.namespace = Some("@vms".into());
        assert!(job.check_file("/@vms/alpha"));
        assert!(!job.check_file("test:/vm/alpha"));
    }
}
