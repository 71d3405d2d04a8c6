//! Backend registry - one link per distinct plugin command string.
//!
//! Entries are keyed by exact command string equality and kept in insertion
//! order, which is also the order of job-wide broadcasts such as
//! [`BackendRegistry::finish_all`] and [`BackendRegistry::terminate_all`].
//! Dropping the registry drops every link, and with it kills any backend
//! process still alive.
//!
//! # Example
//!
//! ```ignore
//! use backend_wire::registry::{BackendRegistry, Resolution};
//!
//! let mut registry = BackendRegistry::new(host, LinkConfig::default());
//! match registry.resolve("myplugin: path=/data") {
//!     Resolution::Fresh(link) | Resolution::Reused(link) => { /* spawn + prepare */ }
//!     Resolution::AlreadyReady => { /* skip preparation */ }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::RestoreOverlay;
use crate::error::{BackendError, Result};
use crate::host::Host;
use crate::link::{BackendLink, LinkConfig};

/// Boxed future for per-link broadcast operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of looking up a command in the registry.
#[derive(Debug)]
pub enum Resolution<'a> {
    /// New entry; the link is closed and must be spawned and prepared.
    Fresh(&'a mut BackendLink),
    /// Existing entry whose backend is gone; prepare it again.
    Reused(&'a mut BackendLink),
    /// Existing entry with a live backend; skip preparation.
    AlreadyReady,
}

/// One registry entry.
#[derive(Debug)]
pub struct RegistryEntry {
    command: String,
    link: BackendLink,
    overlay: Option<RestoreOverlay>,
}

impl RegistryEntry {
    /// Plugin command string this entry is keyed by.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The entry's link.
    pub fn link(&self) -> &BackendLink {
        &self.link
    }

    /// The entry's link, mutably.
    pub fn link_mut(&mut self) -> &mut BackendLink {
        &mut self.link
    }

    /// Restore configuration overlay attached to this command.
    pub fn overlay(&self) -> Option<&RestoreOverlay> {
        self.overlay.as_ref()
    }

    /// Attach a restore configuration overlay.
    pub fn set_overlay(&mut self, overlay: RestoreOverlay) {
        self.overlay = Some(overlay);
    }
}

/// Insertion-ordered map from command string to backend link.
pub struct BackendRegistry {
    host: Arc<dyn Host>,
    config: LinkConfig,
    entries: Vec<RegistryEntry>,
    current: Option<usize>,
}

impl BackendRegistry {
    /// Create an empty registry; new links share `host` and `config`.
    pub fn new(host: Arc<dyn Host>, config: LinkConfig) -> Self {
        Self {
            host,
            config,
            entries: Vec::new(),
            current: None,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no command was registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `command` already has an entry.
    pub fn contains(&self, command: &str) -> bool {
        self.position(command).is_some()
    }

    fn position(&self, command: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.command == command)
    }

    /// Select the entry for `command`, creating it if missing.
    pub fn switch_to(&mut self, command: &str) -> &mut RegistryEntry {
        let idx = match self.position(command) {
            Some(idx) => idx,
            None => {
                tracing::debug!("New backend entry for command: {}", command);
                self.entries.push(RegistryEntry {
                    command: command.to_string(),
                    link: BackendLink::new(self.host.clone(), self.config.clone()),
                    overlay: None,
                });
                self.entries.len() - 1
            }
        };
        self.current = Some(idx);
        &mut self.entries[idx]
    }

    /// Select `command` and report whether its backend needs preparation.
    pub fn resolve(&mut self, command: &str) -> Resolution<'_> {
        let existed = self.contains(command);
        let entry = self.switch_to(command);
        if !existed {
            Resolution::Fresh(&mut entry.link)
        } else if entry.link.is_closed() {
            Resolution::Reused(&mut entry.link)
        } else {
            Resolution::AlreadyReady
        }
    }

    /// Currently selected entry.
    pub fn current(&self) -> Option<&RegistryEntry> {
        self.current.and_then(|idx| self.entries.get(idx))
    }

    /// Currently selected entry, mutably.
    pub fn current_mut(&mut self) -> Option<&mut RegistryEntry> {
        self.current.and_then(|idx| self.entries.get_mut(idx))
    }

    /// Link of the currently selected entry.
    pub fn current_link(&mut self) -> Option<&mut BackendLink> {
        self.current_mut().map(|e| &mut e.link)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    /// Run `f` on every link in insertion order.
    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut BackendLink),
    {
        for entry in &mut self.entries {
            f(&mut entry.link);
        }
    }

    /// Run `f` on every link without stopping at failures.
    ///
    /// Returns the last failure seen, or `Ok` when every call succeeded.
    pub async fn for_each_with_status<F>(&mut self, mut f: F) -> Result<()>
    where
        F: for<'l> FnMut(&'l mut BackendLink) -> BoxFuture<'l, Result<()>>,
    {
        let mut status = Ok(());
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            self.current = Some(idx);
            if let Err(e) = f(&mut entry.link).await {
                tracing::debug!("Backend {} failed: {}", entry.command, e);
                status = Err(e);
            }
        }
        status
    }

    /// Graceful end-of-job exchange with one backend, then close it.
    ///
    /// `END` is best-effort: a failed exchange is reported and the backend is
    /// closed anyway. A closed link is left alone.
    pub async fn terminate_one(link: &mut BackendLink) -> Result<()> {
        if link.is_closed() {
            return Ok(());
        }
        let mut status = Ok(());
        match link.write_command("END\n").await {
            Err(e) => status = Err(e),
            Ok(()) => {
                if let Err(e) = link.read_ack().await {
                    let msg = "Wrong backend response to JobEnd command.";
                    tracing::error!("{} {}", msg, e);
                    link.job_message(link.error_level(), msg);
                    status = Err(e);
                }
                // the backend may already be gone after a failed ack
                if !link.is_closed() {
                    let _ = link.signal_term().await;
                }
            }
        }
        tracing::debug!("Terminate backend");
        link.terminate().await;
        status
    }

    /// Terminate the currently selected backend.
    pub async fn terminate_current(&mut self) -> Result<()> {
        match self.current_link() {
            Some(link) => Self::terminate_one(link).await,
            None => Ok(()),
        }
    }

    /// Terminate every backend, continuing past failures.
    pub async fn terminate_all(&mut self) -> Result<()> {
        self.for_each_with_status(terminate_boxed).await
    }

    /// Send `FINISH` to every backend and collect the acknowledgements.
    pub async fn finish_all(&mut self) -> Result<()> {
        self.for_each_with_status(finish_boxed).await
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("entries", &self.entries)
            .field("current", &self.current)
            .finish()
    }
}

fn terminate_boxed(link: &mut BackendLink) -> BoxFuture<'_, Result<()>> {
    Box::pin(BackendRegistry::terminate_one(link))
}

fn finish_boxed(link: &mut BackendLink) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        if link.is_closed() {
            return Err(BackendError::Closed);
        }
        link.write_command("FINISH\n").await?;
        link.read_ack().await
    })
}
