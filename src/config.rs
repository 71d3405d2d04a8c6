//! Plugin configuration and the restore configuration overlay.
//!
//! [`PluginConfig`] describes one backend-driven plugin: its handshake name,
//! the command prefix it claims, the backend executable and the typed schema
//! of user-editable restore options. The schema is what a Full backup saves as
//! its restore object and what a restore parses back into a
//! [`RestoreOverlay`].
//!
//! # Example
//!
//! ```ignore
//! use backend_wire::config::PluginConfig;
//!
//! let config = PluginConfig::from_json(r#"{
//!     "name": "docker",
//!     "prefix": "docker:",
//!     "backend": "/opt/bacula/bin/docker-backend",
//!     "valid_params": ["container", "image", "abort_on_error"]
//! }"#)?;
//! assert!(config.is_our_command("docker: container=web"));
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Default handshake plugin name.
pub const DEFAULT_PLUGIN_NAME: &str = "backend";

/// Default protocol API version sent in the handshake.
pub const DEFAULT_API_VERSION: &str = "1";

/// Name under which the restore options object is saved.
pub const RESTORE_OBJECT_NAME: &str = "RestoreOptions";

/// Static description of a backend-driven plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Plugin name announced in the handshake.
    pub name: String,
    /// Protocol API version announced in the handshake.
    pub api_version: String,
    /// Command prefix; commands not starting with it belong to someone else.
    pub prefix: String,
    /// Custom namespace for saved paths, replacing `prefix`.
    pub namespace: Option<String>,
    /// Backend executable.
    pub backend: PathBuf,
    /// Extra arguments passed to the backend.
    pub backend_args: Vec<String>,
    /// Parameter names the backend understands, matched case-insensitively
    /// as prefixes. Empty means no checking.
    pub valid_params: Vec<String>,
    /// Schema of the user-editable restore options.
    pub restore_items: Vec<RestoreItemSpec>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PLUGIN_NAME.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            prefix: format!("{}:", DEFAULT_PLUGIN_NAME),
            namespace: None,
            backend: PathBuf::new(),
            backend_args: Vec::new(),
            valid_params: Vec::new(),
            restore_items: Vec::new(),
        }
    }
}

impl PluginConfig {
    /// Create a configuration for plugin `name` with prefix `name:`.
    pub fn new(name: &str, backend: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            prefix: format!("{}:", name),
            backend: backend.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| BackendError::Config(format!("Invalid plugin configuration: {}", e)))
    }

    /// True when `command` is addressed to this plugin.
    pub fn is_our_command(&self, command: &str) -> bool {
        command.starts_with(&self.prefix)
    }

    /// True when `path` lies in this plugin's namespace, with or without a
    /// leading slash.
    pub fn is_our_path(&self, path: &str) -> bool {
        let ns = self.namespace.as_deref().unwrap_or(&self.prefix);
        if ns.is_empty() {
            return false;
        }
        path.starts_with(ns) || path.strip_prefix('/').map_or(false, |p| p.starts_with(ns))
    }

    /// Check that the backend can be executed.
    ///
    /// Returns the reason when it cannot.
    pub fn backend_available(&self) -> std::result::Result<(), String> {
        let meta = std::fs::metadata(&self.backend).map_err(|e| e.to_string())?;
        if !meta.is_file() {
            return Err("not a regular file".to_string());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err("Permission denied".to_string());
            }
        }
        Ok(())
    }

    /// Overlay holding every restore item that has a default value.
    pub fn default_overlay(&self) -> RestoreOverlay {
        RestoreOverlay {
            entries: self
                .restore_items
                .iter()
                .filter_map(|spec| spec.default.clone().map(|v| (spec.name.clone(), v)))
                .collect(),
        }
    }

    /// Serialized restore options saved as the restore object of a Full
    /// backup. Items without a default are listed as comments so the user
    /// can fill them in at restore time.
    pub fn restore_object_text(&self) -> String {
        let mut out = String::new();
        for spec in &self.restore_items {
            match &spec.default {
                Some(value) => out.push_str(&format!("{}={}\n", spec.name, value.quoted())),
                None => out.push_str(&format!("# {}=\n", spec.name)),
            }
        }
        out
    }
}

/// Value type of a restore item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Free text.
    Str,
    /// Signed integer.
    Int,
    /// Boolean.
    Bool,
}

/// Typed restore item value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ItemValue {
    /// Parse `text` as a value of `kind`.
    pub fn parse(kind: ItemKind, text: &str) -> Option<Self> {
        match kind {
            ItemKind::Str => Some(ItemValue::Str(text.to_string())),
            ItemKind::Int => text.parse().ok().map(ItemValue::Int),
            ItemKind::Bool => match text.to_ascii_lowercase().as_str() {
                "1" | "yes" | "true" | "on" => Some(ItemValue::Bool(true)),
                "0" | "no" | "false" | "off" => Some(ItemValue::Bool(false)),
                _ => None,
            },
        }
    }

    /// Rendering used in `key=value` parameter lines; booleans are `1`/`0`.
    pub fn render(&self) -> String {
        match self {
            ItemValue::Bool(b) => u8::from(*b).to_string(),
            ItemValue::Int(v) => v.to_string(),
            ItemValue::Str(s) => s.clone(),
        }
    }

    fn quoted(&self) -> String {
        match self {
            ItemValue::Str(s) => format!("\"{}\"", s),
            other => other.render(),
        }
    }
}

/// One entry of the restore options schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreItemSpec {
    pub name: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub default: Option<ItemValue>,
}

impl RestoreItemSpec {
    pub fn new(name: &str, kind: ItemKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: None,
        }
    }

    pub fn with_default(mut self, value: ItemValue) -> Self {
        self.default = Some(value);
        self
    }
}

/// User-set restore options for one plugin command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOverlay {
    entries: Vec<(String, ItemValue)>,
}

impl RestoreOverlay {
    /// Parse `key=value` lines typed by `specs`.
    ///
    /// Blank lines and `#` comments are ignored; values may be double
    /// quoted. Unknown keys and values of the wrong type are rejected.
    pub fn parse(text: &str, specs: &[RestoreItemSpec]) -> Result<Self> {
        let mut entries: Vec<(String, ItemValue)> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                BackendError::Config(format!("line {}: expected key=value", lineno + 1))
            })?;
            let key = key.trim();
            let value = unquote(value.trim());
            let spec = specs
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(key))
                .ok_or_else(|| {
                    BackendError::Config(format!("line {}: unknown item {}", lineno + 1, key))
                })?;
            let value = ItemValue::parse(spec.kind, value).ok_or_else(|| {
                BackendError::Config(format!(
                    "line {}: invalid {:?} value for {}",
                    lineno + 1,
                    spec.kind,
                    key
                ))
            })?;
            match entries.iter_mut().find(|(k, _)| *k == spec.name) {
                Some(entry) => entry.1 = value,
                None => entries.push((spec.name.clone(), value)),
            }
        }
        Ok(Self { entries })
    }

    /// Value of `key`, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&ItemValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Entries in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ItemValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
