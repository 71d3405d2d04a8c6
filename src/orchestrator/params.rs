//! Plugin command parsing and Parameter List assembly.
//!
//! A plugin command looks like `name: key=value flag key2="quoted value"`.
//! The name ends at the first `:`; the rest is a whitespace separated list of
//! `key[=value]` arguments.

use crate::config::RestoreOverlay;
use crate::error::{BackendError, Result};

use super::job::JobMode;

/// A parsed plugin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommand {
    pub plugin: String,
    pub args: Vec<(String, Option<String>)>,
}

impl PluginCommand {
    /// Parse a plugin command line.
    pub fn parse(command: &str) -> Result<Self> {
        let invalid = || BackendError::Config("Unable to parse Plugin command line.".to_string());
        let command = command.trim();
        let (plugin, rest) = command.split_once(':').unwrap_or((command, ""));
        let plugin = plugin.trim();
        if plugin.is_empty() {
            return Err(invalid());
        }

        let mut args = Vec::new();
        for token in tokenize(rest).ok_or_else(invalid)? {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (token, None),
            };
            if key.is_empty() {
                return Err(invalid());
            }
            args.push((key, value));
        }
        Ok(Self {
            plugin: plugin.to_string(),
            args,
        })
    }
}

/// Split on whitespace, honouring double quotes. `None` on an unterminated
/// quote.
fn tokenize(text: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if quoted {
        return None;
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

/// Parameters for one backend plus the switches found among them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSet {
    /// `key=value\n` lines in send order.
    pub lines: Vec<String>,
    /// Value of an `abort_on_error` argument, if present.
    pub abort_on_error: Option<bool>,
    /// Listing or Query mode requested by the command.
    pub mode: Option<JobMode>,
}

impl ParamSet {
    /// Build the Parameter List from the command arguments and an optional
    /// restore overlay. Overlay values replace same-named arguments; overlay
    /// items the command does not mention are appended.
    pub fn assemble(command: &PluginCommand, overlay: Option<&RestoreOverlay>) -> Self {
        let mut set = ParamSet::default();

        for (key, value) in &command.args {
            let line = match overlay.and_then(|o| o.get(key)) {
                Some(v) => {
                    tracing::debug!("Parameter {} found in restore parameters", key);
                    format!("{}={}\n", key, v.render())
                }
                None => format!("{}={}\n", key, value.as_deref().unwrap_or("1")),
            };
            set.lines.push(line);

            if key.eq_ignore_ascii_case("abort_on_error") {
                set.abort_on_error = Some(!value.as_deref().map_or(false, |v| v.starts_with('0')));
            }
            if key.eq_ignore_ascii_case("listing") && value.is_some() {
                set.mode = Some(JobMode::Listing);
            }
            if key.eq_ignore_ascii_case("query") && value.is_some() {
                set.mode = Some(JobMode::Query);
            }
        }

        if let Some(overlay) = overlay {
            for (key, value) in overlay.iter() {
                let present = command
                    .args
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case(key));
                if !present {
                    tracing::debug!("Parameter {} from restore parameters", key);
                    set.lines.push(format!("{}={}\n", key, value.render()));
                }
            }
        }
        set
    }
}

/// True when `line` starts with one of `valid` (case-insensitive). An empty
/// allow-list accepts everything.
pub fn is_valid_param(line: &str, valid: &[String]) -> bool {
    valid.is_empty()
        || valid.iter().any(|v| {
            line.len() >= v.len() && line.as_bytes()[..v.len()].eq_ignore_ascii_case(v.as_bytes())
        })
}
