//! Host facilities consumed by the protocol core.
//!
//! The backup agent embedding this crate exposes two things to it: a job
//! message sink and named job variables. Everything the backend reports
//! through diagnostic frames ends up in [`Host::job_message`].

use std::path::PathBuf;

use crate::protocol::FrameKind;

/// Severity of a user-visible job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageLevel {
    /// Aborts the job.
    Fatal,
    /// Error, the job may continue.
    Error,
    /// Warning.
    Warning,
    /// Informational.
    Info,
    /// Item saved.
    Saved,
    /// Item not saved.
    NotSaved,
    /// Item restored.
    Restored,
    /// Item skipped.
    Skipped,
    /// Operator action required.
    Mount,
    /// Job event.
    Events,
}

impl MessageLevel {
    /// Level a backend message frame is reported at.
    ///
    /// Returns `None` for frame kinds that carry no message.
    pub fn for_frame(kind: FrameKind) -> Option<Self> {
        Some(match kind {
            FrameKind::Error | FrameKind::QueryError => MessageLevel::Error,
            FrameKind::FatalError => MessageLevel::Fatal,
            FrameKind::Warning => MessageLevel::Warning,
            FrameKind::Info => MessageLevel::Info,
            FrameKind::Saved => MessageLevel::Saved,
            FrameKind::NotSaved => MessageLevel::NotSaved,
            FrameKind::Restored => MessageLevel::Restored,
            FrameKind::Skipped => MessageLevel::Skipped,
            FrameKind::Operator => MessageLevel::Mount,
            FrameKind::Event => MessageLevel::Events,
            FrameKind::Command | FrameKind::Data | FrameKind::Eod | FrameKind::Terminate => {
                return None
            }
        })
    }
}

/// Named job variables the host can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostVariable {
    /// Numeric job id.
    JobId,
    /// Unique job name.
    JobName,
    /// Restore destination prefix.
    Where,
    /// Restore path rewrite expression.
    RegexWhere,
    /// Restore replace policy character.
    Replace,
    /// Index of the file currently being processed.
    FileIndex,
}

/// Value of a host variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    /// Integer value.
    Int(i64),
    /// Text value.
    Str(String),
    /// Path value.
    Path(PathBuf),
}

impl HostValue {
    /// Integer view, parsing text if needed.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(v) => Some(*v),
            HostValue::Str(s) => s.trim().parse().ok(),
            HostValue::Path(_) => None,
        }
    }

    /// Text rendering used on the wire.
    pub fn to_wire(&self) -> String {
        match self {
            HostValue::Int(v) => v.to_string(),
            HostValue::Str(s) => s.clone(),
            HostValue::Path(p) => p.display().to_string(),
        }
    }
}

/// Services the embedding backup agent provides.
pub trait Host: Send + Sync {
    /// Emit a user-visible job message.
    fn job_message(&self, level: MessageLevel, message: &str);

    /// Look up a job variable.
    fn get_variable(&self, var: HostVariable) -> Option<HostValue>;

    /// Set a job variable. Returns false when unsupported.
    fn set_variable(&self, _var: HostVariable, _value: HostValue) -> bool {
        false
    }
}

/// Host that forwards job messages to `tracing` and has no variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHost;

impl Host for TracingHost {
    fn job_message(&self, level: MessageLevel, message: &str) {
        match level {
            MessageLevel::Fatal | MessageLevel::Error => {
                tracing::error!(?level, "{}", message)
            }
            MessageLevel::Warning | MessageLevel::NotSaved => {
                tracing::warn!(?level, "{}", message)
            }
            _ => tracing::info!(?level, "{}", message),
        }
    }

    fn get_variable(&self, _var: HostVariable) -> Option<HostValue> {
        None
    }
}
