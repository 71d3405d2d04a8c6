//! Job descriptor and the Job Info block.

use crate::error::{BackendError, Result};

/// Backup level of the running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupLevel {
    Full,
    Incremental,
    Differential,
}

impl BackupLevel {
    /// Parse the host's level character.
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'F' => Ok(BackupLevel::Full),
            'I' => Ok(BackupLevel::Incremental),
            'D' => Ok(BackupLevel::Differential),
            other => Err(BackendError::Config(format!(
                "unsupported backup level: {}",
                other
            ))),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            BackupLevel::Full => 'F',
            BackupLevel::Incremental => 'I',
            BackupLevel::Differential => 'D',
        }
    }
}

/// What the job is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobMode {
    /// No phase command seen yet.
    #[default]
    Idle,
    Backup(BackupLevel),
    Restore,
    Estimate,
    /// Estimate run as a listing of backend objects.
    Listing,
    /// Estimate run as an interactive parameter query.
    Query,
}

impl JobMode {
    /// True for the estimate family (plain, listing and query).
    pub fn is_estimate(self) -> bool {
        matches!(self, JobMode::Estimate | JobMode::Listing | JobMode::Query)
    }
}

/// Job type announced in the `Type=` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Backup,
    Estimate,
    Restore,
}

impl JobType {
    pub fn as_char(self) -> char {
        match self {
            JobType::Backup => 'B',
            JobType::Estimate => 'E',
            JobType::Restore => 'R',
        }
    }
}

/// Restore replace policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePolicy {
    Always,
    IfNewer,
    IfOlder,
    Never,
}

impl ReplacePolicy {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'a' => Some(ReplacePolicy::Always),
            'w' => Some(ReplacePolicy::IfNewer),
            'o' => Some(ReplacePolicy::IfOlder),
            'n' => Some(ReplacePolicy::Never),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            ReplacePolicy::Always => 'a',
            ReplacePolicy::IfNewer => 'w',
            ReplacePolicy::IfOlder => 'o',
            ReplacePolicy::Never => 'n',
        }
    }
}

/// Per-job facts sent to every backend in the Job Info block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobDescriptor {
    pub job_id: i64,
    pub job_name: String,
    /// Level reported by the host, if any.
    pub level: Option<BackupLevel>,
    /// Reference time for incremental/differential levels.
    pub since: Option<i64>,
    pub mode: JobMode,
    pub where_: Option<String>,
    pub regex_where: Option<String>,
    pub replace: Option<ReplacePolicy>,
}

impl JobDescriptor {
    /// Command lines of the Job Info block, each ending in a newline.
    ///
    /// `Level=` is only sent outside restores; `Namespace=` only when the
    /// plugin uses a custom namespace.
    pub fn job_info_lines(&self, job_type: JobType, namespace: Option<&str>) -> Vec<String> {
        let mut lines = vec![
            "Job\n".to_string(),
            format!("Name={}\n", self.job_name),
            format!("JobID={}\n", self.job_id),
            format!("Type={}\n", job_type.as_char()),
        ];
        if self.mode != JobMode::Restore {
            if let Some(level) = self.level {
                lines.push(format!("Level={}\n", level.as_char()));
            }
        }
        if let Some(since) = self.since.filter(|s| *s != 0) {
            lines.push(format!("Since={}\n", since));
        }
        if let Some(where_) = self.where_.as_deref().filter(|w| !w.is_empty()) {
            lines.push(format!("Where={}\n", where_));
        }
        if let Some(regex) = self.regex_where.as_deref().filter(|r| !r.is_empty()) {
            lines.push(format!("RegexWhere={}\n", regex));
        }
        if let Some(replace) = self.replace {
            lines.push(format!("Replace={}\n", replace.as_char()));
        }
        if let Some(ns) = namespace {
            lines.push(format!("Namespace={}\n", ns));
        }
        lines
    }
}
