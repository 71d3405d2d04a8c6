//! Preparation blocks sent to a freshly spawned backend.
//!
//! Handshake, Job Info, Params and the phase start command, each followed by
//! its acknowledgement. A failing step reports a job message naming the
//! command the backend did not accept.

use std::path::Path;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};

use crate::config::PluginConfig;
use crate::error::{BackendError, Result};
use crate::host::MessageLevel;
use crate::link::{BackendLink, LinkState};

use super::params::{is_valid_param, ParamSet};

/// Phase start command sent after Params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStart {
    Backup,
    Estimate,
    Listing,
    Restore,
}

impl PhaseStart {
    pub fn command(self) -> &'static str {
        match self {
            PhaseStart::Backup => "BackupStart\n",
            PhaseStart::Estimate => "EstimateStart\n",
            PhaseStart::Listing => "ListingStart\n",
            PhaseStart::Restore => "RestoreStart\n",
        }
    }
}

/// Run every preparation block on a link that has just been opened.
pub(super) async fn prepare_link(
    link: &mut BackendLink,
    config: &PluginConfig,
    job_info: &[String],
    params: &ParamSet,
    start: PhaseStart,
) -> Result<()> {
    tracing::debug!("Backend handshake...");
    link.handshake(&config.name, &config.api_version).await?;

    tracing::debug!("Job Info...");
    send_job_info(link, job_info).await?;

    if let Some(enabled) = params.abort_on_error {
        link.set_abort_on_error(enabled);
        tracing::debug!("abort_on_error: {}", enabled);
    }
    tracing::debug!("Plugin Params...");
    send_params(link, params, &config.valid_params).await?;

    tracing::debug!("Start {:?}...", start);
    match start {
        PhaseStart::Restore => send_restore_start(link).await?,
        other => send_start(link, other.command()).await?,
    }
    link.set_state(LinkState::InPhase);
    tracing::debug!("Prepare backend done");
    Ok(())
}

fn wrong_response(link: &BackendLink, command: &str) {
    let msg = format!("Wrong backend response to {} command.", command.trim_end());
    tracing::error!("{}", msg);
    link.job_message(link.error_level(), &msg);
}

async fn send_job_info(link: &mut BackendLink, lines: &[String]) -> Result<()> {
    for line in lines {
        link.write_command(line).await?;
    }
    link.signal_eod().await?;
    if let Err(e) = link.read_ack().await {
        wrong_response(link, "Job");
        return Err(e);
    }
    link.set_state(LinkState::JobDescribed);
    Ok(())
}

async fn send_params(link: &mut BackendLink, params: &ParamSet, valid: &[String]) -> Result<()> {
    link.write_command("Params\n").await?;
    for line in &params.lines {
        if !is_valid_param(line, valid) {
            let msg = format!("Unknown parameter {} in Plugin command.", line.trim_end());
            tracing::warn!("{}", msg);
            link.job_message(MessageLevel::Warning, &msg);
        }
        link.write_command(line).await?;
    }
    link.signal_eod().await?;
    if let Err(e) = link.read_ack().await {
        wrong_response(link, "Params");
        return Err(e);
    }
    link.set_state(LinkState::Configured);
    Ok(())
}

async fn send_start(link: &mut BackendLink, command: &str) -> Result<()> {
    link.write_command(command).await?;
    if let Err(e) = link.read_ack().await {
        wrong_response(link, command);
        return Err(e);
    }
    Ok(())
}

/// `RestoreStart`: the backend answers EOD when ready, or `PIPE:<path>` to
/// receive restore data through a file of its own.
async fn send_restore_start(link: &mut BackendLink) -> Result<()> {
    let command = PhaseStart::Restore.command();
    link.write_command(command).await?;
    let reply = match link.read_command().await {
        Ok(reply) => reply,
        Err(e) => {
            wrong_response(link, command);
            return Err(e);
        }
    };
    let Some(reply) = reply else {
        if link.is_eod() {
            return Ok(());
        }
        wrong_response(link, command);
        return Err(BackendError::Protocol(
            "backend terminated instead of starting restore".to_string(),
        ));
    };

    match reply.strip_prefix("PIPE:") {
        Some(path) => {
            tracing::debug!("PIPE:{}", path);
            let timeout = link.config().timeout;
            match open_ext_pipe(Path::new(path), true, timeout).await {
                Ok(file) => {
                    link.set_ext_pipe(file);
                    link.write_command("OK\n").await
                }
                Err(e) => Err(ext_pipe_failed(link, e).await),
            }
        }
        None => {
            wrong_response(link, command);
            Err(BackendError::Protocol(format!(
                "unexpected reply to RestoreStart: {}",
                reply
            )))
        }
    }
}

/// Open a backend-named external pipe, bounded by the link timeout.
pub(super) async fn open_ext_pipe(path: &Path, write: bool, timeout: Duration) -> Result<File> {
    let mut options = OpenOptions::new();
    if write {
        options.write(true);
    } else {
        options.read(true);
    }
    match tokio::time::timeout(timeout, options.open(path)).await {
        Ok(file) => Ok(file?),
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

/// Report a failed external pipe open and tell the backend.
pub(super) async fn ext_pipe_failed(link: &mut BackendLink, err: BackendError) -> BackendError {
    let msg = format!("ExtPIPE file open error! Err={}", err);
    tracing::error!("{}", msg);
    link.job_message(link.error_level(), &msg);
    let _ = link.signal_error("Err\n").await;
    err
}
