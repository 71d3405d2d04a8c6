//! Subprocess pipe transport.
//!
//! Owns the three standard descriptors of a backend process and performs
//! "write exactly N bytes" / "read exactly N bytes" with one shared timeout
//! per call. The stderr channel is watched during every call: anything the
//! backend prints there is captured for the caller to report, but does not
//! end the call by itself.
//!
//! # Example
//!
//! ```ignore
//! use backend_wire::transport::PipeTransport;
//! use std::time::Duration;
//!
//! let mut transport = PipeTransport::spawn(
//!     "/opt/bacula/bin/backend".as_ref(),
//!     &[],
//!     Duration::from_secs(300),
//! )?;
//! transport.send_all(b"C000006\nHello\n").await?;
//! ```

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::error::{BackendError, Result};

/// Default timeout for a single send or receive call (300 s).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default time a backend gets to exit after its stdin is closed.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Size of the stderr read buffer.
const STDERR_BUF_SIZE: usize = 4096;

/// Boxed read half.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Pipe transport to one backend process.
pub struct PipeTransport {
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
    stderr: Option<BoxedReader>,
    child: Option<Child>,
    timeout: Duration,
    terminate_grace: Duration,
    /// Error-channel text captured since the last `take_stderr`.
    stderr_text: Vec<String>,
}

impl PipeTransport {
    /// Spawn `program` with piped stdio.
    ///
    /// The child is killed if the transport is dropped while it is alive.
    pub fn spawn(program: &Path, args: &[String], timeout: Duration) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                command: program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(BackendError::Closed)?;
        let stdout = child.stdout.take().ok_or(BackendError::Closed)?;
        let stderr = child.stderr.take().map(|e| Box::new(e) as BoxedReader);

        tracing::debug!(
            "Spawned backend {} pid={:?}",
            program.display(),
            child.id()
        );

        let mut transport = Self::from_parts(Box::new(stdout), Box::new(stdin), stderr, timeout);
        transport.child = Some(child);
        Ok(transport)
    }

    /// Build a transport over arbitrary streams (no process attached).
    pub fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        stderr: Option<BoxedReader>,
        timeout: Duration,
    ) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
            stderr,
            child: None,
            timeout,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            stderr_text: Vec::new(),
        }
    }

    /// Set the grace period used by [`terminate`](Self::terminate).
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Configured per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// OS process id of the backend, if one was spawned and is still tracked.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// True once the descriptors have been released.
    pub fn is_closed(&self) -> bool {
        self.reader.is_none() || self.writer.is_none()
    }

    /// Drain error-channel text captured during previous calls.
    pub fn take_stderr(&mut self) -> Vec<String> {
        std::mem::take(&mut self.stderr_text)
    }

    /// Write all of `data` before the shared timeout elapses.
    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        let writer = self.writer.as_mut().ok_or(BackendError::Closed)?;
        let stderr = &mut self.stderr;
        let captured = &mut self.stderr_text;
        let mut errbuf = [0u8; STDERR_BUF_SIZE];
        let mut written = 0;

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        while written < data.len() {
            tokio::select! {
                _ = &mut sleep => {
                    tracing::error!("Backend write timeout={:?}", timeout);
                    return Err(BackendError::Timeout(timeout));
                }
                r = read_side_channel(stderr, &mut errbuf) => {
                    capture_side_channel(stderr, captured, r, &errbuf);
                }
                r = writer.write(&data[written..]) => {
                    let n = r?;
                    if n == 0 {
                        return Err(BackendError::ConnectionClosed);
                    }
                    written += n;
                }
            }
        }
        writer.flush().await?;
        Ok(())
    }

    /// Fill `buf` completely before the shared timeout elapses.
    ///
    /// End of stream on the data descriptor is reported as
    /// [`BackendError::ConnectionClosed`].
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        let reader = self.reader.as_mut().ok_or(BackendError::Closed)?;
        let stderr = &mut self.stderr;
        let captured = &mut self.stderr_text;
        let mut errbuf = [0u8; STDERR_BUF_SIZE];
        let mut filled = 0;

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        while filled < buf.len() {
            tokio::select! {
                _ = &mut sleep => {
                    tracing::error!("Backend read timeout={:?}", timeout);
                    return Err(BackendError::Timeout(timeout));
                }
                r = read_side_channel(stderr, &mut errbuf) => {
                    capture_side_channel(stderr, captured, r, &errbuf);
                }
                r = reader.read(&mut buf[filled..]) => {
                    let n = r?;
                    if n == 0 {
                        tracing::error!("Backend closed the connection");
                        return Err(BackendError::ConnectionClosed);
                    }
                    filled += n;
                }
            }
        }
        Ok(())
    }

    /// Release all descriptors and reap the backend.
    ///
    /// Closing stdin is the backend's cue to exit; a backend still alive after
    /// the grace period is killed. Safe to call on a closed transport.
    pub async fn terminate(&mut self) -> Option<ExitStatus> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.reader = None;
        self.stderr = None;

        let mut child = self.child.take()?;
        match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("Backend exited with {}", status);
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for backend: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!("Backend did not exit in {:?}, killing", self.terminate_grace);
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Cannot kill backend: {}", e);
                }
                child.wait().await.ok()
            }
        }
    }
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("closed", &self.is_closed())
            .field("pid", &self.pid())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Read from the error channel, or never complete when there is none.
async fn read_side_channel(
    stderr: &mut Option<BoxedReader>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match stderr {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

fn capture_side_channel(
    stderr: &mut Option<BoxedReader>,
    captured: &mut Vec<String>,
    result: std::io::Result<usize>,
    buf: &[u8],
) {
    match result {
        Ok(0) => {
            // backend closed stderr, stop watching it
            *stderr = None;
        }
        Ok(n) => {
            let text = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
            tracing::error!("Backend reported error: {}", text);
            captured.push(text);
        }
        Err(e) => {
            tracing::error!("Read error on backend error channel: {}", e);
            captured.push(format!("read error on error channel: {}", e));
            *stderr = None;
        }
    }
}
