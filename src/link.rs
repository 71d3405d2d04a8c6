//! Backend link - one protocol session with one backend process.
//!
//! Implements the command/data/ack/EOD/terminate vocabulary on top of
//! [`PipeTransport`]. Every read starts with the header loop: diagnostic
//! frames are reported to the [`Host`] and skipped, `E`/`A` frames set the
//! sticky error flags and fail the read, and `F`/`T` end the exchange.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use backend_wire::{BackendLink, LinkConfig, TracingHost};
//!
//! let mut link = BackendLink::new(Arc::new(TracingHost), LinkConfig::default());
//! link.open("/opt/bacula/bin/backend".as_ref(), &[])?;
//! link.handshake("mybackend", "3").await?;
//! link.write_command("Job\n").await?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{BackendError, Result};
use crate::host::{Host, MessageLevel};
use crate::protocol::{
    ascii_preview, build_frame, decode_header, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use crate::transport::{PipeTransport, DEFAULT_TERMINATE_GRACE, DEFAULT_TIMEOUT};

/// Literal reply a backend must send to the handshake.
pub const HANDSHAKE_REPLY: &str = "Hello Bacula";

/// Read size used when bulk data comes from an external pipe.
const EXT_PIPE_CHUNK: usize = 64 * 1024;

/// Per-link transport settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Shared timeout for each send or receive call.
    pub timeout: Duration,
    /// How long a backend may take to exit once its stdin is closed.
    pub terminate_grace: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

impl LinkConfig {
    /// Set the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the exit grace period.
    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }
}

/// Protocol progress of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkState {
    /// No live backend.
    Closed,
    /// Process spawned, handshake pending.
    Open,
    /// Handshake done.
    Ready,
    /// Job Info accepted.
    JobDescribed,
    /// Params accepted.
    Configured,
    /// Phase started; per-item exchanges in progress.
    InPhase,
}

/// Outcome of reading one header in the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    Payload(usize),
    Eod,
    Terminated,
}

/// Protocol session with one backend process.
pub struct BackendLink {
    host: Arc<dyn Host>,
    config: LinkConfig,
    transport: Option<PipeTransport>,
    state: LinkState,
    eod: bool,
    error: bool,
    fatal: bool,
    abort_on_error: bool,
    /// A fixed-size read left part of a Data payload unread.
    cont: bool,
    remaining: usize,
    ext_pipe: Option<File>,
    last_error: Option<String>,
}

impl BackendLink {
    /// Create a closed link.
    pub fn new(host: Arc<dyn Host>, config: LinkConfig) -> Self {
        Self {
            host,
            config,
            transport: None,
            state: LinkState::Closed,
            eod: false,
            error: false,
            fatal: false,
            abort_on_error: false,
            cont: false,
            remaining: 0,
            ext_pipe: None,
            last_error: None,
        }
    }

    /// Spawn the backend executable and attach its pipes.
    pub fn open(&mut self, program: &Path, args: &[String]) -> Result<()> {
        match PipeTransport::spawn(program, args, self.config.timeout) {
            Ok(transport) => {
                self.attach(transport.with_terminate_grace(self.config.terminate_grace));
                Ok(())
            }
            Err(e) => {
                self.error = true;
                self.fatal = true;
                self.host.job_message(MessageLevel::Fatal, &e.to_string());
                Err(e)
            }
        }
    }

    /// Attach an already-connected transport.
    pub fn attach(&mut self, transport: PipeTransport) {
        self.transport = Some(transport);
        self.state = LinkState::Open;
        self.eod = false;
        self.error = false;
        self.fatal = false;
        self.cont = false;
        self.remaining = 0;
        self.last_error = None;
    }

    /// Current protocol progress.
    pub fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        if !self.is_closed() {
            self.state = state;
        }
    }

    /// True when no live backend is attached.
    pub fn is_closed(&self) -> bool {
        self.transport.as_ref().map_or(true, |t| t.is_closed())
    }

    /// True when the last read ended on an EOD frame.
    pub fn is_eod(&self) -> bool {
        self.eod
    }

    /// Error or fatal flag set.
    pub fn is_error(&self) -> bool {
        self.error || self.fatal
    }

    /// Fatal flag set, or error flag set while `abort_on_error` is enabled.
    pub fn is_fatal(&self) -> bool {
        self.fatal || (self.error && self.abort_on_error)
    }

    /// Whether a backend error aborts the job.
    pub fn abort_on_error(&self) -> bool {
        self.abort_on_error
    }

    /// Enable or disable abort-on-error for this link.
    pub fn set_abort_on_error(&mut self, enabled: bool) {
        self.abort_on_error = enabled;
    }

    /// Last text seen on the backend's error channel.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Message level for errors on this link.
    pub fn error_level(&self) -> MessageLevel {
        if self.is_fatal() {
            MessageLevel::Fatal
        } else {
            MessageLevel::Error
        }
    }

    /// Report a job message through the host.
    pub fn job_message(&self, level: MessageLevel, message: &str) {
        self.host.job_message(level, message);
    }

    /// Transport settings of this link.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // External pipe
    // ------------------------------------------------------------------

    /// Route bulk data through `file` instead of Data frames.
    pub fn set_ext_pipe(&mut self, file: File) {
        self.ext_pipe = Some(file);
    }

    /// True while bulk data goes through an external pipe.
    pub fn has_ext_pipe(&self) -> bool {
        self.ext_pipe.is_some()
    }

    /// Flush and close the external pipe, if any.
    pub async fn close_ext_pipe(&mut self) -> Result<()> {
        if let Some(mut pipe) = self.ext_pipe.take() {
            if let Err(e) = pipe.flush().await {
                let msg = format!("Cannot close ExtPIPE. Err={}", e);
                tracing::error!("{}", msg);
                self.host.job_message(MessageLevel::Error, &msg);
                return Err(e.into());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    /// Mark the session broken, report once, and release the backend.
    async fn abort(&mut self, err: BackendError, context: &str) -> BackendError {
        self.eod = true;
        self.error = true;
        self.fatal = true;
        let msg = format!("{}: {}", context, err);
        tracing::error!("{}", msg);
        self.host.job_message(MessageLevel::Fatal, &msg);
        self.terminate().await;
        err
    }

    fn report_stderr(&mut self) {
        let lines = match self.transport.as_mut() {
            Some(t) => t.take_stderr(),
            None => return,
        };
        for line in lines {
            self.error = true;
            self.host
                .job_message(self.error_level(), &format!("Backend reported error: {}", line));
            self.last_error = Some(line);
        }
    }

    async fn transport_recv(&mut self, buf: &mut [u8]) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(BackendError::Closed)?;
        let result = transport.recv_exact(buf).await;
        self.report_stderr();
        result
    }

    async fn transport_send(&mut self, data: &[u8]) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(BackendError::Closed)?;
        let result = transport.send_all(data).await;
        self.report_stderr();
        result
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Read headers until one answers a request for `expected`.
    async fn recv_header(&mut self, expected: FrameKind) -> Result<Received> {
        if self.is_closed() {
            let msg = "Backend connection is closed, cannot receive data";
            tracing::error!("{}", msg);
            self.host.job_message(self.error_level(), msg);
            return Err(BackendError::Closed);
        }

        self.eod = false;
        self.error = false;
        self.fatal = false;

        loop {
            let mut raw = [0u8; HEADER_SIZE];
            if let Err(e) = self.transport_recv(&mut raw).await {
                return Err(self.abort(e, "Cannot get packet header from backend").await);
            }
            let header = match decode_header(&raw) {
                Ok(h) => h,
                Err(e) => return Err(self.abort(e, "Protocol error").await),
            };
            tracing::trace!("RECV: {}", ascii_preview(&raw));

            match header.kind {
                FrameKind::Eod => {
                    if header.length != 0 {
                        let err = BackendError::Protocol(format!(
                            "EOD packet with {} bytes of payload",
                            header.length
                        ));
                        return Err(self.abort(err, "Protocol error").await);
                    }
                    self.eod = true;
                    return Ok(Received::Eod);
                }
                FrameKind::Terminate => {
                    tracing::debug!("Backend signaled connection termination");
                    self.terminate().await;
                    return Ok(Received::Terminated);
                }
                FrameKind::Command | FrameKind::Data => {
                    if header.kind != expected {
                        let err = BackendError::Protocol(format!(
                            "Expected packet: {} got: {}",
                            expected, header.kind
                        ));
                        return Err(self.abort(err, "Protocol error").await);
                    }
                    return Ok(Received::Payload(header.length as usize));
                }
                kind => {
                    let mut buf = vec![0u8; header.length as usize];
                    if let Err(e) = self.transport_recv(&mut buf).await {
                        return Err(self.abort(e, "Cannot get message from backend").await);
                    }
                    let message = String::from_utf8_lossy(&buf).trim_end().to_string();

                    match kind {
                        FrameKind::Error | FrameKind::FatalError => {
                            self.error = true;
                            self.fatal = kind == FrameKind::FatalError;
                            tracing::error!("Backend Error: {}", message);
                            self.host.job_message(
                                if self.fatal {
                                    MessageLevel::Fatal
                                } else {
                                    MessageLevel::Error
                                },
                                &message,
                            );
                            return Err(BackendError::Reported {
                                message,
                                fatal: self.fatal,
                            });
                        }
                        diagnostic => {
                            tracing::debug!("Backend message [{}]: {}", diagnostic, message);
                            if let Some(level) = MessageLevel::for_frame(diagnostic) {
                                self.host.job_message(level, &message);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn recv_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Err(e) = self.transport_recv(buf).await {
            return Err(self.abort(e, "Cannot get packet payload from backend").await);
        }
        tracing::trace!("RECV> {}", ascii_preview(buf));
        Ok(())
    }

    async fn read_command_bytes(&mut self) -> Result<Option<Bytes>> {
        match self.recv_header(FrameKind::Command).await? {
            Received::Payload(len) => {
                let mut buf = vec![0u8; len];
                self.recv_payload(&mut buf).await?;
                Ok(Some(Bytes::from(buf)))
            }
            Received::Eod | Received::Terminated => Ok(None),
        }
    }

    /// Read the next Command frame, trailing whitespace removed.
    ///
    /// Returns `None` when the backend sent EOD or Terminate; use
    /// [`is_eod`](Self::is_eod) and [`is_closed`](Self::is_closed) to tell
    /// them apart.
    pub async fn read_command(&mut self) -> Result<Option<String>> {
        Ok(self
            .read_command_bytes()
            .await?
            .map(|b| String::from_utf8_lossy(&b).trim_end().to_string()))
    }

    /// Read one Data frame into `buf`, replacing its contents.
    ///
    /// Returns the payload size, or 0 on EOD/Terminate. With an external
    /// pipe set, reads whatever the pipe has instead (0 on end of file).
    pub async fn read_data(&mut self, buf: &mut BytesMut) -> Result<usize> {
        buf.clear();
        if let Some(pipe) = self.ext_pipe.as_mut() {
            buf.resize(EXT_PIPE_CHUNK, 0);
            let n = pipe.read(&mut buf[..]).await?;
            buf.truncate(n);
            return Ok(n);
        }

        match self.recv_header(FrameKind::Data).await? {
            Received::Payload(len) => {
                buf.resize(len, 0);
                self.recv_payload(&mut buf[..]).await?;
                Ok(len)
            }
            Received::Eod | Received::Terminated => Ok(0),
        }
    }

    /// Read Data into a caller buffer that may be smaller than the frame.
    ///
    /// When the announced payload does not fit, the rest is returned by the
    /// following calls before any new header is read.
    pub async fn read_data_fixed(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(pipe) = self.ext_pipe.as_mut() {
            return Ok(pipe.read(buf).await?);
        }

        let length = if self.cont {
            self.remaining
        } else {
            match self.recv_header(FrameKind::Data).await? {
                Received::Payload(len) => len,
                Received::Eod | Received::Terminated => return Ok(0),
            }
        };
        if length == 0 {
            return Ok(0);
        }

        self.cont = length > buf.len();
        let n = if self.cont { buf.len() } else { length };
        self.remaining = length - n;
        self.recv_payload(&mut buf[..n]).await?;
        Ok(n)
    }

    /// Expect exactly an empty EOD frame.
    pub async fn read_ack(&mut self) -> Result<()> {
        match self.recv_header(FrameKind::Eod).await? {
            Received::Eod => {
                self.eod = false;
                Ok(())
            }
            Received::Terminated => Err(BackendError::Protocol(
                "backend terminated instead of acknowledging".to_string(),
            )),
            Received::Payload(_) => Err(BackendError::Protocol(
                "unexpected payload instead of acknowledgement".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    async fn send_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            let msg = "Backend connection is closed, cannot send data";
            tracing::error!("{}", msg);
            self.host.job_message(self.error_level(), msg);
            return Err(BackendError::Closed);
        }
        let frame = match build_frame(kind, payload) {
            Ok(f) => f,
            Err(e) => {
                self.host.job_message(MessageLevel::Fatal, &e.to_string());
                return Err(e);
            }
        };
        tracing::trace!(
            "SENT: {} {}",
            ascii_preview(&frame[..HEADER_SIZE]),
            ascii_preview(payload)
        );
        if let Err(e) = self.transport_send(&frame).await {
            return Err(self.abort(e, "Cannot write packet to backend").await);
        }
        Ok(())
    }

    /// Send a Command frame; `text` should carry its own newline.
    pub async fn write_command(&mut self, text: &str) -> Result<()> {
        self.send_frame(FrameKind::Command, text.as_bytes()).await
    }

    /// Send bulk data, split into frames of at most 999 999 bytes.
    pub async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        if let Some(pipe) = self.ext_pipe.as_mut() {
            pipe.write_all(data).await?;
            return Ok(());
        }
        if data.is_empty() {
            return self.send_frame(FrameKind::Data, data).await;
        }
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            self.send_frame(FrameKind::Data, chunk).await?;
        }
        Ok(())
    }

    /// Send EOD and require the backend to answer `OK`.
    pub async fn send_ack(&mut self) -> Result<()> {
        self.signal_eod().await?;
        match self.read_command().await? {
            Some(reply) if reply == "OK" => Ok(()),
            Some(reply) => Err(BackendError::Protocol(format!(
                "expected OK acknowledgement, got: {}",
                reply
            ))),
            None => Err(BackendError::Protocol(
                "expected OK acknowledgement, got end of data".to_string(),
            )),
        }
    }

    /// Send an Error frame carrying `text`.
    pub async fn signal_error(&mut self, text: &str) -> Result<()> {
        self.send_frame(FrameKind::Error, text.as_bytes()).await
    }

    /// Send an EOD frame.
    pub async fn signal_eod(&mut self) -> Result<()> {
        self.send_frame(FrameKind::Eod, &[]).await
    }

    /// Send a Terminate frame.
    pub async fn signal_term(&mut self) -> Result<()> {
        self.send_frame(FrameKind::Terminate, &[]).await
    }

    /// Exchange `Hello` greetings; anything but the exact reply is fatal.
    pub async fn handshake(&mut self, name: &str, api_version: &str) -> Result<()> {
        self.write_command(&format!("Hello {} {}\n", name, api_version))
            .await?;
        let reply = self.read_command_bytes().await?;
        let accepted = reply.as_deref().map_or(false, |r| {
            r.strip_suffix(b"\n").unwrap_or(r) == HANDSHAKE_REPLY.as_bytes()
        });
        if !accepted {
            let got = reply
                .map(|r| String::from_utf8_lossy(&r).into_owned())
                .unwrap_or_default();
            let err = BackendError::Protocol(format!(
                "Wrong backend response to Hello command, got: {:?}",
                got
            ));
            return Err(self.abort(err, "Handshake failed").await);
        }
        self.state = LinkState::Ready;
        tracing::debug!("Handshake with backend successful");
        Ok(())
    }

    /// Close the external pipe and the transport, reaping the process.
    ///
    /// No-op on a closed link.
    pub async fn terminate(&mut self) {
        let _ = self.close_ext_pipe().await;
        self.state = LinkState::Closed;
        self.cont = false;
        self.remaining = 0;
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        if let Some(status) = transport.terminate().await {
            if !status.success() {
                let msg = format!("Error closing backend. Err={}", status);
                tracing::error!("{}", msg);
                self.host.job_message(MessageLevel::Error, &msg);
            }
        }
    }
}

impl std::fmt::Debug for BackendLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLink")
            .field("state", &self.state)
            .field("eod", &self.eod)
            .field("error", &self.error)
            .field("fatal", &self.fatal)
            .field("abort_on_error", &self.abort_on_error)
            .field("transport", &self.transport)
            .finish()
    }
}
