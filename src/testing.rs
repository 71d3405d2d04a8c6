//! In-memory backend peer and recording host for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::config::PluginConfig;
use crate::error::{BackendError, Result};
use crate::host::{Host, HostValue, HostVariable, MessageLevel};
use crate::link::{BackendLink, LinkConfig};
use crate::orchestrator::Launcher;
use crate::protocol::{build_frame, decode_header, FrameKind, HEADER_SIZE};
use crate::transport::PipeTransport;

const PIPE_CAPACITY: usize = 1 << 20;

/// Host that records job messages and serves variables from a map.
#[derive(Default)]
pub struct RecordingHost {
    messages: Mutex<Vec<(MessageLevel, String)>>,
    variables: Mutex<HashMap<HostVariable, HostValue>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, var: HostVariable, value: HostValue) {
        self.variables.lock().unwrap().insert(var, value);
    }

    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self, level: MessageLevel) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }
}

impl Host for RecordingHost {
    fn job_message(&self, level: MessageLevel, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }

    fn get_variable(&self, var: HostVariable) -> Option<HostValue> {
        self.variables.lock().unwrap().get(&var).cloned()
    }

    fn set_variable(&self, var: HostVariable, value: HostValue) -> bool {
        self.variables.lock().unwrap().insert(var, value);
        true
    }
}

/// A frame as received by the peer.
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text with trailing whitespace removed.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim_end().to_string()
    }
}

/// The backend end of an in-memory link.
pub struct Peer {
    reader: DuplexStream,
    writer: DuplexStream,
    stderr: DuplexStream,
}

impl Peer {
    pub async fn send(&mut self, kind: FrameKind, payload: &[u8]) {
        let frame = build_frame(kind, payload).unwrap();
        self.writer.write_all(&frame).await.unwrap();
    }

    pub async fn send_command(&mut self, text: &str) {
        self.send(FrameKind::Command, text.as_bytes()).await;
    }

    pub async fn write_stderr(&mut self, data: &[u8]) {
        self.stderr.write_all(data).await.unwrap();
    }

    pub async fn recv(&mut self) -> Frame {
        let mut raw = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut raw).await.unwrap();
        let header = decode_header(&raw).unwrap();
        let mut payload = vec![0u8; header.length as usize];
        self.reader.read_exact(&mut payload).await.unwrap();
        Frame {
            kind: header.kind,
            payload: Bytes::from(payload),
        }
    }

    pub async fn expect(&mut self, kind: FrameKind, payload: &[u8]) {
        let frame = self.recv().await;
        assert_eq!(frame.kind, kind, "payload: {:?}", frame.text());
        assert_eq!(
            frame.payload(),
            payload,
            "{:?} != {:?}",
            frame.text(),
            String::from_utf8_lossy(payload)
        );
    }

    /// Expect a Command frame whose text, without the newline, is `text`.
    pub async fn expect_command(&mut self, text: &str) {
        let frame = self.recv().await;
        assert_eq!(frame.kind, FrameKind::Command);
        assert_eq!(frame.text(), text);
    }

    /// Acknowledge a block: expect EOD, answer with EOD.
    pub async fn ack_block(&mut self) {
        self.expect(FrameKind::Eod, b"").await;
        self.send(FrameKind::Eod, b"").await;
    }
}

/// Transport over in-memory pipes plus the peer driving the other end.
pub fn transport_pair() -> (PipeTransport, Peer) {
    let (ours_r, theirs_w) = duplex(PIPE_CAPACITY);
    let (theirs_r, ours_w) = duplex(PIPE_CAPACITY);
    let (err_r, err_w) = duplex(4096);
    let transport = PipeTransport::from_parts(
        Box::new(ours_r),
        Box::new(ours_w),
        Some(Box::new(err_r)),
        LinkConfig::default().timeout,
    );
    let peer = Peer {
        reader: theirs_r,
        writer: theirs_w,
        stderr: err_w,
    };
    (transport, peer)
}

/// An open link attached to an in-memory peer.
pub fn link_pair() -> (BackendLink, Peer, Arc<RecordingHost>) {
    let host = RecordingHost::new();
    let (transport, peer) = transport_pair();
    let mut link = BackendLink::new(host.clone(), LinkConfig::default());
    link.attach(transport);
    (link, peer, host)
}

/// Launcher handing out pre-connected transports in order.
#[derive(Default)]
pub struct QueueLauncher {
    transports: Mutex<VecDeque<PipeTransport>>,
}

impl QueueLauncher {
    /// A launcher plus one peer per backend it will start.
    pub fn with_peers(count: usize) -> (Arc<Self>, Vec<Peer>) {
        let launcher = Self::default();
        let mut peers = Vec::new();
        for _ in 0..count {
            let (transport, peer) = transport_pair();
            launcher.transports.lock().unwrap().push_back(transport);
            peers.push(peer);
        }
        (Arc::new(launcher), peers)
    }
}

impl Launcher for QueueLauncher {
    fn launch(&self, link: &mut BackendLink, config: &PluginConfig) -> Result<()> {
        match self.transports.lock().unwrap().pop_front() {
            Some(transport) => {
                link.attach(transport);
                Ok(())
            }
            None => Err(BackendError::Spawn {
                command: config.backend.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }
}
