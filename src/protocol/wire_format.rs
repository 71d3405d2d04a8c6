//! Wire format encoding and decoding.
//!
//! Implements the 8-byte text header:
//! ```text
//! ┌────────┬──────────────────────┬──────┐
//! │ Status │ Length               │ '\n' │
//! │ 1 byte │ 6 ASCII digits (pad0)│      │
//! └────────┴──────────────────────┴──────┘
//! ```
//!
//! The status byte selects a [`FrameKind`]; the length is the payload size
//! in bytes, `000000` to `999999`.

use crate::error::{BackendError, Result};

/// Header size in bytes: status byte, six length digits and a newline.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size expressible in six decimal digits.
pub const MAX_PAYLOAD_SIZE: usize = 999_999;

/// Frame kind, carried in the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// `C` - protocol command text.
    Command,
    /// `D` - bulk data.
    Data,
    /// `F` - end of data / end of dialogue.
    Eod,
    /// `T` - backend session terminated.
    Terminate,
    /// `E` - recoverable error message.
    Error,
    /// `A` - fatal error message.
    FatalError,
    /// `W` - warning message.
    Warning,
    /// `I` - informational message.
    Info,
    /// `S` - item saved.
    Saved,
    /// `N` - item not saved.
    NotSaved,
    /// `R` - item restored.
    Restored,
    /// `P` - item skipped.
    Skipped,
    /// `O` - operator (mount) message.
    Operator,
    /// `V` - event message.
    Event,
    /// `Q` - query error message.
    QueryError,
}

impl FrameKind {
    /// All frame kinds, in status-byte table order.
    pub const ALL: [FrameKind; 15] = [
        FrameKind::Command,
        FrameKind::Data,
        FrameKind::Eod,
        FrameKind::Terminate,
        FrameKind::Error,
        FrameKind::FatalError,
        FrameKind::Warning,
        FrameKind::Info,
        FrameKind::Saved,
        FrameKind::NotSaved,
        FrameKind::Restored,
        FrameKind::Skipped,
        FrameKind::Operator,
        FrameKind::Event,
        FrameKind::QueryError,
    ];

    /// Status byte for this kind.
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Command => b'C',
            FrameKind::Data => b'D',
            FrameKind::Eod => b'F',
            FrameKind::Terminate => b'T',
            FrameKind::Error => b'E',
            FrameKind::FatalError => b'A',
            FrameKind::Warning => b'W',
            FrameKind::Info => b'I',
            FrameKind::Saved => b'S',
            FrameKind::NotSaved => b'N',
            FrameKind::Restored => b'R',
            FrameKind::Skipped => b'P',
            FrameKind::Operator => b'O',
            FrameKind::Event => b'V',
            FrameKind::QueryError => b'Q',
        }
    }

    /// Parse a status byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'C' => FrameKind::Command,
            b'D' => FrameKind::Data,
            b'F' => FrameKind::Eod,
            b'T' => FrameKind::Terminate,
            b'E' => FrameKind::Error,
            b'A' => FrameKind::FatalError,
            b'W' => FrameKind::Warning,
            b'I' => FrameKind::Info,
            b'S' => FrameKind::Saved,
            b'N' => FrameKind::NotSaved,
            b'R' => FrameKind::Restored,
            b'P' => FrameKind::Skipped,
            b'O' => FrameKind::Operator,
            b'V' => FrameKind::Event,
            b'Q' => FrameKind::QueryError,
            _ => return None,
        })
    }

    /// Diagnostic kinds are reported and never satisfy a pending read.
    #[inline]
    pub fn is_diagnostic(self) -> bool {
        matches!(
            self,
            FrameKind::Warning
                | FrameKind::Info
                | FrameKind::Saved
                | FrameKind::NotSaved
                | FrameKind::Restored
                | FrameKind::Skipped
                | FrameKind::Operator
                | FrameKind::Event
                | FrameKind::QueryError
        )
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame kind.
    pub kind: FrameKind,
    /// Payload length in bytes.
    pub length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: FrameKind, length: u32) -> Self {
        Self { kind, length }
    }

    /// Encode header to bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use backend_wire::protocol::{FrameKind, Header};
    ///
    /// let header = Header::new(FrameKind::Command, 12);
    /// assert_eq!(&header.encode().unwrap(), b"C000012\n");
    /// ```
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let len = self.length as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(BackendError::PayloadTooLarge(len));
        }
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind.as_byte();
        let mut n = len;
        for slot in buf[1..HEADER_SIZE - 1].iter_mut().rev() {
            *slot = b'0' + (n % 10) as u8;
            n /= 10;
        }
        buf[HEADER_SIZE - 1] = b'\n';
        Ok(buf)
    }

    /// Decode header from bytes.
    ///
    /// Fails on an unknown status byte, non-digit length characters or a
    /// missing trailing newline.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let kind = FrameKind::from_byte(buf[0]).ok_or_else(|| {
            BackendError::InvalidHeader(format!("unknown status byte 0x{:02x}", buf[0]))
        })?;
        if buf[HEADER_SIZE - 1] != b'\n' {
            return Err(BackendError::InvalidHeader(
                "missing header terminator".to_string(),
            ));
        }
        let mut length: u32 = 0;
        for &c in &buf[1..HEADER_SIZE - 1] {
            if !c.is_ascii_digit() {
                return Err(BackendError::InvalidHeader(format!(
                    "malformed length {:?}",
                    String::from_utf8_lossy(&buf[1..HEADER_SIZE - 1])
                )));
            }
            length = length * 10 + (c - b'0') as u32;
        }
        Ok(Self { kind, length })
    }
}

/// Encode a header for `kind` with a payload of `len` bytes.
#[inline]
pub fn encode_header(kind: FrameKind, len: usize) -> Result<[u8; HEADER_SIZE]> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(BackendError::PayloadTooLarge(len));
    }
    Header::new(kind, len as u32).encode()
}

/// Decode a header from raw bytes.
#[inline]
pub fn decode_header(buf: &[u8; HEADER_SIZE]) -> Result<Header> {
    Header::decode(buf)
}
