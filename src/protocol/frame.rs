//! Frame building.
//!
//! A frame is the 8-byte header followed by its payload, written to the
//! backend in one buffer.
//!
//! # Example
//!
//! ```
//! use backend_wire::protocol::{build_frame, FrameKind};
//!
//! assert_eq!(build_frame(FrameKind::Command, b"OK\n").unwrap(), b"C000003\nOK\n");
//! ```

use super::wire_format::{encode_header, FrameKind, HEADER_SIZE};
use crate::error::Result;

/// Build a complete frame (header + payload) as a single buffer.
///
/// Fails if the payload does not fit the six-digit length field.
pub fn build_frame(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>> {
    let header = encode_header(kind, payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Printable preview of up to 16 bytes, used in frame traces.
pub(crate) fn ascii_preview(data: &[u8]) -> String {
    data.iter()
        .take(16)
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}
