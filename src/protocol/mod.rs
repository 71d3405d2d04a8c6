//! Protocol module - wire format and frame types.
//!
//! This module implements the framing shared by the agent and every backend:
//! - 8-byte text header encoding/decoding
//! - Frame kinds, including the diagnostic set
//! - Frame building

mod frame;
mod wire_format;

pub(crate) use frame::ascii_preview;
pub use frame::build_frame;
pub use wire_format::{
    decode_header, encode_header, FrameKind, Header, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
