//! Transport module - backend subprocess pipes.
//!
//! Provides the exact-length read/write primitives over a child's
//! stdin/stdout, with stderr watched as an error side channel.

mod pipe;

pub use pipe::{
    BoxedReader, BoxedWriter, PipeTransport, DEFAULT_TERMINATE_GRACE, DEFAULT_TIMEOUT,
};
