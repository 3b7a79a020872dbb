//! Many application flows over one negotiated connection
//!
//! After the handshake every transport message carries exactly one
//! [`Frame`], encoded with the session's layer stack. Streams opened by the
//! client use odd ids, streams opened by the server even ids.
//!
//! Each direction of a stream has a credit window: a peer may have at most
//! [`DEFAULT_WINDOW_SIZE`] bytes in flight that the receiving application
//! has not consumed yet, and `WindowUpdate` frames hand credit back. A flow
//! whose application stops reading therefore stalls alone.

mod frame;
mod multiplexer;
mod stream;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use multiplexer::{Multiplexer, MuxEvent};
pub use stream::{StreamState, TunnelStream};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream {0} exceeded its flow control window")]
    FlowControl(u32),

    #[error("Too many streams (limit {0})")]
    TooManyStreams(usize),

    #[error("Tunnel disconnected")]
    Disconnected,
}

/// Concurrent streams per tunnel
pub const MAX_STREAMS: usize = 1024;

/// Per-stream credit window (256 KiB)
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;
