//! Protocol definitions and constants
//!
//! - [`ClientHello`] / [`ServerReply`]: the two handshake messages
//! - [`ClientHandshake`] / [`ServerHandshake`]: the negotiation itself

mod handshake;
mod hello;

pub use handshake::{ClientHandshake, Established, HandshakeState, ServerHandshake};
pub use hello::{ClientHello, ServerReply};

use crate::layers::{LayerError, LayerIndex};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Layer index {index} out of range (catalog has {size} layers)")]
    InvalidLayerIndex { index: LayerIndex, size: usize },

    #[error("Bootstrap layer mismatch: expected {expected}, got {actual}")]
    BootstrapMismatch {
        expected: LayerIndex,
        actual: LayerIndex,
    },

    #[error("Layer error: {0}")]
    Layer(#[from] LayerError),
}

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum transport message size (256 KB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 30;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 30;
