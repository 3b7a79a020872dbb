//! # Lunar Tunnel
//!
//! A personal split-tunnel VPN: a local client that routes selected
//! application traffic through an authenticated, obfuscated tunnel to a
//! remote relay, and the relay server itself.
//!
//! ## Features
//!
//! - **Composable obfuscation layers** selected per session by catalog index
//! - **Authenticated handshake** sent through a pre-shared bootstrap layer
//! - **Split tunneling** with whitelist/blacklist routing (IPs, CIDRs, hosts)
//! - **Stream multiplexing** of many application flows over one tunnel
//! - **SOCKS5 and HTTP CONNECT** local ingress
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Ingress / Routing                   │
//! │     (SOCKS5, HTTP CONNECT, whitelist/blacklist)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │           (stream open/close, data, keepalive)       │
//! ├─────────────────────────────────────────────────────┤
//! │                    Layer Stack                       │
//! │   (negotiated per session: xor, padding, aead, …)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │          (TCP, length-prefixed messages)             │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod crypto;
pub mod layers;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod routing;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol magic bytes carried by handshake messages
pub(crate) const MAGIC: [u8; 4] = *b"LUNR";

/// Default port for the relay server
pub const DEFAULT_PORT: u16 = 5555;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Authentication error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

impl From<layers::LayerError> for Error {
    fn from(err: layers::LayerError) -> Self {
        Error::Protocol(protocol::ProtocolError::Layer(err))
    }
}
