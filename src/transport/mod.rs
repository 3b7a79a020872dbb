//! Transport layer
//!
//! TCP dialing with a connect timeout, and the length-prefixed message
//! codec every handshake message and tunnel frame travels in.

mod codec;

pub use codec::{read_message, write_message, LENGTH_PREFIX_LEN};

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Default connection timeout in seconds
pub const CONNECT_TIMEOUT: u64 = 10;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection to {addr} failed: {source}")]
    ConnectionFailed { addr: String, source: io::Error },

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT),
            nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Default configuration with a specific connect timeout
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Self::default()
        }
    }
}

/// Open a TCP connection to `addr` (`host:port`)
pub async fn dial(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|source| TransportError::ConnectionFailed {
            addr: addr.to_string(),
            source,
        })?;

    if config.nodelay {
        stream.set_nodelay(true).ok();
    }
    debug!("Connected to {}", addr);

    Ok(stream)
}
