//! Local proxy ingress
//!
//! Provides:
//! - SOCKS5 proxy server
//! - HTTP CONNECT proxy server
//!
//! Both hand the caller a [`ProxyConnection`] once the destination is
//! known. The success reply is only sent when the caller has opened its
//! upstream, so a failed upstream surfaces to the application as a refused
//! proxy request.

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "http-proxy")]
mod http;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Server;

#[cfg(feature = "http-proxy")]
pub use http::HttpProxyServer;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tokio::net::TcpStream;

#[cfg(any(feature = "socks5", feature = "http-proxy"))]
use std::{future::Future, time::Duration};

/// Pause after a failed accept before trying again
#[cfg(any(feature = "socks5", feature = "http-proxy"))]
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(target.to_string());

        let (host, port_str) = target.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port_str.parse().map_err(|_| invalid())?;

        if let Some(v6) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            let ip: Ipv6Addr = v6.parse().map_err(|_| invalid())?;
            return Ok(Address::Ipv6(ip.octets(), port));
        }

        if host.is_empty() {
            return Err(invalid());
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            Ok(Address::Ipv4(ip.octets(), port))
        } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Ok(Address::Ipv6(ip.octets(), port))
        } else {
            Ok(Address::Domain(host.to_string(), port))
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// IP address, unless this is a domain
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip, _) => Some(IpAddr::from(*ip)),
            Address::Ipv6(ip, _) => Some(IpAddr::from(*ip)),
            Address::Domain(..) => None,
        }
    }

    /// Domain name, unless this is an IP address
    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::Domain(domain, _) => Some(domain),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::Ipv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => Address::Ipv6(ip.octets(), addr.port()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Socks5,
    HttpConnect,
}

/// A proxy request whose destination is known but not yet answered
#[derive(Debug)]
pub struct ProxyConnection {
    /// Application side of the connection
    pub stream: TcpStream,
    /// Requested destination
    pub destination: Address,
    /// Bytes the application sent past the request (HTTP only)
    pub buffered: Vec<u8>,
    protocol: Protocol,
}

impl ProxyConnection {
    /// Tell the application the destination is connected
    pub async fn accept(&mut self) -> Result<(), ProxyError> {
        match self.protocol {
            #[cfg(feature = "socks5")]
            Protocol::Socks5 => socks5::send_reply(&mut self.stream, true, &self.destination).await,
            #[cfg(feature = "http-proxy")]
            Protocol::HttpConnect => http::send_reply(&mut self.stream, true).await,
            #[allow(unreachable_patterns)]
            _ => Ok(()),
        }
    }

    /// Tell the application the destination could not be reached
    pub async fn refuse(&mut self) -> Result<(), ProxyError> {
        match self.protocol {
            #[cfg(feature = "socks5")]
            Protocol::Socks5 => socks5::send_reply(&mut self.stream, false, &self.destination).await,
            #[cfg(feature = "http-proxy")]
            Protocol::HttpConnect => http::send_reply(&mut self.stream, false).await,
            #[allow(unreachable_patterns)]
            _ => Ok(()),
        }
    }
}

/// Wait for the next accepted connection.
///
/// Accept failures (descriptor exhaustion, aborted handshakes) are logged
/// and retried; they never end the listener.
#[cfg(any(feature = "socks5", feature = "http-proxy"))]
pub(crate) async fn accept_next<T, F, Fut>(listener: &str, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::error!("{} accept error: {}", listener, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
