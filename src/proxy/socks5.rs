//! SOCKS5 proxy implementation (RFC 1928, no authentication, CONNECT only)

use super::{accept_next, Address, Protocol, ProxyConnection, ProxyError};
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind the listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self { listener })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(ProxyConnection) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send,
    {
        loop {
            let (mut stream, peer_addr) = accept_next("SOCKS5", || self.listener.accept()).await;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                let destination = match negotiate(&mut stream).await {
                    Ok(destination) => destination,
                    Err(e) => {
                        warn!("SOCKS5 negotiation with {} failed: {}", peer_addr, e);
                        return;
                    }
                };
                debug!("SOCKS5 CONNECT to {}", destination);

                let connection = ProxyConnection {
                    stream,
                    destination,
                    buffered: Vec::new(),
                    protocol: Protocol::Socks5,
                };
                if let Err(e) = handler(connection).await {
                    debug!("SOCKS5 connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Run method selection and read the CONNECT request.
///
/// Unsupported commands and address types are answered with the matching
/// SOCKS5 reply before the error is returned.
pub(crate) async fn negotiate<S>(stream: &mut S) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 258];

    // Greeting
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    let method = if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::NoAcceptableMethod);
    }

    // Request
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let command = buf[1];
    // buf[2] is reserved
    let addr_type = match AddressType::try_from(buf[3]) {
        Ok(addr_type) => addr_type,
        Err(e) => {
            write_reply(stream, Reply::AddressTypeNotSupported, &Address::Ipv4([0; 4], 0)).await?;
            return Err(e);
        }
    };

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(ip, stream.read_u16().await?)
        }
        AddressType::Domain => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = std::str::from_utf8(&buf[..len])
                .map_err(|_| ProxyError::InvalidAddress("non-UTF-8 domain".to_string()))?
                .to_string();
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Ipv6(ip, stream.read_u16().await?)
        }
    };

    match Command::try_from(command) {
        Ok(Command::Connect) => Ok(address),
        Ok(Command::Bind) | Ok(Command::UdpAssociate) | Err(_) => {
            write_reply(stream, Reply::CommandNotSupported, &address).await?;
            Err(ProxyError::UnsupportedCommand(command))
        }
    }
}

/// Answer a CONNECT request
pub(crate) async fn send_reply<S>(
    stream: &mut S,
    succeeded: bool,
    address: &Address,
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let reply = if succeeded {
        Reply::Succeeded
    } else {
        Reply::HostUnreachable
    };
    write_reply(stream, reply, address).await
}

async fn write_reply<S>(stream: &mut S, reply: Reply, addr: &Address) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&make_reply(reply, addr)).await?;
    Ok(())
}

fn make_reply(reply: Reply, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];

    match addr {
        Address::Ipv4(ip, port) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            buf.push(AddressType::Domain as u8);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_connect_domain() {
        let (mut app, mut proxy) = duplex(1024);

        let client = tokio::spawn(async move {
            app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut method = [0u8; 2];
            app.read_exact(&mut method).await.unwrap();
            assert_eq!(method, [0x05, 0x00]);

            let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
            request.extend_from_slice(b"example.com");
            request.extend_from_slice(&443u16.to_be_bytes());
            app.write_all(&request).await.unwrap();
            app
        });

        let address = negotiate(&mut proxy).await.unwrap();
        assert_eq!(address, Address::Domain("example.com".to_string(), 443));

        send_reply(&mut proxy, true, &address).await.unwrap();
        let mut app = client.await.unwrap();
        let mut reply = [0u8; 4];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let (mut app, mut proxy) = duplex(1024);
        app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        app.write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x01, 0xBB])
            .await
            .unwrap();

        let address = negotiate(&mut proxy).await.unwrap();
        assert_eq!(address, Address::Ipv4([10, 0, 0, 5], 443));
    }

    #[tokio::test]
    async fn test_rejects_udp_associate() {
        let (mut app, mut proxy) = duplex(1024);
        app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        app.write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        assert!(matches!(
            negotiate(&mut proxy).await,
            Err(ProxyError::UnsupportedCommand(0x03))
        ));

        let mut method = [0u8; 2];
        app.read_exact(&mut method).await.unwrap();
        let mut reply = [0u8; 10];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn test_requires_no_auth_method() {
        let (mut app, mut proxy) = duplex(1024);
        app.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        assert!(matches!(
            negotiate(&mut proxy).await,
            Err(ProxyError::NoAcceptableMethod)
        ));
        let mut method = [0u8; 2];
        app.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xFF]);
    }

    #[test]
    fn test_make_reply_ipv6() {
        let reply = make_reply(Reply::HostUnreachable, &Address::Ipv6([0; 16], 80));
        assert_eq!(reply.len(), 4 + 16 + 2);
        assert_eq!(reply[1], 0x04);
    }
}
