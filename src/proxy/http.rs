//! HTTP CONNECT proxy implementation

use super::{accept_next, Address, Protocol, ProxyConnection, ProxyError};
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Upper bound on request header lines
const MAX_HEADERS: usize = 100;

/// Longest accepted request or header line, terminator included
const MAX_LINE_LEN: u64 = 8 * 1024;

/// HTTP CONNECT proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
}

impl HttpProxyServer {
    /// Bind the listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", listener.local_addr()?);

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
            let (stream, peer_addr) = accept_next("HTTP proxy", || self.listener.accept()).await;
            debug!("New HTTP proxy connection from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                let (stream, destination, buffered) = match read_request(stream).await {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("HTTP proxy request from {} failed: {}", peer_addr, e);
                        return;
                    }
                };
                debug!("HTTP CONNECT to {}", destination);

                let connection = ProxyConnection {
                    stream,
                    destination,
                    buffered,
                    protocol: Protocol::HttpConnect,
                };
                if let Err(e) = handler(connection).await {
                    debug!("HTTP proxy connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Read a CONNECT request head.
///
/// Returns the stream, the target and any bytes the client already sent
/// after the blank line. Other methods get `405` and an error.
pub(crate) async fn read_request<S>(stream: S) -> Result<(S, Address, Vec<u8>), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if read_line_limited(&mut reader, &mut request_line).await? == 0 {
        return Err(ProxyError::InvalidRequest("empty request".to_string()));
    }

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ProxyError::InvalidRequest("invalid request line".to_string()));
    }
    let method = parts[0].to_string();
    let target = parts[1].to_string();

    // Headers are not needed for CONNECT; skip to the blank line
    let mut headers = 0;
    loop {
        let mut line = String::new();
        if read_line_limited(&mut reader, &mut line).await? == 0 {
            return Err(ProxyError::InvalidRequest("truncated headers".to_string()));
        }
        if line.trim().is_empty() {
            break;
        }
        headers += 1;
        if headers > MAX_HEADERS {
            return Err(ProxyError::InvalidRequest("too many headers".to_string()));
        }
    }

    if !method.eq_ignore_ascii_case("CONNECT") {
        let mut stream = reader.into_inner();
        stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await?;
        return Err(ProxyError::InvalidRequest(format!(
            "unsupported method: {}",
            method
        )));
    }

    let address = match Address::parse(&target) {
        Ok(address) => address,
        Err(e) => {
            let mut stream = reader.into_inner();
            stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Err(e);
        }
    };

    let buffered = reader.buffer().to_vec();
    Ok((reader.into_inner(), address, buffered))
}

/// `read_line` that gives up on lines longer than [`MAX_LINE_LEN`]
async fn read_line_limited<R>(reader: &mut R, line: &mut String) -> Result<usize, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let n = reader.take(MAX_LINE_LEN).read_line(line).await?;
    if n as u64 == MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(ProxyError::InvalidRequest("line too long".to_string()));
    }
    Ok(n)
}

/// Answer a CONNECT request
pub(crate) async fn send_reply<S>(stream: &mut S, succeeded: bool) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let response: &[u8] = if succeeded {
        b"HTTP/1.1 200 Connection Established\r\n\r\n"
    } else {
        b"HTTP/1.1 502 Bad Gateway\r\n\r\n"
    };
    stream.write_all(response).await?;
    Ok(())
}
