//! Session negotiation
//!
//! ```text
//! Client                                   Server
//!   |-- bootstrap(ClientHello) ------------->|  parse, check bootstrap,
//!   |                                        |  authenticate, check indices
//!   |<------------- bootstrap(ServerReply) --|
//!   |                                        |
//!   |== stack(frames) =======================|  negotiated stack from here on
//! ```
//!
//! The bootstrap layer is a pre-shared configuration value on both sides.
//! It protects exactly these two messages and is never used afterwards.

use super::{ClientHello, ProtocolError, ServerReply};
use crate::auth::{AuthError, Authenticator};
use crate::layers::{LayerCatalog, LayerError, LayerIndex, LayerStack};
use crate::transport::{dial, read_message, write_message, TransportConfig};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Client handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet
    Idle,
    /// Opening the transport connection
    Dialing,
    /// Writing the hello
    HelloSent,
    /// Waiting for the server reply
    AwaitingAck,
    /// Negotiated stack in effect
    LayersEstablished,
    /// Terminal failure for this attempt
    Failed,
}

/// Initiator side of the handshake
pub struct ClientHandshake {
    catalog: Arc<LayerCatalog>,
    hello: ClientHello,
    timeout: Duration,
    state: HandshakeState,
}

impl ClientHandshake {
    /// Create a handshake for one connection attempt
    pub fn new(catalog: Arc<LayerCatalog>, hello: ClientHello, timeout: Duration) -> Self {
        Self {
            catalog,
            hello,
            timeout,
            state: HandshakeState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Dial `addr` and negotiate over the new connection
    pub async fn connect(
        &mut self,
        addr: &str,
        transport: &TransportConfig,
    ) -> Result<(TcpStream, LayerStack)> {
        self.state = HandshakeState::Dialing;
        let mut stream = match dial(addr, transport).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = HandshakeState::Failed;
                return Err(e.into());
            }
        };

        let stack = self.negotiate(&mut stream).await?;
        Ok((stream, stack))
    }

    /// Run the hello/reply round trip over an established byte stream
    pub async fn negotiate<S>(&mut self, io: &mut S) -> Result<LayerStack>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.timeout;
        let result = match tokio::time::timeout(timeout, self.round_trip(io)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match result {
            Ok(stack) => {
                self.state = HandshakeState::LayersEstablished;
                debug!("Layers established: {:?}", stack.indices());
                Ok(stack)
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    async fn round_trip<S>(&mut self, io: &mut S) -> Result<LayerStack>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let bootstrap = LayerStack::single(&self.catalog, self.hello.bootstrap_layer)?;
        let stack = LayerStack::new(&self.catalog, &self.hello.proposed_layers)?;

        self.state = HandshakeState::HelloSent;
        let hello = bootstrap.encode(&self.hello.encode()?)?;
        write_message(io, &hello).await?;

        self.state = HandshakeState::AwaitingAck;
        let reply = read_message(io).await?.ok_or(Error::ConnectionClosed)?;
        let reply = ServerReply::decode(&bootstrap.decode(&reply)?)?;

        match reply {
            ServerReply::Accepted => Ok(stack),
            ServerReply::Rejected => Err(AuthError::Rejected.into()),
        }
    }
}

/// Result of a successful responder handshake
#[derive(Debug)]
pub struct Established {
    /// Stack for all further traffic
    pub stack: LayerStack,
    /// Authenticated login, for logging
    pub login: String,
}

/// Responder side of the handshake, shared by every connection
#[derive(Clone)]
pub struct ServerHandshake {
    catalog: Arc<LayerCatalog>,
    authenticator: Arc<dyn Authenticator>,
    bootstrap: LayerStack,
    bootstrap_layer: LayerIndex,
    timeout: Duration,
}

impl ServerHandshake {
    /// Create the responder; the bootstrap index must exist in the catalog
    pub fn new(
        catalog: Arc<LayerCatalog>,
        authenticator: Arc<dyn Authenticator>,
        bootstrap_layer: LayerIndex,
        timeout: Duration,
    ) -> Result<Self> {
        let bootstrap = LayerStack::single(&catalog, bootstrap_layer)
            .map_err(|e| Error::Config(format!("bootstrap layer: {}", e)))?;

        Ok(Self {
            catalog,
            authenticator,
            bootstrap,
            bootstrap_layer,
            timeout,
        })
    }

    /// Read a hello and answer it.
    ///
    /// On any failure the peer gets the same rejection reply while the
    /// returned error carries the real cause.
    pub async fn accept<S>(&self, io: &mut S) -> Result<Established>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.timeout, self.round_trip(io)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn round_trip<S>(&self, io: &mut S) -> Result<Established>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let message = read_message(io).await?.ok_or(Error::ConnectionClosed)?;

        let hello = match self.parse_hello(&message) {
            Ok(hello) => hello,
            Err(e) => return Err(self.reject(io, e).await),
        };

        if hello.bootstrap_layer != self.bootstrap_layer {
            let e = ProtocolError::BootstrapMismatch {
                expected: self.bootstrap_layer,
                actual: hello.bootstrap_layer,
            };
            return Err(self.reject(io, e.into()).await);
        }

        if !self.authenticator.authenticate(&hello).await {
            return Err(self.reject(io, AuthError::InvalidCredentials.into()).await);
        }

        let stack = match LayerStack::new(&self.catalog, &hello.proposed_layers) {
            Ok(stack) => stack,
            Err(LayerError::UnknownLayer { index, size }) => {
                let e = ProtocolError::InvalidLayerIndex { index, size };
                return Err(self.reject(io, e.into()).await);
            }
            Err(e) => return Err(self.reject(io, e.into()).await),
        };

        let reply = self.bootstrap.encode(&ServerReply::Accepted.encode())?;
        write_message(io, &reply).await?;

        Ok(Established {
            stack,
            login: hello.login().unwrap_or_default().to_string(),
        })
    }

    fn parse_hello(&self, message: &[u8]) -> Result<ClientHello> {
        let plain = self.bootstrap.decode(message)?;
        Ok(ClientHello::decode(&plain)?)
    }

    async fn reject<S>(&self, io: &mut S, cause: Error) -> Error
    where
        S: AsyncWrite + Unpin,
    {
        warn!("Rejecting handshake: {}", cause);
        match self.bootstrap.encode(&ServerReply::Rejected.encode()) {
            Ok(reply) => {
                if let Err(e) = write_message(io, &reply).await {
                    debug!("Failed to send rejection: {}", e);
                }
            }
            Err(e) => debug!("Failed to encode rejection: {}", e),
        }
        cause
    }
}
