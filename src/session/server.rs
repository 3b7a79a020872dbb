//! Server session: accept, authenticate, relay streams to their destinations

use super::{
    apply_stream_command, attach_stream, forward_data, grant_credit, remote_closed, send_frames,
    spawn_reader, ReaderMessage, StreamConnection, StreamTable, CHANNEL_CAPACITY,
};
use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::layers::{LayerCatalog, LayerStack};
use crate::protocol::ServerHandshake;
use crate::proxy::Address;
use crate::transport::{dial, TransportConfig};
use crate::tunnel::{Multiplexer, MuxEvent};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The relay side of the VPN
pub struct Server {
    config: ServerConfig,
    handshake: ServerHandshake,
    connections: Semaphore,
}

impl Server {
    /// Create a server; the configured bootstrap layer must exist in `catalog`
    pub fn new(
        config: ServerConfig,
        catalog: Arc<LayerCatalog>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        let handshake = ServerHandshake::new(
            catalog,
            authenticator,
            config.bootstrap_layer,
            config.handshake_timeout(),
        )?;
        let connections = Semaphore::new(config.max_connections);

        Ok(Self {
            config,
            handshake,
            connections,
        })
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever, one session task per connection.
    ///
    /// A failing session never stops the listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            debug!("New connection from {}", peer_addr);

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match server.handle_connection(stream, peer_addr).await {
                    Ok(()) => debug!("Session with {} ended", peer_addr),
                    Err(Error::ConnectionClosed) => debug!("{} disconnected", peer_addr),
                    Err(e) => warn!("Session with {} failed: {}", peer_addr, e),
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        // Over the limit the socket is dropped at once instead of queueing
        let Ok(_permit) = self.connections.try_acquire() else {
            warn!(
                "Connection limit ({}) reached, dropping {}",
                self.config.max_connections, peer_addr
            );
            return Ok(());
        };

        let _ = stream.set_nodelay(true);

        let established = self.handshake.accept(&mut stream).await?;
        info!(
            "Client {} authenticated as '{}', layers {:?}",
            peer_addr,
            established.login,
            established.stack.indices()
        );

        run_session(stream, established.stack, self.config.connect_timeout()).await
    }
}

/// Drive one authenticated connection until the client leaves
async fn run_session(stream: TcpStream, stack: LayerStack, connect_timeout: Duration) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (mut incoming, _reader) = spawn_reader(read_half, stack.clone());
    let (cmd_tx, mut cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut mux = Multiplexer::new_server();
    let mut streams = StreamTable::new();
    // Dropped with the session, aborting any relay still running
    let mut relays = JoinSet::new();

    loop {
        tokio::select! {
            message = incoming.recv() => match message {
                Some(ReaderMessage::Frame(frame)) => match mux.handle_frame(frame)? {
                    MuxEvent::Opened { stream_id, destination } => {
                        let connection = attach_stream(&mut streams, stream_id, &cmd_tx);
                        relays.spawn(relay_to_destination(connection, destination, connect_timeout));
                    }
                    MuxEvent::Data { stream_id, payload } => {
                        forward_data(&mut mux, &mut streams, stream_id, payload);
                    }
                    MuxEvent::Closed { stream_id } => {
                        debug!("Client closed stream {}", stream_id);
                        remote_closed(&mux, &mut streams, stream_id);
                    }
                    MuxEvent::WindowUpdate { stream_id, increment } => {
                        grant_credit(&streams, stream_id, increment);
                    }
                    MuxEvent::GoAway => {
                        debug!("Client is going away");
                        return Ok(());
                    }
                    MuxEvent::None => {}
                },
                Some(ReaderMessage::Error(e)) => return Err(e),
                Some(ReaderMessage::Closed) | None => return Err(Error::ConnectionClosed),
            },

            Some(command) = cmd_rx.recv() => {
                apply_stream_command(&mut mux, &mut streams, command);
            }

            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }

        if mux.has_pending_frames() {
            send_frames(&mut write_half, &stack, mux.take_send_queue()).await?;
        }
    }
}

/// Connect a peer-opened stream to its destination and relay it.
///
/// A failed dial closes the stream, which the client reports to the
/// application as an unreachable destination.
async fn relay_to_destination(connection: StreamConnection, destination: Address, connect_timeout: Duration) {
    let stream_id = connection.id();
    let transport = TransportConfig::with_connect_timeout(connect_timeout);

    let target = match dial(&destination.to_string(), &transport).await {
        Ok(target) => target,
        Err(e) => {
            debug!("Stream {} failed to connect to {}: {}", stream_id, destination, e);
            connection.close().await;
            return;
        }
    };
    debug!("Stream {} connected to {}", stream_id, destination);

    if let Err(e) = connection.relay(target, &[]).await {
        debug!("Stream {} ended: {}", stream_id, e);
    }
}
