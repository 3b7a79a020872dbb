//! Client session: local ingress plus one multiplexed tunnel

use super::{
    apply_stream_command, attach_stream, forward_data, grant_credit, remote_closed, send_frames,
    spawn_reader, ReaderMessage, StreamConnection, StreamTable, CHANNEL_CAPACITY,
};
use crate::config::ClientConfig;
use crate::layers::{LayerCatalog, LayerStack};
use crate::protocol::{ClientHandshake, ClientHello, KEEPALIVE_INTERVAL};
use crate::proxy::{Address, ProxyConnection};
use crate::routing::{Route, RoutingPolicy};
use crate::transport::{dial, TransportConfig};
use crate::tunnel::{Multiplexer, MuxEvent, TunnelError};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(feature = "http-proxy")]
use crate::proxy::HttpProxyServer;
#[cfg(feature = "socks5")]
use crate::proxy::Socks5Server;

/// Request to open a new stream through the tunnel
struct OpenStreamRequest {
    destination: Address,
    response_tx: oneshot::Sender<Result<StreamConnection>>,
}

/// Sending side of a running tunnel task
#[derive(Clone)]
struct TunnelHandle {
    open_tx: mpsc::Sender<OpenStreamRequest>,
}

impl TunnelHandle {
    fn is_closed(&self) -> bool {
        self.open_tx.is_closed()
    }

    async fn open_stream(&self, destination: Address) -> Result<StreamConnection> {
        let (response_tx, response_rx) = oneshot::channel();

        self.open_tx
            .send(OpenStreamRequest {
                destination,
                response_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;

        response_rx.await.map_err(|_| TunnelError::Disconnected)?
    }
}

/// Where a flow's bytes go after ingress
#[derive(Debug)]
pub enum Upstream {
    /// Plain TCP connection straight to the destination
    Direct(TcpStream),
    /// Logical stream inside the tunnel
    Tunnel(StreamConnection),
}

impl Upstream {
    /// Relay an accepted application connection until both sides finish
    pub async fn relay(self, mut inbound: TcpStream, initial: &[u8]) -> Result<()> {
        match self {
            Upstream::Direct(mut outbound) => {
                if !initial.is_empty() {
                    outbound.write_all(initial).await?;
                }
                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
                Ok(())
            }
            Upstream::Tunnel(stream) => stream.relay(inbound, initial).await,
        }
    }

    /// Whether the flow goes through the tunnel
    pub fn is_tunneled(&self) -> bool {
        matches!(self, Upstream::Tunnel(_))
    }
}

/// The local side of the VPN.
///
/// Holds at most one tunnel at a time. A tunnel that went down is
/// re-established by the next flow that needs it.
pub struct Client {
    config: ClientConfig,
    catalog: Arc<LayerCatalog>,
    policy: RoutingPolicy,
    tunnel: Mutex<Option<TunnelHandle>>,
}

impl Client {
    /// Create a client; every configured layer index must exist in `catalog`
    pub fn new(config: ClientConfig, catalog: Arc<LayerCatalog>, policy: RoutingPolicy) -> Result<Self> {
        catalog
            .validate(&config.layers)
            .map_err(|e| Error::Config(format!("client layers: {}", e)))?;
        catalog
            .validate(&[config.bootstrap_layer])
            .map_err(|e| Error::Config(format!("bootstrap layer: {}", e)))?;

        Ok(Self {
            config,
            catalog,
            policy,
            tunnel: Mutex::new(None),
        })
    }

    /// Establish the tunnel, replacing any existing one
    pub async fn connect(&self) -> Result<()> {
        let mut tunnel = self.tunnel.lock().await;
        *tunnel = Some(self.establish().await?);
        Ok(())
    }

    /// Whether a tunnel is currently up
    pub async fn is_connected(&self) -> bool {
        matches!(self.tunnel.lock().await.as_ref(), Some(handle) if !handle.is_closed())
    }

    /// Tear the tunnel down; the peer is sent GO_AWAY
    pub async fn disconnect(&self) {
        if self.tunnel.lock().await.take().is_some() {
            info!("Disconnecting from {}", self.config.server);
        }
    }

    async fn tunnel(&self) -> Result<TunnelHandle> {
        let mut tunnel = self.tunnel.lock().await;
        match tunnel.as_ref() {
            Some(handle) if !handle.is_closed() => return Ok(handle.clone()),
            Some(_) => info!("Tunnel is down, reconnecting to {}", self.config.server),
            None => {}
        }

        let handle = self.establish().await?;
        *tunnel = Some(handle.clone());
        Ok(handle)
    }

    async fn establish(&self) -> Result<TunnelHandle> {
        let hello = ClientHello::from_credentials(
            &self.config.login,
            &self.config.password,
            self.config.layers.clone(),
            self.config.bootstrap_layer,
        );
        let mut handshake = ClientHandshake::new(
            Arc::clone(&self.catalog),
            hello,
            self.config.handshake_timeout(),
        );
        let transport = TransportConfig::with_connect_timeout(self.config.connect_timeout());

        info!("Connecting to {}...", self.config.server);
        let (stream, stack) = handshake.connect(&self.config.server, &transport).await?;
        info!("Tunnel established, layers {:?}", stack.indices());

        let (open_tx, open_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            match run_tunnel(stream, stack, open_rx).await {
                Ok(()) => info!("Tunnel closed"),
                Err(e) => error!("Tunnel error: {}", e),
            }
        });

        Ok(TunnelHandle { open_tx })
    }

    /// Open the upstream of a flow according to the routing policy
    pub async fn open_upstream(&self, destination: &Address) -> Result<Upstream> {
        match self.policy.route(destination) {
            Route::Direct => {
                debug!("Routing {} directly", destination);
                let transport = TransportConfig::with_connect_timeout(self.config.connect_timeout());
                let stream = dial(&destination.to_string(), &transport).await?;
                Ok(Upstream::Direct(stream))
            }
            Route::Tunnel => {
                debug!("Routing {} through the tunnel", destination);
                let tunnel = self.tunnel().await?;
                let stream = tunnel.open_stream(destination.clone()).await?;
                Ok(Upstream::Tunnel(stream))
            }
        }
    }

    /// Serve one ingress request: open its upstream, answer, then relay
    pub async fn dispatch(&self, mut connection: ProxyConnection) -> Result<()> {
        let upstream = match self.open_upstream(&connection.destination).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Cannot reach {}: {}", connection.destination, e);
                let _ = connection.refuse().await;
                return Err(e);
            }
        };

        connection.accept().await?;
        upstream.relay(connection.stream, &connection.buffered).await
    }

    /// Run the configured ingress listeners until one of them fails
    pub async fn listen(self: Arc<Self>) -> Result<()> {
        let mut listeners: JoinSet<Result<()>> = JoinSet::new();

        #[cfg(feature = "socks5")]
        {
            if let Some(addr) = &self.config.socks5_listen {
                let server = Socks5Server::bind(addr).await?;
                listeners.spawn(Arc::clone(&self).serve_socks5(server));
            }
        }

        #[cfg(feature = "http-proxy")]
        {
            if let Some(addr) = &self.config.http_listen {
                let server = HttpProxyServer::bind(addr).await?;
                listeners.spawn(Arc::clone(&self).serve_http(server));
            }
        }

        if listeners.is_empty() {
            return Err(Error::Config("no ingress listener enabled".to_string()));
        }

        while let Some(result) = listeners.join_next().await {
            result.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        }
        Ok(())
    }

    /// Dispatch every connection accepted by a SOCKS5 listener
    #[cfg(feature = "socks5")]
    pub async fn serve_socks5(self: Arc<Self>, server: Socks5Server) -> Result<()> {
        server
            .run(move |connection| {
                let client = Arc::clone(&self);
                async move { client.dispatch(connection).await }
            })
            .await?;
        Ok(())
    }

    /// Dispatch every connection accepted by an HTTP CONNECT listener
    #[cfg(feature = "http-proxy")]
    pub async fn serve_http(self: Arc<Self>, server: HttpProxyServer) -> Result<()> {
        server
            .run(move |connection| {
                let client = Arc::clone(&self);
                async move { client.dispatch(connection).await }
            })
            .await?;
        Ok(())
    }
}

/// Drive one tunnel connection until the server leaves or the client drops
/// its handle
async fn run_tunnel(
    stream: TcpStream,
    stack: LayerStack,
    mut open_rx: mpsc::Receiver<OpenStreamRequest>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (mut incoming, _reader) = spawn_reader(read_half, stack.clone());
    let (cmd_tx, mut cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut mux = Multiplexer::new_client();
    let mut streams = StreamTable::new();

    let period = Duration::from_secs(KEEPALIVE_INTERVAL);
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            message = incoming.recv() => match message {
                Some(ReaderMessage::Frame(frame)) => match mux.handle_frame(frame)? {
                    MuxEvent::Data { stream_id, payload } => {
                        forward_data(&mut mux, &mut streams, stream_id, payload);
                    }
                    MuxEvent::Closed { stream_id } => {
                        debug!("Server closed stream {}", stream_id);
                        remote_closed(&mux, &mut streams, stream_id);
                    }
                    MuxEvent::WindowUpdate { stream_id, increment } => {
                        grant_credit(&streams, stream_id, increment);
                    }
                    MuxEvent::Opened { stream_id, destination } => {
                        debug!("Refusing server-opened stream {} to {}", stream_id, destination);
                        mux.close_stream_local(stream_id);
                    }
                    MuxEvent::GoAway => {
                        info!("Server is going away");
                        return Ok(());
                    }
                    MuxEvent::None => {}
                },
                Some(ReaderMessage::Error(e)) => return Err(e),
                Some(ReaderMessage::Closed) | None => {
                    info!("Server disconnected");
                    return Ok(());
                }
            },

            request = open_rx.recv() => match request {
                Some(request) => {
                    let result = mux
                        .open_stream(&request.destination)
                        .map(|stream_id| attach_stream(&mut streams, stream_id, &cmd_tx));
                    // STREAM_OPEN is flushed below, before any data the
                    // requester can queue
                    let _ = request.response_tx.send(result.map_err(Error::from));
                }
                None => {
                    mux.go_away();
                    send_frames(&mut write_half, &stack, mux.take_send_queue()).await?;
                    return Ok(());
                }
            },

            Some(command) = cmd_rx.recv() => {
                apply_stream_command(&mut mux, &mut streams, command);
            }

            _ = keepalive.tick() => mux.send_ping(),
        }

        if mux.has_pending_frames() {
            send_frames(&mut write_half, &stack, mux.take_send_queue()).await?;
        }
    }
}
