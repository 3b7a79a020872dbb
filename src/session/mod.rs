//! Client and server sessions
//!
//! A session owns one handshake-established connection. Its task runs the
//! [`Multiplexer`] loop; a dedicated reader task decodes incoming messages
//! with the negotiated stack, and every logical stream is relayed by its
//! own task talking to the loop over channels.
//!
//! The loop never waits on a single stream. Relays take send credit before
//! queueing data and report what their application consumed, so a flow whose
//! reader stalls only stops its own window.
//!
//! ```text
//!  socket ──read_message──▶ reader task ──Frame──▶ session loop ──Bytes──▶ stream relay
//!  socket ◀─write_message── session loop ◀──StreamCommand────────────────── stream relay
//! ```

mod client;
mod server;

pub use client::{Client, Upstream};
pub use server::Server;

use crate::layers::LayerStack;
use crate::transport::{read_message, write_message};
use crate::tunnel::{Frame, Multiplexer, TunnelError, DEFAULT_WINDOW_SIZE};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::trace;

/// Capacity of the per-session channels
const CHANNEL_CAPACITY: usize = 256;

/// Read size for relayed sockets
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Request from a stream relay to its session loop
#[derive(Debug)]
pub(crate) enum StreamCommand {
    /// Send data on a stream
    Data { stream_id: u32, data: Bytes },
    /// The application consumed `len` bytes of peer data
    Consumed { stream_id: u32, len: usize },
    /// Close the local side of a stream
    Close { stream_id: u32 },
}

/// Message from the reader task
enum ReaderMessage {
    /// Decoded frame
    Frame(Frame),
    /// Read, layer decode or frame parse failure
    Error(Error),
    /// Peer closed the connection
    Closed,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Session-side ends of one stream
struct StreamSlot {
    /// Peer data for the relay; `None` once the peer closed its side
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// Send credit granted by the peer
    credit: Arc<Semaphore>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        // Wakes a relay still waiting for credit
        self.credit.close();
    }
}

type StreamTable = HashMap<u32, StreamSlot>;

/// Spawn the reader task of a session.
///
/// A decode failure ends the task: no partially decoded data is delivered.
fn spawn_reader<R>(mut reader: R, stack: LayerStack) -> (mpsc::Receiver<ReaderMessage>, AbortOnDrop)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        loop {
            let message = match read_message(&mut reader).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    let _ = tx.send(ReaderMessage::Closed).await;
                    break;
                }
                Err(e) => {
                    let _ = tx.send(ReaderMessage::Error(e.into())).await;
                    break;
                }
            };

            let frame = stack
                .decode(&message)
                .map_err(Error::from)
                .and_then(|plain| Frame::decode(&plain).map_err(Error::from));

            match frame {
                Ok(frame) => {
                    if tx.send(ReaderMessage::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReaderMessage::Error(e)).await;
                    break;
                }
            }
        }
    });

    (rx, AbortOnDrop(handle))
}

/// Encode frames with the session stack and write them out
async fn send_frames<W>(writer: &mut W, stack: &LayerStack, frames: Vec<Frame>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for frame in frames {
        trace!(
            "Sending {:?} on stream {} ({} bytes)",
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );
        let encoded = stack.encode(&frame.encode()?)?;
        write_message(writer, &encoded).await?;
    }
    Ok(())
}

/// Track a new stream and build the connection its relay uses
fn attach_stream(
    streams: &mut StreamTable,
    stream_id: u32,
    cmd_tx: &mpsc::Sender<StreamCommand>,
) -> StreamConnection {
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let credit = Arc::new(Semaphore::new(DEFAULT_WINDOW_SIZE as usize));
    streams.insert(
        stream_id,
        StreamSlot {
            data_tx: Some(data_tx),
            credit: Arc::clone(&credit),
        },
    );
    StreamConnection::new(stream_id, data_rx, cmd_tx.clone(), credit)
}

/// Hand incoming data to the stream's relay without waiting on it.
///
/// The receive window bounds what can queue up. Data nobody is left to read
/// is dropped, its credit returned, and the local side closed.
fn forward_data(mux: &mut Multiplexer, streams: &mut StreamTable, stream_id: u32, payload: Bytes) {
    let len = payload.len();
    let delivered = streams
        .get(&stream_id)
        .and_then(|slot| slot.data_tx.as_ref())
        .map(|tx| tx.send(payload).is_ok())
        .unwrap_or(false);

    if !delivered {
        trace!("Relay of stream {} is gone, closing", stream_id);
        if let Some(slot) = streams.get_mut(&stream_id) {
            slot.data_tx = None;
        }
        mux.release(stream_id, len);
        mux.close_stream_local(stream_id);
        forget_if_closed(mux, streams, stream_id);
    }
}

/// The peer closed its side; the relay sees end of data
fn remote_closed(mux: &Multiplexer, streams: &mut StreamTable, stream_id: u32) {
    if let Some(slot) = streams.get_mut(&stream_id) {
        slot.data_tx = None;
    }
    forget_if_closed(mux, streams, stream_id);
}

fn forget_if_closed(mux: &Multiplexer, streams: &mut StreamTable, stream_id: u32) {
    if !mux.has_stream(stream_id) {
        streams.remove(&stream_id);
    }
}

/// Add credit the peer returned, never beyond one window
fn grant_credit(streams: &StreamTable, stream_id: u32, increment: u32) {
    if let Some(slot) = streams.get(&stream_id) {
        let room = (DEFAULT_WINDOW_SIZE as usize).saturating_sub(slot.credit.available_permits());
        slot.credit.add_permits((increment as usize).min(room));
    }
}

/// Apply a relay's request to the multiplexer
fn apply_stream_command(mux: &mut Multiplexer, streams: &mut StreamTable, command: StreamCommand) {
    match command {
        StreamCommand::Data { stream_id, data } => {
            if let Err(e) = mux.send_data(stream_id, data) {
                trace!("Dropping data for stream {}: {}", stream_id, e);
            }
        }
        StreamCommand::Consumed { stream_id, len } => mux.release(stream_id, len),
        StreamCommand::Close { stream_id } => {
            mux.close_stream_local(stream_id);
            forget_if_closed(mux, streams, stream_id);
        }
    }
}

/// Send `data` on a stream, waiting for peer credit one chunk at a time
async fn send_with_credit(
    cmd_tx: &mpsc::Sender<StreamCommand>,
    credit: &Semaphore,
    stream_id: u32,
    mut data: Bytes,
) -> Result<()> {
    while !data.is_empty() {
        let chunk = data.split_to(data.len().min(RELAY_BUFFER_SIZE));
        credit
            .acquire_many(chunk.len() as u32)
            .await
            .map_err(|_| TunnelError::StreamClosed)?
            .forget();
        cmd_tx
            .send(StreamCommand::Data {
                stream_id,
                data: chunk,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
    }
    Ok(())
}

/// Tunnel side of one logical stream
#[derive(Debug)]
pub struct StreamConnection {
    stream_id: u32,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    cmd_tx: mpsc::Sender<StreamCommand>,
    credit: Arc<Semaphore>,
    closed: bool,
}

impl StreamConnection {
    fn new(
        stream_id: u32,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        cmd_tx: mpsc::Sender<StreamCommand>,
        credit: Arc<Semaphore>,
    ) -> Self {
        Self {
            stream_id,
            data_rx,
            cmd_tx,
            credit,
            closed: false,
        }
    }

    /// Stream ID
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Send data to the peer, waiting while the peer's window is full
    pub async fn send(&self, data: Bytes) -> Result<()> {
        send_with_credit(&self.cmd_tx, &self.credit, self.stream_id, data).await
    }

    /// Next chunk from the peer; `None` once the peer closed its side
    pub async fn recv(&mut self) -> Option<Bytes> {
        let data = self.data_rx.recv().await?;
        let _ = self
            .cmd_tx
            .send(StreamCommand::Consumed {
                stream_id: self.stream_id,
                len: data.len(),
            })
            .await;
        Some(data)
    }

    /// Close the local side
    pub async fn close(mut self) {
        self.closed = true;
        let _ = self
            .cmd_tx
            .send(StreamCommand::Close {
                stream_id: self.stream_id,
            })
            .await;
    }

    /// Relay between a local socket and this stream until both directions end.
    ///
    /// `initial` is sent to the peer before anything read from the socket.
    pub async fn relay<S>(mut self, socket: S, initial: &[u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !initial.is_empty() {
            self.send(Bytes::copy_from_slice(initial)).await?;
        }

        let (mut read_half, mut write_half) = tokio::io::split(socket);
        let stream_id = self.stream_id;
        let cmd_tx = &self.cmd_tx;
        let credit = &self.credit;
        let data_rx = &mut self.data_rx;

        let upstream = async {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            let result: Result<()> = loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                let data = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = send_with_credit(cmd_tx, credit, stream_id, data).await {
                    break Err(e);
                }
            };
            let _ = cmd_tx.send(StreamCommand::Close { stream_id }).await;
            result
        };

        let downstream = async {
            while let Some(data) = data_rx.recv().await {
                write_half.write_all(&data).await?;
                let len = data.len();
                let _ = cmd_tx.send(StreamCommand::Consumed { stream_id, len }).await;
            }
            write_half.shutdown().await.ok();
            Ok::<_, Error>(())
        };

        let (up, down) = tokio::join!(upstream, downstream);
        self.closed = true;
        up.and(down)
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cmd_tx.try_send(StreamCommand::Close {
                stream_id: self.stream_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{LayerCatalog, XorLayer};
    use crate::tunnel::MuxEvent;
    use std::time::Duration;
    use tokio::io::duplex;

    fn xor_stack() -> LayerStack {
        let catalog = LayerCatalog::new().with(XorLayer::new(b"K").unwrap()).unwrap();
        LayerStack::new(&catalog, &[0]).unwrap()
    }

    #[tokio::test]
    async fn test_frames_cross_the_stack() {
        let (mut writer, reader) = duplex(4096);
        let stack = xor_stack();
        let (mut rx, _reader) = spawn_reader(reader, stack.clone());

        send_frames(
            &mut writer,
            &stack,
            vec![Frame::data(1, Bytes::from_static(b"ping")), Frame::go_away()],
        )
        .await
        .unwrap();
        drop(writer);

        match rx.recv().await {
            Some(ReaderMessage::Frame(frame)) => assert_eq!(&frame.payload[..], b"ping"),
            _ => panic!("expected data frame"),
        }
        assert!(matches!(rx.recv().await, Some(ReaderMessage::Frame(_))));
        assert!(matches!(rx.recv().await, Some(ReaderMessage::Closed)));
    }

    #[tokio::test]
    async fn test_undecodable_message_ends_reader() {
        let (mut writer, reader) = duplex(4096);
        let (mut rx, _reader) = spawn_reader(reader, xor_stack());

        // Raw frame without the XOR layer: type byte becomes garbage
        let raw = Frame::data(1, Bytes::from_static(b"x")).encode().unwrap();
        write_message(&mut writer, &raw).await.unwrap();

        assert!(matches!(rx.recv().await, Some(ReaderMessage::Error(_))));
        assert!(rx.recv().await.is_none());
    }

    fn connection(stream_id: u32, window: usize) -> (
        mpsc::UnboundedSender<Bytes>,
        mpsc::Receiver<StreamCommand>,
        Arc<Semaphore>,
        StreamConnection,
    ) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let credit = Arc::new(Semaphore::new(window));
        let conn = StreamConnection::new(stream_id, data_rx, cmd_tx, Arc::clone(&credit));
        (data_tx, cmd_rx, credit, conn)
    }

    #[tokio::test]
    async fn test_relay_moves_both_directions() {
        let (data_tx, mut cmd_rx, _credit, conn) = connection(5, 1024);

        let (mut app, socket) = duplex(1024);
        let relay = tokio::spawn(async move { conn.relay(socket, b"early").await });

        match cmd_rx.recv().await {
            Some(StreamCommand::Data { stream_id: 5, data }) => assert_eq!(&data[..], b"early"),
            other => panic!("unexpected {:?}", other),
        }

        app.write_all(b"ping").await.unwrap();
        match cmd_rx.recv().await {
            Some(StreamCommand::Data { stream_id: 5, data }) => assert_eq!(&data[..], b"ping"),
            other => panic!("unexpected {:?}", other),
        }

        data_tx.send(Bytes::from_static(b"pong")).unwrap();
        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert!(matches!(
            cmd_rx.recv().await,
            Some(StreamCommand::Consumed { stream_id: 5, len: 4 })
        ));

        // Peer closes, then the application closes
        drop(data_tx);
        let mut rest = Vec::new();
        app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(app);

        assert!(matches!(
            cmd_rx.recv().await,
            Some(StreamCommand::Close { stream_id: 5 })
        ));
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_waits_for_credit() {
        let (_data_tx, mut cmd_rx, credit, conn) = connection(3, 4);

        let sender = tokio::spawn(async move {
            conn.send(Bytes::from_static(b"12345678")).await.unwrap();
            conn
        });

        let early = tokio::time::timeout(Duration::from_millis(100), cmd_rx.recv()).await;
        assert!(early.is_err(), "data sent without credit");

        credit.add_permits(4);
        match cmd_rx.recv().await {
            Some(StreamCommand::Data { stream_id: 3, data }) => assert_eq!(&data[..], b"12345678"),
            other => panic!("unexpected {:?}", other),
        }
        let _conn = sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_forgotten_stream_wakes_blocked_sender() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(64);
        let mut streams = StreamTable::new();
        let conn = attach_stream(&mut streams, 1, &cmd_tx);

        // Use up the window, then lose the stream
        conn.send(Bytes::from(vec![0u8; DEFAULT_WINDOW_SIZE as usize]))
            .await
            .unwrap();
        let blocked = tokio::spawn(async move { conn.send(Bytes::from_static(b"x")).await });
        streams.clear();

        assert!(blocked.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_hold_up_others() {
        let mut mux = Multiplexer::new_server();
        mux.handle_frame(Frame::stream_open(1, "10.0.0.1:80")).unwrap();
        mux.handle_frame(Frame::stream_open(3, "10.0.0.2:80")).unwrap();
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let mut streams = StreamTable::new();
        let _stalled = attach_stream(&mut streams, 1, &cmd_tx);
        let mut active = attach_stream(&mut streams, 3, &cmd_tx);

        // A full window for the unread stream is queued without waiting
        let chunk = Bytes::from(vec![0u8; crate::tunnel::MAX_PAYLOAD_SIZE]);
        let mut queued = 0;
        while queued + chunk.len() <= DEFAULT_WINDOW_SIZE as usize {
            let event = mux.handle_frame(Frame::data(1, chunk.clone())).unwrap();
            let MuxEvent::Data { stream_id, payload } = event else {
                panic!("expected data");
            };
            forward_data(&mut mux, &mut streams, stream_id, payload);
            queued += chunk.len();
        }

        forward_data(&mut mux, &mut streams, 3, Bytes::from_static(b"hello"));
        assert_eq!(&active.recv().await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_dropped_connection_closes_stream() {
        let (_data_tx, mut cmd_rx, _credit, conn) = connection(9, 8);
        drop(conn);

        assert!(matches!(
            cmd_rx.recv().await,
            Some(StreamCommand::Close { stream_id: 9 })
        ));
    }

    #[test]
    fn test_close_command_keeps_half_open_stream() {
        let mut mux = Multiplexer::new_client();
        let id = mux
            .open_stream(&crate::proxy::Address::Ipv4([1, 2, 3, 4], 80))
            .unwrap();
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let mut streams = StreamTable::new();
        let _conn = attach_stream(&mut streams, id, &cmd_tx);

        apply_stream_command(&mut mux, &mut streams, StreamCommand::Close { stream_id: id });
        // Remote side still open: keep delivering its data
        assert!(streams.contains_key(&id));
        assert!(mux.has_stream(id));

        // Both sides closed: the slot goes away
        mux.handle_frame(Frame::stream_close(id)).unwrap();
        remote_closed(&mux, &mut streams, id);
        assert!(!streams.contains_key(&id));
    }

    #[test]
    fn test_granted_credit_is_capped() {
        let mut streams = StreamTable::new();
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let conn = attach_stream(&mut streams, 1, &cmd_tx);
        conn.credit.try_acquire_many(100).unwrap().forget();

        grant_credit(&streams, 1, u32::MAX);
        assert_eq!(conn.credit.available_permits(), DEFAULT_WINDOW_SIZE as usize);
    }
}
