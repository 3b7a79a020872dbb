//! Stream multiplexer for the tunnel
//!
//! Tracks many logical streams over one negotiated connection. The
//! multiplexer does no I/O: incoming frames go through
//! [`Multiplexer::handle_frame`], outgoing frames pile up in a queue the
//! session drains with [`Multiplexer::take_send_queue`].

use super::{Frame, FrameType, TunnelError, TunnelStream, MAX_PAYLOAD_SIZE, MAX_STREAMS};
use crate::proxy::Address;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, trace};

/// What an incoming frame meant to the session
#[derive(Debug, PartialEq, Eq)]
pub enum MuxEvent {
    /// Peer opened a stream
    Opened { stream_id: u32, destination: Address },
    /// Data for a local stream
    Data { stream_id: u32, payload: Bytes },
    /// Peer closed its side of a stream
    Closed { stream_id: u32 },
    /// Peer returned send credit for a stream
    WindowUpdate { stream_id: u32, increment: u32 },
    /// Peer is shutting the connection down
    GoAway,
    /// Nothing for the session to do
    None,
}

/// Stream multiplexer
pub struct Multiplexer {
    /// Active streams
    streams: HashMap<u32, TunnelStream>,
    /// Next stream ID (odd for client, even for server)
    next_stream_id: u32,
    /// Whether this is the client side (odd stream IDs)
    is_client: bool,
    /// Pending frames to send
    send_queue: Vec<Frame>,
}

impl Multiplexer {
    /// Create a new client-side multiplexer
    pub fn new_client() -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1,
            is_client: true,
            send_queue: Vec::new(),
        }
    }

    /// Create a new server-side multiplexer
    pub fn new_server() -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 2,
            is_client: false,
            send_queue: Vec::new(),
        }
    }

    /// Open a new stream to a destination, queueing `StreamOpen`
    pub fn open_stream(&mut self, destination: &Address) -> Result<u32, TunnelError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(TunnelError::TooManyStreams(MAX_STREAMS));
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(2);

        self.streams.insert(stream_id, TunnelStream::new(stream_id));
        self.send_queue
            .push(Frame::stream_open(stream_id, &destination.to_string()));

        debug!("Opened stream {} to {}", stream_id, destination);
        Ok(stream_id)
    }

    /// Handle an incoming frame
    pub fn handle_frame(&mut self, frame: Frame) -> Result<MuxEvent, TunnelError> {
        match frame.frame_type {
            FrameType::Data => self.handle_data(frame.stream_id, frame.payload),
            FrameType::StreamOpen => self.handle_stream_open(frame.stream_id, &frame.payload),
            FrameType::StreamClose => Ok(self.handle_stream_close(frame.stream_id)),
            FrameType::Ping => {
                self.handle_ping(&frame.payload);
                Ok(MuxEvent::None)
            }
            FrameType::Pong => {
                trace!("Pong received");
                Ok(MuxEvent::None)
            }
            FrameType::GoAway => Ok(MuxEvent::GoAway),
            FrameType::WindowUpdate => self.handle_window_update(frame.stream_id, &frame.payload),
        }
    }

    fn handle_data(&mut self, stream_id: u32, payload: Bytes) -> Result<MuxEvent, TunnelError> {
        match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.can_recv() => {
                stream.consume_recv_window(payload.len())?;
                Ok(MuxEvent::Data { stream_id, payload })
            }
            Some(_) => Err(TunnelError::StreamClosed),
            None => {
                // Stale stream: tell the peer to stop
                trace!("Data for unknown stream {}", stream_id);
                self.send_queue.push(Frame::stream_close(stream_id));
                Ok(MuxEvent::None)
            }
        }
    }

    fn handle_stream_open(&mut self, stream_id: u32, payload: &[u8]) -> Result<MuxEvent, TunnelError> {
        // Peer-opened streams carry the peer's parity
        let peer_is_client = stream_id % 2 == 1;
        if stream_id == 0 || peer_is_client == self.is_client {
            return Err(TunnelError::InvalidFrame(format!(
                "Stream {} has the wrong parity",
                stream_id
            )));
        }
        if self.streams.contains_key(&stream_id) {
            return Err(TunnelError::InvalidFrame(format!(
                "Stream {} already open",
                stream_id
            )));
        }

        let destination = parse_destination(payload)?;

        if self.streams.len() >= MAX_STREAMS {
            debug!("Refusing stream {}: stream limit reached", stream_id);
            self.send_queue.push(Frame::stream_close(stream_id));
            return Ok(MuxEvent::None);
        }

        self.streams.insert(stream_id, TunnelStream::new(stream_id));
        Ok(MuxEvent::Opened {
            stream_id,
            destination,
        })
    }

    fn handle_stream_close(&mut self, stream_id: u32) -> MuxEvent {
        match self.streams.get_mut(&stream_id) {
            Some(stream) => {
                stream.close_remote();
                if stream.is_closed() {
                    self.streams.remove(&stream_id);
                }
                MuxEvent::Closed { stream_id }
            }
            None => MuxEvent::None,
        }
    }

    fn handle_window_update(&mut self, stream_id: u32, payload: &[u8]) -> Result<MuxEvent, TunnelError> {
        let increment = <[u8; 4]>::try_from(payload)
            .map(u32::from_be_bytes)
            .map_err(|_| TunnelError::InvalidFrame("Invalid window update".to_string()))?;

        match self.streams.get(&stream_id) {
            Some(stream) if stream.can_send() => Ok(MuxEvent::WindowUpdate {
                stream_id,
                increment,
            }),
            _ => Ok(MuxEvent::None),
        }
    }

    fn handle_ping(&mut self, payload: &[u8]) {
        if let Ok(data) = <[u8; 8]>::try_from(payload) {
            self.send_queue.push(Frame::pong(u64::from_be_bytes(data)));
        }
    }

    /// Queue data on a stream, split into frames of at most
    /// [`MAX_PAYLOAD_SIZE`] bytes
    pub fn send_data(&mut self, stream_id: u32, data: Bytes) -> Result<(), TunnelError> {
        let stream = self
            .streams
            .get(&stream_id)
            .ok_or(TunnelError::StreamNotFound(stream_id))?;
        if !stream.can_send() {
            return Err(TunnelError::StreamClosed);
        }

        let mut data = data;
        while data.len() > MAX_PAYLOAD_SIZE {
            let chunk = data.split_to(MAX_PAYLOAD_SIZE);
            self.send_queue.push(Frame::data(stream_id, chunk));
        }
        if !data.is_empty() {
            self.send_queue.push(Frame::data(stream_id, data));
        }
        Ok(())
    }

    /// Close a stream locally
    /// Marks the local side as closed and queues a STREAM_CLOSE frame.
    /// If both sides are closed, removes the stream from the map.
    pub fn close_stream_local(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.can_send() {
                return;
            }
            stream.close_local();
            self.send_queue.push(Frame::stream_close(stream_id));

            if stream.is_closed() {
                self.streams.remove(&stream_id);
            }
        }
    }

    /// Record data the application consumed, queueing a `WindowUpdate`
    /// once enough credit has accumulated
    pub fn release(&mut self, stream_id: u32, amount: usize) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if let Some(increment) = stream.release(amount) {
                trace!("Returning {} bytes of credit on stream {}", increment, stream_id);
                self.send_queue
                    .push(Frame::window_update(stream_id, increment));
            }
        }
    }

    /// Get frames ready to send
    pub fn take_send_queue(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.send_queue)
    }

    /// Check if there are frames to send
    pub fn has_pending_frames(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Get number of active streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether a stream is tracked
    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Send a ping frame
    pub fn send_ping(&mut self) {
        let mut buf = [0u8; 8];
        crate::crypto::random_bytes(&mut buf);
        self.send_queue.push(Frame::ping(u64::from_le_bytes(buf)));
    }

    /// Queue a go-away frame
    pub fn go_away(&mut self) {
        self.send_queue.push(Frame::go_away());
    }
}

/// Parse the `host:port` payload of a STREAM_OPEN frame
fn parse_destination(payload: &[u8]) -> Result<Address, TunnelError> {
    if payload.is_empty() {
        return Err(TunnelError::InvalidFrame("Empty destination".to_string()));
    }

    let text = std::str::from_utf8(payload)
        .map_err(|_| TunnelError::InvalidFrame("Destination is not UTF-8".to_string()))?;

    Address::parse(text)
        .map_err(|_| TunnelError::InvalidFrame(format!("Invalid destination: {}", text)))
}
