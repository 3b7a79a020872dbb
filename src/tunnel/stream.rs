//! Per-stream state tracked by the multiplexer

use super::{TunnelError, DEFAULT_WINDOW_SIZE};

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// A multiplexed stream within the tunnel
#[derive(Debug)]
pub struct TunnelStream {
    id: u32,
    state: StreamState,
    /// Bytes the peer may still send before it needs more credit
    recv_window: u32,
    /// Bytes consumed locally but not yet handed back to the peer
    unacked: u32,
}

impl TunnelStream {
    /// Create an open stream with a full receive window
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            recv_window: DEFAULT_WINDOW_SIZE,
            unacked: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Remaining receive credit
    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    /// Account for incoming data; the peer must stay within its credit
    pub fn consume_recv_window(&mut self, amount: usize) -> Result<(), TunnelError> {
        let amount = u32::try_from(amount).map_err(|_| TunnelError::FlowControl(self.id))?;
        if amount > self.recv_window {
            return Err(TunnelError::FlowControl(self.id));
        }
        self.recv_window -= amount;
        Ok(())
    }

    /// Record bytes the application consumed.
    ///
    /// Returns the increment to announce once half a window has piled up.
    pub fn release(&mut self, amount: usize) -> Option<u32> {
        let amount = u32::try_from(amount).unwrap_or(u32::MAX);
        self.unacked = self
            .unacked
            .saturating_add(amount)
            .min(DEFAULT_WINDOW_SIZE - self.recv_window);

        if !self.can_recv() || self.unacked < DEFAULT_WINDOW_SIZE / 2 {
            return None;
        }
        let increment = std::mem::take(&mut self.unacked);
        self.recv_window += increment;
        Some(increment)
    }

    /// Close local side
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Close remote side
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => self.state,
        };
    }

    /// Check if stream is fully closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_states() {
        let mut stream = TunnelStream::new(1);
        assert_eq!(stream.state(), StreamState::Open);

        stream.close_local();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.close_remote();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_remote_close_first() {
        let mut stream = TunnelStream::new(2);
        stream.close_remote();
        assert!(stream.can_send());
        assert!(!stream.can_recv());

        // Closing twice is a no-op
        stream.close_remote();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn test_recv_window_enforced() {
        let mut stream = TunnelStream::new(1);
        stream
            .consume_recv_window(DEFAULT_WINDOW_SIZE as usize - 10)
            .unwrap();
        assert_eq!(stream.recv_window(), 10);

        assert!(matches!(
            stream.consume_recv_window(11),
            Err(TunnelError::FlowControl(1))
        ));
        stream.consume_recv_window(10).unwrap();
    }

    #[test]
    fn test_release_returns_credit_in_batches() {
        let mut stream = TunnelStream::new(1);
        let half = (DEFAULT_WINDOW_SIZE / 2) as usize;
        stream.consume_recv_window(DEFAULT_WINDOW_SIZE as usize).unwrap();

        assert_eq!(stream.release(half - 1), None);
        assert_eq!(stream.release(1), Some(DEFAULT_WINDOW_SIZE / 2));
        assert_eq!(stream.recv_window(), DEFAULT_WINDOW_SIZE / 2);

        // Never grants more than was received
        stream.consume_recv_window(100).unwrap();
        assert_eq!(
            stream.release(DEFAULT_WINDOW_SIZE as usize * 4),
            Some(DEFAULT_WINDOW_SIZE / 2 + 100)
        );
        assert_eq!(stream.recv_window(), DEFAULT_WINDOW_SIZE);
        assert_eq!(stream.release(1), None);
    }
}
