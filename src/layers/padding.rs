//! Traffic padding layer for anti-fingerprinting
//!
//! Encoded form:
//! ```text
//! +--------+--------+----------------+-----------------+
//! | Padding len (2B) |    Payload     | Random padding  |
//! +--------+--------+----------------+-----------------+
//! ```

use super::{Layer, LayerError};
use crate::crypto::random_bytes;
use serde::{Deserialize, Serialize};

/// Size of the padding length header
const HEADER_LEN: usize = 2;

/// Padding strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingStrategy {
    /// No padding
    None,
    /// Pad to fixed block size
    Block(usize),
    /// Random padding up to max bytes
    Random(usize),
    /// Pad to power of 2
    PowerOfTwo,
}

/// Padding configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingConfig {
    /// Strategy for outgoing messages
    pub strategy: PaddingStrategy,
    /// Minimum message size (pad small messages)
    pub min_size: usize,
    /// Maximum padding to add
    pub max_padding: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            strategy: PaddingStrategy::Block(64),
            min_size: 64,
            max_padding: 256,
        }
    }
}

impl PaddingConfig {
    /// Configuration that never pads (header only)
    pub fn none() -> Self {
        Self {
            strategy: PaddingStrategy::None,
            min_size: 0,
            max_padding: 0,
        }
    }

    /// Calculate padding for a given data length
    pub fn calculate_padding(&self, data_len: usize) -> usize {
        let base_padding = self.min_size.saturating_sub(data_len);

        let strategy_padding = match self.strategy {
            PaddingStrategy::None => 0,
            PaddingStrategy::Block(0) => 0,
            PaddingStrategy::Block(block_size) => {
                let total = data_len + base_padding;
                let remainder = total % block_size;
                if remainder == 0 {
                    0
                } else {
                    block_size - remainder
                }
            }
            PaddingStrategy::Random(max) => {
                let bound = max.min(self.max_padding);
                if bound == 0 {
                    0
                } else {
                    let mut buf = [0u8; 2];
                    random_bytes(&mut buf);
                    u16::from_le_bytes(buf) as usize % bound
                }
            }
            PaddingStrategy::PowerOfTwo => {
                let total = data_len + base_padding;
                let next_power = total.next_power_of_two();
                next_power - total
            }
        };

        (base_padding + strategy_padding)
            .min(self.max_padding)
            .min(u16::MAX as usize)
    }

    /// Generate random padding bytes
    pub fn generate_padding(&self, len: usize) -> Vec<u8> {
        let mut padding = vec![0u8; len];
        random_bytes(&mut padding);
        padding
    }
}

/// Appends random padding to normalize message sizes
#[derive(Debug, Clone, Default)]
pub struct PaddingLayer {
    config: PaddingConfig,
}

impl PaddingLayer {
    /// Create a padding layer
    pub fn new(config: PaddingConfig) -> Self {
        Self { config }
    }
}

impl Layer for PaddingLayer {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        let padding_len = self.config.calculate_padding(data.len());

        let mut out = Vec::with_capacity(HEADER_LEN + data.len() + padding_len);
        out.extend_from_slice(&(padding_len as u16).to_be_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&self.config.generate_padding(padding_len));
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        let truncated = LayerError::Truncated {
            layer: "padding",
            len: data.len(),
        };

        if data.len() < HEADER_LEN {
            return Err(truncated);
        }
        let padding_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let body = &data[HEADER_LEN..];
        if padding_len > body.len() {
            return Err(truncated);
        }

        Ok(body[..body.len() - padding_len].to_vec())
    }

    fn description(&self) -> String {
        format!("Padding layer ({:?}, max {} bytes)", self.config.strategy, self.config.max_padding)
    }
}
