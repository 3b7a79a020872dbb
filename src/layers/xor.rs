//! Repeating-key XOR obfuscation

use super::{Layer, LayerError};
use std::fmt;

/// XOR every byte with a repeating pre-shared key.
///
/// The key restarts at offset 0 for each message, so messages can be
/// decoded independently of one another.
#[derive(Clone)]
pub struct XorLayer {
    key: Vec<u8>,
}

impl XorLayer {
    /// Create a XOR layer; the key must not be empty
    pub fn new(key: &[u8]) -> Result<Self, LayerError> {
        if key.is_empty() {
            return Err(LayerError::InvalidKey("XOR key is empty".to_string()));
        }
        Ok(Self { key: key.to_vec() })
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl Layer for XorLayer {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        Ok(self.apply(data))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        Ok(self.apply(data))
    }

    fn description(&self) -> String {
        format!("XOR layer ({}-byte key)", self.key.len())
    }
}

impl fmt::Debug for XorLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XorLayer")
            .field("key_len", &self.key.len())
            .finish()
    }
}
