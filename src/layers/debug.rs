//! Pass-through layer with optional traffic tracing

use super::{Layer, LayerError};
use tracing::trace;

/// Number of leading bytes shown in traces
const PREVIEW_LEN: usize = 16;

/// Identity transform that can log what passes through it
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugLayer {
    log_encode: bool,
    log_decode: bool,
}

impl DebugLayer {
    /// Create a debug layer, choosing which directions are traced
    pub fn new(log_encode: bool, log_decode: bool) -> Self {
        Self {
            log_encode,
            log_decode,
        }
    }
}

impl Layer for DebugLayer {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        if self.log_encode {
            trace!(
                "debug layer encode: {} bytes {:02x?}",
                data.len(),
                &data[..PREVIEW_LEN.min(data.len())]
            );
        }
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        if self.log_decode {
            trace!(
                "debug layer decode: {} bytes {:02x?}",
                data.len(),
                &data[..PREVIEW_LEN.min(data.len())]
            );
        }
        Ok(data.to_vec())
    }

    fn description(&self) -> String {
        format!(
            "Debug layer (pass-through, log encode: {}, log decode: {})",
            self.log_encode, self.log_decode
        )
    }
}
