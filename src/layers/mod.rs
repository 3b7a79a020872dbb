//! Reversible byte transforms used to disguise tunnel traffic
//!
//! Provides:
//! - The [`Layer`] contract (`decode(encode(x)) == x`)
//! - A fixed-at-startup [`LayerCatalog`] addressed by index on the wire
//! - A per-session [`LayerStack`] composed from catalog indices
//!
//! ## Ordering
//!
//! The first index of a stack is the innermost layer: `encode` applies the
//! layers in listed order and `decode` applies them in reverse, so
//! `[xor, padding]` puts padding on the outside of the XOR-ed payload.

mod aead;
mod debug;
mod padding;
mod xor;

pub use aead::AeadLayer;
pub use debug::DebugLayer;
pub use padding::{PaddingConfig, PaddingLayer, PaddingStrategy};
pub use xor::XorLayer;

use crate::config::LayersConfig;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Wire representation of a catalog entry
pub type LayerIndex = u8;

/// Maximum number of layers a catalog can hold (indices are one byte)
pub const MAX_CATALOG_SIZE: usize = LayerIndex::MAX as usize + 1;

/// Layer errors
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("Unknown layer index {index} (catalog has {size} layers)")]
    UnknownLayer { index: LayerIndex, size: usize },

    #[error("Layer catalog is full ({0} layers)")]
    CatalogFull(usize),

    #[error("Invalid layer key: {0}")]
    InvalidKey(String),

    #[error("Truncated message in {layer}: {len} bytes")]
    Truncated { layer: &'static str, len: usize },

    #[error("Message failed authentication")]
    Authentication,

    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// A single reversible byte transform.
///
/// Implementations are shared read-only across sessions, so any internal
/// state must be safe to use from many tasks at once.
pub trait Layer: Send + Sync {
    /// Transform an outbound message
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError>;

    /// Invert [`Layer::encode`]
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError>;

    /// Human-readable description for `--list-layers` and logs
    fn description(&self) -> String;
}

/// Ordered set of available layers, identical on client and server
#[derive(Clone, Default)]
pub struct LayerCatalog {
    layers: Vec<Arc<dyn Layer>>,
}

impl LayerCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Build the standard catalog from configuration.
    ///
    /// Order is fixed: debug, xor, padding, then aead when a passphrase is set.
    pub fn from_config(config: &LayersConfig) -> Result<Self, LayerError> {
        let mut catalog = Self::new()
            .with(DebugLayer::new(false, false))?
            .with(XorLayer::new(config.xor_key.as_bytes())?)?
            .with(PaddingLayer::new(config.padding.clone()))?;

        if let Some(passphrase) = &config.aead_passphrase {
            catalog.push(AeadLayer::from_passphrase(passphrase.as_bytes())?)?;
        }

        Ok(catalog)
    }

    /// Append a layer, returning its index
    pub fn push<L: Layer + 'static>(&mut self, layer: L) -> Result<LayerIndex, LayerError> {
        if self.layers.len() >= MAX_CATALOG_SIZE {
            return Err(LayerError::CatalogFull(self.layers.len()));
        }
        self.layers.push(Arc::new(layer));
        Ok((self.layers.len() - 1) as LayerIndex)
    }

    /// Builder-style [`LayerCatalog::push`]
    pub fn with<L: Layer + 'static>(mut self, layer: L) -> Result<Self, LayerError> {
        self.push(layer)?;
        Ok(self)
    }

    /// Look up a layer by index
    pub fn get(&self, index: LayerIndex) -> Result<&Arc<dyn Layer>, LayerError> {
        self.layers
            .get(index as usize)
            .ok_or(LayerError::UnknownLayer {
                index,
                size: self.layers.len(),
            })
    }

    /// Check that every index refers to a catalog entry
    pub fn validate(&self, indices: &[LayerIndex]) -> Result<(), LayerError> {
        indices.iter().try_for_each(|&index| self.get(index).map(|_| ()))
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// `(index, description)` for every layer
    pub fn descriptions(&self) -> Vec<(LayerIndex, String)> {
        self.layers
            .iter()
            .enumerate()
            .map(|(i, layer)| (i as LayerIndex, layer.description()))
            .collect()
    }
}

impl fmt::Debug for LayerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|l| l.description()))
            .finish()
    }
}

/// The negotiated encode/decode pipeline of one session.
///
/// Immutable once built; dropped with the session.
#[derive(Clone)]
pub struct LayerStack {
    indices: Vec<LayerIndex>,
    layers: Vec<Arc<dyn Layer>>,
}

impl LayerStack {
    /// Compose a stack from catalog indices, innermost first
    pub fn new(catalog: &LayerCatalog, indices: &[LayerIndex]) -> Result<Self, LayerError> {
        let layers = indices
            .iter()
            .map(|&index| catalog.get(index).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            indices: indices.to_vec(),
            layers,
        })
    }

    /// A stack with a single layer (used for the bootstrap handshake)
    pub fn single(catalog: &LayerCatalog, index: LayerIndex) -> Result<Self, LayerError> {
        Self::new(catalog, &[index])
    }

    /// The identity stack
    pub fn empty() -> Self {
        Self {
            indices: Vec::new(),
            layers: Vec::new(),
        }
    }

    /// Catalog indices of this stack, innermost first
    pub fn indices(&self) -> &[LayerIndex] {
        &self.indices
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether this is the identity stack
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Apply every layer's encode, innermost first
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, LayerError> {
        let mut data = payload.to_vec();
        for layer in &self.layers {
            data = layer.encode(&data)?;
        }
        Ok(data)
    }

    /// Apply every layer's decode, outermost first
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, LayerError> {
        let mut data = payload.to_vec();
        for layer in self.layers.iter().rev() {
            data = layer.decode(&data)?;
        }
        Ok(data)
    }
}

impl fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStack")
            .field("indices", &self.indices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_catalog() -> LayerCatalog {
        LayerCatalog::new()
            .with(DebugLayer::new(false, false))
            .unwrap()
            .with(XorLayer::new(b"K").unwrap())
            .unwrap()
            .with(PaddingLayer::new(PaddingConfig::default()))
            .unwrap()
            .with(AeadLayer::from_passphrase(b"shared secret").unwrap())
            .unwrap()
    }

    #[test]
    fn test_empty_stack_is_identity() {
        let stack = LayerStack::empty();
        assert_eq!(stack.encode(b"ping").unwrap(), b"ping");
        assert_eq!(stack.decode(b"ping").unwrap(), b"ping");
    }

    #[test]
    fn test_stack_rejects_unknown_index() {
        let catalog = test_catalog();
        let err = LayerStack::new(&catalog, &[1, 9]).unwrap_err();
        assert!(matches!(err, LayerError::UnknownLayer { index: 9, size: 4 }));
    }

    #[test]
    fn test_encode_applies_layers_in_listed_order() {
        let catalog = LayerCatalog::new()
            .with(XorLayer::new(b"A").unwrap())
            .unwrap()
            .with(PaddingLayer::new(PaddingConfig::none()))
            .unwrap();

        // [xor, padding]: padding is outermost, so the 2-byte padding header leads
        let stack = LayerStack::new(&catalog, &[0, 1]).unwrap();
        let encoded = stack.encode(b"ab").unwrap();
        assert_eq!(encoded, vec![0, 0, b'a' ^ b'A', b'b' ^ b'A']);

        // Decoding with the opposite order must not recover the payload
        let swapped = LayerStack::new(&catalog, &[1, 0]).unwrap();
        assert!(swapped.decode(&encoded).map(|d| d != b"ab").unwrap_or(true));

        assert_eq!(stack.decode(&encoded).unwrap(), b"ab");
    }

    #[test]
    fn test_decode_failure_surfaces() {
        let catalog = test_catalog();
        let stack = LayerStack::new(&catalog, &[1, 3]).unwrap();

        let mut encoded = stack.encode(b"hello").unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;

        assert!(matches!(
            stack.decode(&encoded),
            Err(LayerError::Authentication)
        ));
    }

    #[test]
    fn test_catalog_from_config() {
        let mut config = LayersConfig::default();
        assert_eq!(LayerCatalog::from_config(&config).unwrap().len(), 3);

        config.aead_passphrase = Some("secret".to_string());
        let catalog = LayerCatalog::from_config(&config).unwrap();
        assert_eq!(catalog.len(), 4);

        let descriptions = catalog.descriptions();
        assert_eq!(descriptions[0].0, 0);
        assert!(descriptions[1].1.to_lowercase().contains("xor"));
    }

    #[test]
    fn test_validate_indices() {
        let catalog = test_catalog();
        assert!(catalog.validate(&[0, 1, 2, 3]).is_ok());
        assert!(catalog.validate(&[]).is_ok());
        assert!(catalog.validate(&[4]).is_err());
    }

    proptest! {
        #[test]
        fn prop_every_layer_roundtrips(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let catalog = test_catalog();
            for index in 0..catalog.len() as LayerIndex {
                let layer = catalog.get(index).unwrap();
                let encoded = layer.encode(&data).unwrap();
                prop_assert_eq!(layer.decode(&encoded).unwrap(), data.clone());
            }
        }

        #[test]
        fn prop_any_stack_roundtrips(
            indices in proptest::collection::vec(0u8..4, 0..6),
            data in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let catalog = test_catalog();
            let stack = LayerStack::new(&catalog, &indices).unwrap();
            let encoded = stack.encode(&data).unwrap();
            prop_assert_eq!(stack.decode(&encoded).unwrap(), data);
        }
    }
}
