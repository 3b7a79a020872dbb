//! Authenticated encryption layer keyed by a pre-shared passphrase
//!
//! Encoded form: `nonce (12B) ‖ ciphertext ‖ tag (16B)`. A fresh random
//! nonce per message keeps the layer stateless.

use super::{Layer, LayerError};
use crate::crypto::{derive_layer_key, generate_nonce, Cipher, NONCE_LEN, TAG_LEN};

/// HKDF label for this layer's key
const KEY_LABEL: &[u8] = b"lunar_tunnel_aead_layer";

/// ChaCha20-Poly1305 encryption of every message
pub struct AeadLayer {
    cipher: Cipher,
}

impl AeadLayer {
    /// Derive the layer key from a passphrase shared by client and server
    pub fn from_passphrase(passphrase: &[u8]) -> Result<Self, LayerError> {
        if passphrase.is_empty() {
            return Err(LayerError::InvalidKey("AEAD passphrase is empty".to_string()));
        }
        let key = derive_layer_key(passphrase, KEY_LABEL)
            .map_err(|e| LayerError::InvalidKey(e.to_string()))?;
        let cipher = Cipher::new(&key).map_err(|e| LayerError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }
}

impl Layer for AeadLayer {
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        let nonce = generate_nonce();
        let sealed = self
            .cipher
            .seal(&nonce, &[], data)
            .map_err(|e| LayerError::Encode(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, LayerError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(LayerError::Truncated {
                layer: "aead",
                len: data.len(),
            });
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let mut nonce_buf = [0u8; NONCE_LEN];
        nonce_buf.copy_from_slice(nonce);

        self.cipher
            .open(&nonce_buf, &[], ciphertext)
            .map_err(|_| LayerError::Authentication)
    }

    fn description(&self) -> String {
        "AEAD layer (ChaCha20-Poly1305, pre-shared passphrase)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_passphrase_fails() {
        let sender = AeadLayer::from_passphrase(b"alpha").unwrap();
        let receiver = AeadLayer::from_passphrase(b"bravo").unwrap();

        let encoded = sender.encode(b"ping").unwrap();
        assert!(matches!(
            receiver.decode(&encoded),
            Err(LayerError::Authentication)
        ));
    }

    #[test]
    fn test_same_plaintext_encodes_differently() {
        let layer = AeadLayer::from_passphrase(b"alpha").unwrap();
        assert_ne!(layer.encode(b"ping").unwrap(), layer.encode(b"ping").unwrap());
    }

    #[test]
    fn test_short_input_is_truncated() {
        let layer = AeadLayer::from_passphrase(b"alpha").unwrap();
        assert!(matches!(
            layer.decode(&[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(LayerError::Truncated { layer: "aead", .. })
        ));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(AeadLayer::from_passphrase(b"").is_err());
    }
}
