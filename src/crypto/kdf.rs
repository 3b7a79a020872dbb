//! Layer keys from pre-shared passphrases (HKDF-SHA256)

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// Fixed salt: both peers derive from the passphrase alone
const LAYER_KEY_SALT: &[u8] = b"lunar_tunnel_layer_salt_v1";

/// Extracted passphrase secret, expanded into one key per layer
pub struct KeyDerivation {
    prk: hkdf::Prk,
}

impl KeyDerivation {
    /// Extract from a pre-shared passphrase
    pub fn from_passphrase(passphrase: &[u8]) -> Self {
        Self {
            prk: Salt::new(HKDF_SHA256, LAYER_KEY_SALT).extract(passphrase),
        }
    }

    /// Expand the key for the layer identified by `label`
    pub fn layer_key(&self, label: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.prk
            .expand(&[label], LayerKeyLen)
            .and_then(|okm| okm.fill(&mut key))
            .map_err(|_| {
                CryptoError::KeyDerivation(format!(
                    "cannot expand key for '{}'",
                    String::from_utf8_lossy(label)
                ))
            })?;
        Ok(key)
    }
}

struct LayerKeyLen;

impl hkdf::KeyType for LayerKeyLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Derive the key of a catalog layer from a pre-shared passphrase.
///
/// `label` separates keys of different layers built from the same passphrase.
pub fn derive_layer_key(passphrase: &[u8], label: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    KeyDerivation::from_passphrase(passphrase).layer_key(label)
}
