//! AEAD encryption/decryption utilities
//!
//! ChaCha20-Poly1305 with caller-supplied nonces. The cipher holds no
//! mutable state, so one instance can be shared by every session that
//! uses the same catalog.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// AEAD cipher for sealing/opening whole messages
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Encrypt `plaintext`, returning ciphertext with the tag appended
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(plaintext);

        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(*nonce),
                Aad::from(associated_data),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        Ok(buffer)
    }

    /// Decrypt `ciphertext` (with trailing tag), verifying the tag
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = ciphertext.to_vec();

        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(*nonce),
                Aad::from(associated_data),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Decryption)?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_nonce;

    #[test]
    fn test_seal_open() {
        let cipher = Cipher::new(&[7u8; KEY_LEN]).unwrap();
        let nonce = generate_nonce();

        let sealed = cipher.seal(&nonce, b"aad", b"secret message").unwrap();
        assert_eq!(sealed.len(), b"secret message".len() + TAG_LEN);

        let opened = cipher.open(&nonce, b"aad", &sealed).unwrap();
        assert_eq!(opened, b"secret message");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let cipher = Cipher::new(&[7u8; KEY_LEN]).unwrap();
        let nonce = generate_nonce();

        let mut sealed = cipher.seal(&nonce, b"", b"payload").unwrap();
        sealed[0] ^= 0x01;

        assert!(matches!(
            cipher.open(&nonce, b"", &sealed),
            Err(CryptoError::Decryption)
        ));
    }
}
