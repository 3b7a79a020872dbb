//! Primitives behind the keyed layers
//!
//! - ChaCha20-Poly1305 sealing for the AEAD layer
//! - HKDF-SHA256 layer keys derived from a pre-shared passphrase
//! - System randomness for nonces, padding bytes and ping payloads

mod aead;
mod kdf;

pub use aead::Cipher;
pub use kdf::{derive_layer_key, KeyDerivation};

use thiserror::Error;

/// Symmetric key size
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag size
pub const TAG_LEN: usize = 16;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Sealing failed: {0}")]
    Encryption(String),

    #[error("Message failed authentication")]
    Decryption,

    #[error("Key rejected by cipher")]
    InvalidKeyLength,
}

/// Fill `buf` from the system CSPRNG
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .expect("system random source unavailable");
}

/// Fresh random nonce; one per sealed message
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce);
    nonce
}
