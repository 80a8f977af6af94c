//! Cryptographic primitives for Mirage Tunnel
//!
//! This module provides:
//! - AES-128-GCM AEAD framing of TCP-shaped segments
//! - Pluggable secret-key negotiation (pre-shared signature, token, none)
//! - HKDF-SHA256 derivation of nonce salts and ISN seeds
//! - Secure random number generation

mod framer;
mod secret;

pub use framer::SegmentCipher;
pub use secret::{NoSecret, PresharedSecret, SecretExchange, SecretNegotiator, TokenSecret};

use thiserror::Error;

/// Length of the tunnel key in bytes (AES-128-GCM).
pub const KEY_LEN: usize = 16;

/// Length of the AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Secret negotiation failed: {0}")]
    Negotiation(String),

    #[error("Authentication failed")]
    Authentication,

    #[error("Buffer too short: need {need} bytes, got {got}")]
    ShortBuffer { need: usize, got: usize },

    #[error("Nonce space exhausted for this key")]
    NonceExhausted,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("IO error during negotiation: {0}")]
    Io(#[from] std::io::Error),
}

/// A negotiated 16-byte tunnel key. The all-zero key is the sentinel for
/// "no crypto": the tunnel runs in plaintext disguise-only mode.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TunnelKey(pub [u8; KEY_LEN]);

impl TunnelKey {
    /// The zero key: disguise without encryption.
    pub const ZERO: TunnelKey = TunnelKey([0u8; KEY_LEN]);

    /// Whether this is the zero (no-crypto) key.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        random_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "TunnelKey({})", if self.is_zero() { "zero" } else { "set" })
    }
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: ring::hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material and an optional salt.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        use ring::hkdf::{Salt, HKDF_SHA256};
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };
        Self { prk: salt.extract(ikm) }
    }

    /// Expand into `output` under the given info label.
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;
        okm.fill(output)
            .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))?;
        Ok(())
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl ring::hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_hkdf_deterministic() {
        let hkdf1 = Hkdf::new(Some(b"salt"), b"ikm");
        let hkdf2 = Hkdf::new(Some(b"salt"), b"ikm");
        let mut out1 = [0u8; 16];
        let mut out2 = [0u8; 16];
        hkdf1.expand(b"label", &mut out1).unwrap();
        hkdf2.expand(b"label", &mut out2).unwrap();
        assert_eq!(out1, out2);

        let mut other = [0u8; 16];
        hkdf1.expand(b"other", &mut other).unwrap();
        assert_ne!(out1, other);
    }

    #[test]
    fn test_zero_key_sentinel() {
        assert!(TunnelKey::ZERO.is_zero());
        assert!(!TunnelKey::generate().is_zero());
        assert_eq!(format!("{:?}", TunnelKey::ZERO), "TunnelKey(zero)");
    }
}
