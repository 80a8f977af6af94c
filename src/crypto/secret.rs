//! Secret-key negotiation strategies
//!
//! After the decoy exchange the handshake hands the byte stream to a
//! [`SecretNegotiator`], which either settles on a 16-byte tunnel key or on
//! the zero key (plaintext disguise-only mode). Implementations must keep
//! the strict writer/reader alternation of the handshake: the client speaks
//! first.

use super::{random_bytes, CryptoError, Hkdf, TunnelKey, KEY_LEN};
use async_trait::async_trait;
use ring::hmac;

/// The byte-exchange surface a negotiator runs over. Each message is one
/// handshake datagram; the handshake layer folds every byte into its
/// transcript.
#[async_trait]
pub trait SecretExchange: Send {
    /// Send one negotiation message.
    async fn send(&mut self, msg: &[u8]) -> std::io::Result<()>;

    /// Receive one negotiation message.
    async fn recv(&mut self) -> std::io::Result<Vec<u8>>;
}

/// Pluggable secret-key negotiation capability.
#[async_trait]
pub trait SecretNegotiator: Send + Sync {
    /// Run the client half of the negotiation.
    async fn client(&self, io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError>;

    /// Run the server half of the negotiation.
    async fn server(&self, io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError>;
}

/// No negotiation: both sides settle on the zero key and the tunnel runs
/// without encryption. Exchanges no bytes.
#[derive(Debug, Default)]
pub struct NoSecret;

#[async_trait]
impl SecretNegotiator for NoSecret {
    async fn client(&self, _io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError> {
        Ok(TunnelKey::ZERO)
    }

    async fn server(&self, _io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError> {
        Ok(TunnelKey::ZERO)
    }
}

const NONCE_EXCHANGE_LEN: usize = 16;

/// Mutual proof of a pre-shared key via HMAC-SHA256 over exchanged nonces.
///
/// ```text
/// client -> c_nonce
/// server -> s_nonce || HMAC(key, c_nonce || s_nonce || "server")
/// client -> HMAC(key, s_nonce || c_nonce || "client")
/// ```
///
/// Neither side reveals key material; a middlebox replaying the exchange
/// fails on the fresh nonces.
pub struct PresharedSecret {
    key: TunnelKey,
}

impl PresharedSecret {
    pub fn new(key: TunnelKey) -> Self {
        Self { key }
    }

    fn proof(&self, a: &[u8], b: &[u8], label: &[u8]) -> hmac::Tag {
        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &self.key.0);
        let mut msg = Vec::with_capacity(a.len() + b.len() + label.len());
        msg.extend_from_slice(a);
        msg.extend_from_slice(b);
        msg.extend_from_slice(label);
        hmac::sign(&mac_key, &msg)
    }
}

#[async_trait]
impl SecretNegotiator for PresharedSecret {
    async fn client(&self, io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError> {
        let mut c_nonce = [0u8; NONCE_EXCHANGE_LEN];
        random_bytes(&mut c_nonce);
        io.send(&c_nonce).await?;

        let reply = io.recv().await?;
        if reply.len() != NONCE_EXCHANGE_LEN + 32 {
            return Err(CryptoError::Negotiation("malformed server proof".to_string()));
        }
        let (s_nonce, s_proof) = reply.split_at(NONCE_EXCHANGE_LEN);
        let expected = self.proof(&c_nonce, s_nonce, b"server");
        if !constant_time_eq(expected.as_ref(), s_proof) {
            return Err(CryptoError::Negotiation("server proof mismatch".to_string()));
        }

        let c_proof = self.proof(s_nonce, &c_nonce, b"client");
        io.send(c_proof.as_ref()).await?;
        Ok(self.key)
    }

    async fn server(&self, io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError> {
        let c_nonce = io.recv().await?;
        if c_nonce.len() != NONCE_EXCHANGE_LEN {
            return Err(CryptoError::Negotiation("malformed client nonce".to_string()));
        }

        let mut s_nonce = [0u8; NONCE_EXCHANGE_LEN];
        random_bytes(&mut s_nonce);
        let s_proof = self.proof(&c_nonce, &s_nonce, b"server");
        let mut reply = Vec::with_capacity(NONCE_EXCHANGE_LEN + 32);
        reply.extend_from_slice(&s_nonce);
        reply.extend_from_slice(s_proof.as_ref());
        io.send(&reply).await?;

        let c_proof = io.recv().await?;
        let expected = self.proof(&s_nonce, &c_nonce, b"client");
        if !constant_time_eq(expected.as_ref(), &c_proof) {
            return Err(CryptoError::Negotiation("client proof mismatch".to_string()));
        }
        Ok(self.key)
    }
}

/// Token/credential exchange: the client presents an opaque token, the
/// server validates it against its allow-list, and both derive the tunnel
/// key from the token so no key bytes cross the wire.
pub struct TokenSecret {
    /// Client side: the credential to present.
    token: Option<String>,
    /// Server side: accepted credentials.
    allowed: std::collections::HashSet<String>,
}

impl TokenSecret {
    /// Client-side negotiator presenting `token`.
    pub fn presenting(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), allowed: Default::default() }
    }

    /// Server-side negotiator accepting any of `tokens`.
    pub fn accepting<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { token: None, allowed: tokens.into_iter().map(Into::into).collect() }
    }

    fn derive(token: &str) -> TunnelKey {
        let mut key = [0u8; KEY_LEN];
        Hkdf::new(None, token.as_bytes())
            .expand(b"mirage token key", &mut key)
            .expect("fixed-length expand");
        TunnelKey(key)
    }
}

const TOKEN_ACCEPTED: &[u8] = b"\x01";
const TOKEN_REJECTED: &[u8] = b"\x00";

#[async_trait]
impl SecretNegotiator for TokenSecret {
    async fn client(&self, io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| CryptoError::Negotiation("no token configured".to_string()))?;
        io.send(token.as_bytes()).await?;

        let verdict = io.recv().await?;
        if verdict != TOKEN_ACCEPTED {
            return Err(CryptoError::Negotiation("token rejected".to_string()));
        }
        Ok(Self::derive(token))
    }

    async fn server(&self, io: &mut dyn SecretExchange) -> Result<TunnelKey, CryptoError> {
        let presented = io.recv().await?;
        let token = std::str::from_utf8(&presented)
            .map_err(|_| CryptoError::Negotiation("non-UTF8 token".to_string()))?;

        if !self.allowed.contains(token) {
            io.send(TOKEN_REJECTED).await?;
            return Err(CryptoError::Negotiation("unknown token".to_string()));
        }
        io.send(TOKEN_ACCEPTED).await?;
        Ok(Self::derive(token))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
