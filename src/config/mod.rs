//! Configuration
//!
//! Two layers: [`Config`] is the TOML file format with serde defaults for
//! every knob, and [`TunnelConfig`] is the runtime view a tunnel connection
//! actually consumes (decoded decoy blobs, a constructed secret negotiator,
//! durations instead of integer seconds).

use crate::crypto::{NoSecret, PresharedSecret, SecretNegotiator, TokenSecret, TunnelKey};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// On-disk configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSection,

    #[serde(default)]
    pub decoy: DecoySection,

    #[serde(default)]
    pub secret: SecretSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Grace window after the handshake during which decrypt failures are
    /// retried instead of closing the connection.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Connection-level keepalive ping interval.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Per-session idle timeout tick.
    #[serde(default = "default_session_keepalive")]
    pub session_keepalive_secs: u64,

    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
}

fn default_mtu() -> usize {
    crate::DEFAULT_MTU
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_grace() -> u64 {
    3
}
fn default_keepalive() -> u64 {
    15
}
fn default_session_keepalive() -> u64 {
    30
}
fn default_close_timeout() -> u64 {
    3
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            handshake_timeout_secs: default_handshake_timeout(),
            grace_secs: default_grace(),
            keepalive_secs: default_keepalive(),
            session_keepalive_secs: default_session_keepalive(),
            close_timeout_secs: default_close_timeout(),
        }
    }
}

/// The decoy script, each blob base64-encoded. Blob 0 is written by the
/// client, blob 1 by the server, alternating.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DecoySection {
    #[serde(default)]
    pub blobs: Vec<String>,
}

/// Secret negotiation strategy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretSection {
    /// "none", "preshared" or "token".
    #[serde(default)]
    pub mode: SecretMode,

    /// Base64 16-byte key for "preshared".
    pub key: Option<String>,

    /// Credential to present, for "token" clients.
    pub token: Option<String>,

    /// Accepted credentials, for "token" servers.
    #[serde(default)]
    pub allowed_tokens: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretMode {
    #[default]
    None,
    Preshared,
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Config(format!("read {}: {e}", path.as_ref().display())))?;
        toml::from_str(&text).map_err(|e| crate::Error::Config(format!("parse: {e}")))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("serialize: {e}")))?;
        std::fs::write(path.as_ref(), text)
            .map_err(|e| crate::Error::Config(format!("write {}: {e}", path.as_ref().display())))
    }

    fn decoy_blobs(&self) -> crate::Result<Vec<Vec<u8>>> {
        let engine = base64::engine::general_purpose::STANDARD;
        self.decoy
            .blobs
            .iter()
            .map(|b| {
                engine
                    .decode(b)
                    .map_err(|e| crate::Error::Config(format!("decoy blob: {e}")))
            })
            .collect()
    }

    fn negotiator(&self) -> crate::Result<Arc<dyn SecretNegotiator>> {
        match self.secret.mode {
            SecretMode::None => Ok(Arc::new(NoSecret)),
            SecretMode::Preshared => {
                let encoded = self
                    .secret
                    .key
                    .as_deref()
                    .ok_or_else(|| crate::Error::Config("preshared mode needs a key".into()))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| crate::Error::Config(format!("key: {e}")))?;
                let key = TunnelKey::from_slice(&bytes)
                    .map_err(|_| crate::Error::Config("key must be 16 bytes".into()))?;
                Ok(Arc::new(PresharedSecret::new(key)))
            }
            SecretMode::Token => {
                if let Some(token) = &self.secret.token {
                    Ok(Arc::new(TokenSecret::presenting(token.clone())))
                } else if !self.secret.allowed_tokens.is_empty() {
                    Ok(Arc::new(TokenSecret::accepting(
                        self.secret.allowed_tokens.iter().cloned(),
                    )))
                } else {
                    Err(crate::Error::Config(
                        "token mode needs a token or allowed_tokens".into(),
                    ))
                }
            }
        }
    }

    /// Build the runtime configuration a connection consumes.
    pub fn tunnel_config(&self) -> crate::Result<TunnelConfig> {
        Ok(TunnelConfig {
            decoy: self.decoy_blobs()?,
            negotiator: self.negotiator()?,
            mtu: self.tunnel.mtu,
            handshake_timeout: Duration::from_secs(self.tunnel.handshake_timeout_secs),
            grace: Duration::from_secs(self.tunnel.grace_secs),
            keepalive: Duration::from_secs(self.tunnel.keepalive_secs),
            session_keepalive: Duration::from_secs(self.tunnel.session_keepalive_secs),
            close_timeout: Duration::from_secs(self.tunnel.close_timeout_secs),
        })
    }
}

/// Runtime tunnel parameters.
pub struct TunnelConfig {
    pub decoy: Vec<Vec<u8>>,
    pub negotiator: Arc<dyn SecretNegotiator>,
    pub mtu: usize,
    pub handshake_timeout: Duration,
    pub grace: Duration,
    pub keepalive: Duration,
    pub session_keepalive: Duration,
    pub close_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            decoy: Vec::new(),
            negotiator: Arc::new(NoSecret),
            mtu: crate::DEFAULT_MTU,
            handshake_timeout: Duration::from_secs(default_handshake_timeout()),
            grace: Duration::from_secs(default_grace()),
            keepalive: Duration::from_secs(default_keepalive()),
            session_keepalive: Duration::from_secs(default_session_keepalive()),
            close_timeout: Duration::from_secs(default_close_timeout()),
        }
    }
}

impl Clone for TunnelConfig {
    fn clone(&self) -> Self {
        Self {
            decoy: self.decoy.clone(),
            negotiator: self.negotiator.clone(),
            mtu: self.mtu,
            handshake_timeout: self.handshake_timeout,
            grace: self.grace,
            keepalive: self.keepalive,
            session_keepalive: self.session_keepalive,
            close_timeout: self.close_timeout,
        }
    }
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("decoy_blobs", &self.decoy.len())
            .field("mtu", &self.mtu)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("grace", &self.grace)
            .field("keepalive", &self.keepalive)
            .field("session_keepalive", &self.session_keepalive)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}
