//! # Mirage Tunnel
//!
//! A tunnel that disguises its traffic as an ordinary TCP flow so it can
//! cross hostile middleboxes, while multiplexing many logical connections
//! over the single disguised flow.
//!
//! ## Features
//!
//! - **FakeTCP disguise**: every data-plane segment carries a synthetic,
//!   checksum-valid TCP header with continuous seq/ack numbering
//! - **Per-segment AEAD encryption** keyed by a pluggable secret negotiation
//! - **Decoy handshake**: a scripted replay of a previously observed exchange
//!   runs before any tunnel traffic
//! - **Session multiplexing** with 16-bit session IDs and lock-free idle
//!   detection
//! - **Embedded control channel**: a reliable RPC stream rides inside the
//!   tunnel as session 0, backed by a user-space network stack
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Tunnel Connection (Conn)              │
//! │        send/recv of (payload, session-ID) pairs      │
//! ├──────────────────────────┬──────────────────────────┤
//! │   Session Multiplexing   │   Control Channel (id 0) │
//! │  (SessionMgr, IdMgr)     │  (embedded stack bridge) │
//! ├──────────────────────────┴──────────────────────────┤
//! │              Crypto Framer (AEAD per segment)        │
//! ├─────────────────────────────────────────────────────┤
//! │         FakeTCP Disguise (header, seq/ack, mark)     │
//! ├─────────────────────────────────────────────────────┤
//! │            Raw Transport (datagram channel)          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conn;
pub mod control;
pub mod crypto;
pub mod disguise;
pub mod handshake;
pub mod ports;
pub mod session;
pub mod stack;
pub mod transport;

pub use config::Config;
pub use conn::{Conn, Role};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Session ID reserved for the embedded control channel.
pub const CONTROL_SESSION: u16 = 0;

/// Width of the session-ID prefix carried in every data-plane payload.
pub const SESSION_ID_LEN: usize = 2;

/// Default tunnel MTU: the largest wire segment we will emit, header and
/// AEAD tag included.
pub const DEFAULT_MTU: usize = 1460;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] handshake::HandshakeError),

    #[error("Disguise error: {0}")]
    Disguise(#[from] disguise::DisguiseError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Control channel error: {0}")]
    Control(#[from] control::ControlError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Stack error: {0}")]
    Stack(#[from] stack::StackError),

    #[error("Payload of {len} bytes exceeds the {max}-byte tunnel limit")]
    TooLarge { len: usize, max: usize },

    #[error("Port allocation error: {0}")]
    Ports(#[from] ports::PortError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Whether the condition is recoverable for the connection: the
    /// offending frame is dropped and the tunnel keeps running.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Session(e) => e.is_temporary(),
            Error::Crypto(crypto::CryptoError::Authentication) => true,
            Error::TooLarge { .. } => true,
            _ => false,
        }
    }

    /// Whether the condition was caused by a deadline or keepalive expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Session(e) => e.is_timeout(),
            Error::Handshake(handshake::HandshakeError::TimedOut) => true,
            _ => false,
        }
    }
}
