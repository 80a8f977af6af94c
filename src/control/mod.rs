//! Embedded control channel
//!
//! Session lifecycle management rides inside the tunnel itself, as a
//! reliable byte stream multiplexed under the reserved session ID 0. The
//! stream comes from the embedded user-space stack ([`crate::stack`]); this
//! module supplies the RPC protocol that runs over it ([`rpc`]) and the
//! bridge that moves the stack's IP packets through the tunnel ([`bridge`]).

mod bridge;
mod rpc;

pub use bridge::StackBridge;
pub use rpc::{AddOutcome, ControlClient, ControlHandler, ControlServer, Request, Response};

use crate::stack::StackError;
use thiserror::Error;

/// Control channel errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Request/response pairing broke; the control stream cannot be
    /// trusted past this point and the connection must come down.
    #[error("Control protocol desync: {0}")]
    Desync(String),

    #[error("Unknown control message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Truncated control message")]
    Truncated,

    #[error("IPv6 flow tuples are not supported on the control channel")]
    UnsupportedAddr,

    #[error("Control stream closed")]
    Closed,

    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
