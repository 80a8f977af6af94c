//! Raw segment transports
//!
//! A [`RawTransport`] carries whole disguise segments between the two tunnel
//! endpoints, preserving datagram boundaries. It is deliberately dumb: no
//! retransmission, no ordering, no framing beyond "one send is one recv".
//! Everything above (crypto, disguise, sessions) assumes exactly this.
//!
//! Two implementations ship here: [`MemLink`] for in-process wiring and
//! tests, and [`UdpTransport`] for carrying segments over a UDP socket. A
//! raw-IP carrier plugs in the same way without touching the upper layers.

mod mem;
mod udp;

pub use mem::MemLink;
pub use udp::UdpTransport;

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Segment of {len} bytes exceeds carrier limit {limit}")]
    Oversized { len: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A datagram-boundary-preserving carrier of disguise segments.
///
/// Implementations take `&self` for both directions so a single `Arc`'d
/// transport can be shared between the outbound pump and the inbound loop.
#[async_trait]
pub trait RawTransport: Send + Sync {
    /// Send one whole segment.
    async fn send(&self, seg: &[u8]) -> Result<(), TransportError>;

    /// Receive one whole segment into `buf`, returning its length.
    /// `buf` must be large enough for the carrier's maximum datagram.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Local endpoint address, used for the checksum pseudo-header.
    fn local_addr(&self) -> SocketAddr;

    /// Remote endpoint address.
    fn remote_addr(&self) -> SocketAddr;

    /// Shut the carrier down. Pending and future operations fail with
    /// [`TransportError::Closed`]. Idempotent.
    fn close(&self);
}
