//! UDP segment carrier
//!
//! Carries disguise segments inside UDP datagrams. The outer UDP header is
//! visible on the wire; the TCP-shaped disguise rides as its payload. This
//! is the deployment mode for environments where raw sockets are not
//! available.

use super::{RawTransport, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tracing::debug;

/// A connected UDP socket carrying one tunnel's segments.
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
    remote: SocketAddr,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind `local` and connect to `remote`. Datagrams from other sources
    /// are discarded by the connected socket.
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;
        debug!(%local, %remote, "udp transport up");
        Ok(Self {
            socket,
            local,
            remote,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RawTransport for UdpTransport {
    async fn send(&self, seg: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        let n = self.socket.send(seg).await?;
        if n != seg.len() {
            return Err(TransportError::Oversized { len: seg.len(), limit: n });
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check_open()?;
        let n = self.socket.recv(buf).await?;
        self.check_open()?;
        Ok(n)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(local = %self.local, "udp transport closed");
        }
    }
}
