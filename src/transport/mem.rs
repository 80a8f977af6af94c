//! In-memory transport pair
//!
//! Two channel-backed endpoints that behave like a lossless datagram link.
//! Used by the integration tests and by in-process deployments where both
//! tunnel ends live in the same binary.

use super::{RawTransport, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One end of an in-memory segment link.
pub struct MemLink {
    local: SocketAddr,
    remote: SocketAddr,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
}

impl MemLink {
    /// Create a connected pair. The first end reports `a` as its local
    /// address and `b` as remote; the second end mirrors that.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (MemLink, MemLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemLink {
                local: a,
                remote: b,
                tx: Mutex::new(Some(a_tx)),
                rx: tokio::sync::Mutex::new(a_rx),
                closed: CancellationToken::new(),
            },
            MemLink {
                local: b,
                remote: a,
                tx: Mutex::new(Some(b_tx)),
                rx: tokio::sync::Mutex::new(b_rx),
                closed: CancellationToken::new(),
            },
        )
    }

    /// Connected pair on fixed loopback test addresses.
    pub fn test_pair() -> (MemLink, MemLink) {
        Self::pair(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:40001".parse().unwrap(),
        )
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Vec<u8>>, TransportError> {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl RawTransport for MemLink {
    async fn send(&self, seg: &[u8]) -> Result<(), TransportError> {
        self.sender()?
            .send(seg.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut rx = self.rx.lock().await;
        let seg = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            seg = rx.recv() => seg.ok_or(TransportError::Closed)?,
        };
        if seg.len() > buf.len() {
            return Err(TransportError::Oversized { len: seg.len(), limit: buf.len() });
        }
        buf[..seg.len()].copy_from_slice(&seg);
        Ok(seg.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.closed.cancel();
    }
}
