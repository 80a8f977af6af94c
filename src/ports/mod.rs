//! Local forwarding-port allocation
//!
//! Ephemeral local ports are a scarce resource when thousands of flows are
//! relayed. [`PortAlloc`] reference-counts each bound port by the set of
//! remote addresses currently using it: a port already bound can be reused
//! for a flow to a *different* remote, and is only returned to the OS when
//! its remote set drains.
//!
//! The actual OS binding is behind [`PortBinder`], so tests run against a
//! deterministic in-memory binder.

use crate::session::Proto;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Port allocation errors
#[derive(Debug, Error)]
pub enum PortError {
    #[error("No local port available: {0}")]
    Exhausted(String),

    #[error("Port {1} not allocated for {0:?}")]
    NotAllocated(Proto, u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binds and releases real local ports.
#[async_trait]
pub trait PortBinder: Send + Sync {
    /// Reserve a fresh local port for `proto`.
    async fn bind(&self, proto: Proto) -> Result<u16, PortError>;

    /// Hand a port back to the OS.
    fn release(&self, proto: Proto, port: u16);
}

/// Reference-counted port allocator.
pub struct PortAlloc {
    binder: std::sync::Arc<dyn PortBinder>,
    // (proto, port) -> remotes currently mapped through that port.
    inner: Mutex<HashMap<(Proto, u16), HashSet<SocketAddr>>>,
}

impl PortAlloc {
    pub fn new(binder: std::sync::Arc<dyn PortBinder>) -> Self {
        Self {
            binder,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Get a local port for a flow toward `remote`. Reuses a bound port
    /// whose remote set does not yet contain `remote`; binds a fresh port
    /// otherwise.
    pub async fn get_port(&self, proto: Proto, remote: SocketAddr) -> Result<u16, PortError> {
        let mut inner = self.inner.lock().await;
        for ((p, port), remotes) in inner.iter_mut() {
            if *p == proto && !remotes.contains(&remote) {
                remotes.insert(remote);
                trace!(?proto, port = *port, %remote, "port reused");
                return Ok(*port);
            }
        }
        let port = self.binder.bind(proto).await?;
        inner.insert((proto, port), HashSet::from([remote]));
        debug!(?proto, port, %remote, "port bound");
        Ok(port)
    }

    /// Drop `remote` from the port's remote set; the port is released to
    /// the OS once no remote uses it anymore.
    pub async fn del_port(
        &self,
        proto: Proto,
        port: u16,
        remote: SocketAddr,
    ) -> Result<(), PortError> {
        let mut inner = self.inner.lock().await;
        let remotes = inner
            .get_mut(&(proto, port))
            .ok_or(PortError::NotAllocated(proto, port))?;
        remotes.remove(&remote);
        if remotes.is_empty() {
            inner.remove(&(proto, port));
            self.binder.release(proto, port);
            debug!(?proto, port, "port released");
        }
        Ok(())
    }

    /// Number of ports currently held.
    pub async fn held(&self) -> usize {
        self.inner.lock().await.len()
    }
}

enum BoundSocket {
    Udp(tokio::net::UdpSocket),
    Tcp(tokio::net::TcpListener),
}

/// Binder backed by real OS sockets. The socket is held open for the
/// lifetime of the allocation so the kernel keeps the port reserved.
pub struct SystemBinder {
    held: StdMutex<HashMap<(Proto, u16), BoundSocket>>,
}

impl SystemBinder {
    pub fn new() -> Self {
        Self {
            held: StdMutex::new(HashMap::new()),
        }
    }
}

impl Default for SystemBinder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortBinder for SystemBinder {
    async fn bind(&self, proto: Proto) -> Result<u16, PortError> {
        let (port, socket) = match proto {
            Proto::Udp => {
                let s = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
                (s.local_addr()?.port(), BoundSocket::Udp(s))
            }
            Proto::Tcp => {
                let s = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
                (s.local_addr()?.port(), BoundSocket::Tcp(s))
            }
        };
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((proto, port), socket);
        Ok(port)
    }

    fn release(&self, proto: Proto, port: u16) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(proto, port));
    }
}
