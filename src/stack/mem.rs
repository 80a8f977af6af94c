//! Channel-backed stand-in stack
//!
//! [`MemStack`] fulfils the [`NetStack`] contract without a real TCP
//! implementation: every stream write becomes one IP packet, every injected
//! packet's payload is appended to the stream, and an empty payload marks
//! end-of-stream. Over a lossless in-order tunnel this gives the reliable
//! semantics the control channel needs; deployments over lossy carriers
//! plug a real user-space TCP stack into the same trait instead.

use super::{decap_ipv4, encap_ipv4, ControlStream, NetStack, StackError};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct MemStack {
    local: Ipv4Addr,
    peer: Ipv4Addr,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    // Handed to the single control stream on dial/accept.
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed: CancellationToken,
}

impl MemStack {
    pub fn new(local: Ipv4Addr, peer: Ipv4Addr) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            local,
            peer,
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: CancellationToken::new(),
        }
    }

    fn take_stream(&self) -> Result<Box<dyn ControlStream>, StackError> {
        if self.closed.is_cancelled() {
            return Err(StackError::Closed);
        }
        let inbound = self
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(StackError::StreamTaken)?;
        Ok(Box::new(MemControlStream {
            local: self.local,
            peer: self.peer,
            outbound: self.outbound_tx.clone(),
            inbound,
            pending: Vec::new(),
            pos: 0,
            eof: false,
        }))
    }
}

#[async_trait]
impl NetStack for MemStack {
    async fn inject_inbound(&self, packet: &[u8]) -> Result<(), StackError> {
        if self.closed.is_cancelled() {
            return Err(StackError::Closed);
        }
        let payload = decap_ipv4(packet)?;
        self.inbound_tx
            .send(payload.to_vec())
            .map_err(|_| StackError::Closed)
    }

    async fn dequeue_outbound(&self) -> Result<Vec<u8>, StackError> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(StackError::Closed),
            pkt = rx.recv() => pkt.ok_or(StackError::Closed),
        }
    }

    async fn dial_control(&self) -> Result<Box<dyn ControlStream>, StackError> {
        self.take_stream()
    }

    async fn accept_control(&self) -> Result<Box<dyn ControlStream>, StackError> {
        self.take_stream()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

struct MemControlStream {
    local: Ipv4Addr,
    peer: Ipv4Addr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    eof: bool,
}

#[async_trait]
impl ControlStream for MemControlStream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pos);
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.inbound.recv().await {
                Some(chunk) if chunk.is_empty() => self.eof = true,
                Some(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                None => self.eof = true,
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.outbound
            .send(encap_ipv4(self.local, self.peer, buf))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stack closed"))
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        // Empty payload is the end-of-stream marker on the wire.
        self.outbound
            .send(encap_ipv4(self.local, self.peer, &[]))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stack closed"))
    }
}
