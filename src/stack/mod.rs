//! User-space network stack boundary
//!
//! The control channel needs reliable, ordered byte-stream semantics, which
//! this crate does not reimplement: it delegates to an external user-space
//! TCP/IP stack behind the [`NetStack`] trait. The tunnel only ever does
//! three things with it: inject one inbound IP packet, dequeue one outbound
//! IP packet, and open exactly one reliable stream on top (the control
//! connection).
//!
//! The stack speaks whole IP packets while the tunnel carries bare
//! transport payloads, so [`encap_ipv4`] / [`decap_ipv4`] translate at the
//! boundary.

mod mem;

pub use mem::MemStack;

use async_trait::async_trait;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Stack boundary errors
#[derive(Debug, Error)]
pub enum StackError {
    #[error("Stack closed")]
    Closed,

    #[error("Control stream already taken")]
    StreamTaken,

    #[error("Malformed IP packet: {0}")]
    Malformed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The reliable stream carried by the embedded stack. Exactly one exists
/// per tunnel connection.
#[async_trait]
pub trait ControlStream: Send {
    /// Read some bytes; `Ok(0)` is end-of-stream.
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write the whole buffer.
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Flush a FIN toward the peer. Must happen before the stack and the
    /// raw transport are torn down or the peer sees a truncated stream.
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// Abstract user-space TCP/IP stack.
#[async_trait]
pub trait NetStack: Send + Sync {
    /// Feed one IP packet arriving from the tunnel into the stack.
    async fn inject_inbound(&self, packet: &[u8]) -> Result<(), StackError>;

    /// Pull the next IP packet the stack wants to emit toward the tunnel.
    async fn dequeue_outbound(&self) -> Result<Vec<u8>, StackError>;

    /// Open the control stream, client side.
    async fn dial_control(&self) -> Result<Box<dyn ControlStream>, StackError>;

    /// Accept the control stream, server side.
    async fn accept_control(&self) -> Result<Box<dyn ControlStream>, StackError>;

    /// Tear the stack down; pending operations fail with
    /// [`StackError::Closed`]. Idempotent.
    fn close(&self);
}

/// IPv4 header length emitted by [`encap_ipv4`]; no options.
pub const IPV4_HEADER_LEN: usize = 20;

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Wrap a transport payload in a minimal IPv4 header so the stack accepts
/// it as a complete packet.
pub fn encap_ipv4(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + payload.len();
    let mut pkt = Vec::with_capacity(total);
    pkt.push(0x45); // version 4, IHL 5
    pkt.push(0); // TOS
    pkt.extend_from_slice(&(total as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0]); // identification
    pkt.extend_from_slice(&0x4000u16.to_be_bytes()); // DF
    pkt.push(64); // TTL
    pkt.push(6); // TCP
    pkt.extend_from_slice(&[0, 0]); // checksum, patched below
    pkt.extend_from_slice(&src.octets());
    pkt.extend_from_slice(&dst.octets());
    let csum = ipv4_checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// Strip the IPv4 header off a packet emitted by the stack, returning the
/// transport payload.
pub fn decap_ipv4(packet: &[u8]) -> Result<&[u8], StackError> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(StackError::Malformed("short packet"));
    }
    if packet[0] >> 4 != 4 {
        return Err(StackError::Malformed("not IPv4"));
    }
    let ihl = usize::from(packet[0] & 0x0F) * 4;
    if ihl < IPV4_HEADER_LEN || packet.len() < ihl {
        return Err(StackError::Malformed("bad IHL"));
    }
    Ok(&packet[ihl..])
}
