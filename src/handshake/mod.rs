//! Decoy handshake and mode switch
//!
//! Before any tunnel traffic, both ends replay a configured script of byte
//! blobs ("decoy exchange") that mimics a previously observed legitimate
//! flow, strictly alternating writer and reader with the client writing
//! blob 0. Each received blob is byte-compared against the script; any
//! mismatch or I/O failure aborts with [`HandshakeError::PrevPacketInvalid`]
//! carrying the script index.
//!
//! After the decoy exchange the configured [`SecretNegotiator`] runs over
//! the same disguised stream and settles the tunnel key. Every byte
//! exchanged (decoy and negotiation alike) is folded into a SHA-256
//! transcript, which later seeds the per-direction AEAD nonce salts.
//!
//! Handshake segments are stamped through the same [`Tracker`] that the
//! data plane will keep using, so seq/ack numbering is continuous across
//! the mode switch. Handshake segments carry plain ACK flags; a PSH-flagged
//! data segment that races ahead of the final handshake message is parked
//! (bounded, drop-oldest) and handed to the data plane afterwards.

use crate::conn::Role;
use crate::crypto::{random_bytes, CryptoError, SecretExchange, SecretNegotiator, TunnelKey};
use crate::disguise::{DisguiseError, Tracker, TCP_HEADER_LEN};
use crate::transport::{RawTransport, TransportError};
use async_trait::async_trait;
use ring::digest;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// TCP flags on handshake segments: plain ACK, no PSH.
pub const HANDSHAKE_FLAGS: u8 = 0x10;

/// Most raced-ahead data segments held while the handshake finishes.
const PARK_LIMIT: usize = 8;

const RECV_BUF: usize = 64 * 1024;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Decoy blob at the given script index mismatched or failed to cross.
    #[error("Decoy exchange failed at script index {0}")]
    PrevPacketInvalid(usize),

    #[error("Secret negotiation failed: {0}")]
    Negotiation(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Disguise error: {0}")]
    Disguise(#[from] DisguiseError),

    #[error("Handshake timed out")]
    TimedOut,

    #[error("Handshake cancelled")]
    Cancelled,
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Initial,
    Handshaking,
    Transmitting,
    Closed,
}

/// Everything the data plane needs from a completed handshake.
pub struct Outcome {
    /// Negotiated tunnel key; the zero key means plaintext mode.
    pub key: TunnelKey,
    /// SHA-256 over every handshake byte, identical on both ends.
    pub transcript: [u8; 32],
    /// Raw data segments that raced ahead of the final handshake message,
    /// in arrival order. The receive path must process these first.
    pub parked: VecDeque<Vec<u8>>,
}

/// Run the full handshake on `transport`, stamping segments through
/// `tracker`. On success the tracker's counters are exactly where the data
/// plane must continue from.
pub async fn run(
    role: Role,
    transport: &dyn RawTransport,
    tracker: &Tracker,
    decoy: &[Vec<u8>],
    negotiator: &dyn SecretNegotiator,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<Outcome, HandshakeError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(HandshakeError::Cancelled),
        res = tokio::time::timeout(deadline, drive(role, transport, tracker, decoy, negotiator)) => {
            match res {
                Ok(outcome) => outcome,
                Err(_) => Err(HandshakeError::TimedOut),
            }
        }
    }
}

async fn drive(
    role: Role,
    transport: &dyn RawTransport,
    tracker: &Tracker,
    decoy: &[Vec<u8>],
    negotiator: &dyn SecretNegotiator,
) -> Result<Outcome, HandshakeError> {
    // Random ISN; the peer learns it from our first segment via its ack.
    let mut isn = [0u8; 4];
    random_bytes(&mut isn);
    tracker.seed(u32::from_be_bytes(isn));

    let mut ex = Exchange {
        transport,
        tracker,
        transcript: digest::Context::new(&digest::SHA256),
        parked: VecDeque::new(),
        buf: vec![0u8; RECV_BUF],
    };

    for (i, blob) in decoy.iter().enumerate() {
        let writes = match role {
            Role::Client => i % 2 == 0,
            Role::Server => i % 2 == 1,
        };
        let step = if writes {
            ex.send_msg(blob).await
        } else {
            match ex.recv_msg().await {
                Ok(got) if got == *blob => Ok(()),
                Ok(_) => Err(HandshakeError::PrevPacketInvalid(i)),
                Err(e) => Err(e),
            }
        };
        // Any failure inside step i is reported as that step's failure.
        step.map_err(|e| match e {
            HandshakeError::PrevPacketInvalid(_) => e,
            other => {
                trace!(step = i, error = %other, "decoy step failed");
                HandshakeError::PrevPacketInvalid(i)
            }
        })?;
    }

    let key = match role {
        Role::Client => negotiator.client(&mut ex).await?,
        Role::Server => negotiator.server(&mut ex).await?,
    };

    let Exchange {
        transcript, parked, ..
    } = ex;
    let mut digest_out = [0u8; 32];
    digest_out.copy_from_slice(transcript.finish().as_ref());

    debug!(
        ?role,
        crypto = !key.is_zero(),
        parked = parked.len(),
        "handshake complete"
    );
    Ok(Outcome {
        key,
        transcript: digest_out,
        parked,
    })
}

/// The handshake's view of the wire: whole messages in disguise segments,
/// transcript folding on both directions.
struct Exchange<'a> {
    transport: &'a dyn RawTransport,
    tracker: &'a Tracker,
    transcript: digest::Context,
    parked: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
}

impl Exchange<'_> {
    async fn send_msg(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        let mut seg = Vec::with_capacity(TCP_HEADER_LEN + msg.len());
        seg.resize(TCP_HEADER_LEN, 0);
        seg.extend_from_slice(msg);
        self.tracker.attach_with_flags(&mut seg, 0, HANDSHAKE_FLAGS)?;
        self.transport.send(&seg).await?;
        self.transcript.update(msg);
        Ok(())
    }

    async fn recv_msg(&mut self) -> Result<Vec<u8>, HandshakeError> {
        loop {
            let n = self.transport.recv(&mut self.buf).await?;
            let seg = &self.buf[..n];
            let hdr = match self.tracker.detach(seg) {
                Ok(hdr) => hdr,
                Err(e) => {
                    // Middlebox probes and genuine TCP retransmissions land
                    // here; they are not part of the exchange.
                    trace!(len = n, error = %e, "dropping non-handshake segment");
                    continue;
                }
            };
            if hdr.flags & 0x08 != 0 {
                // PSH set: a data segment outran the handshake tail.
                if self.parked.len() == PARK_LIMIT {
                    self.parked.pop_front();
                }
                self.parked.push_back(seg.to_vec());
                continue;
            }
            let msg = seg[TCP_HEADER_LEN..].to_vec();
            self.transcript.update(&msg);
            return Ok(msg);
        }
    }
}

#[async_trait]
impl SecretExchange for Exchange<'_> {
    async fn send(&mut self, msg: &[u8]) -> std::io::Result<()> {
        self.send_msg(msg)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        self.recv_msg()
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}
