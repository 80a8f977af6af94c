//! FakeTCP seq/ack tracker
//!
//! One tracker per tunnel connection. `seq` is only advanced by the single
//! outbound pump and `ack` only by the single inbound path, so both live in
//! plain atomics with no lock on the hot path.

use super::header::{finalize_checksum, TcpHeader, TCP_HEADER_LEN};
use super::{DisguiseError, PseudoSum, SEGMENT_FLAGS, SEGMENT_WINDOW};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// TCP serial-number comparison: is `a` strictly after `b`?
fn seq_after(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// Maintains the synthetic seq/ack counters for disguise segments.
#[derive(Debug)]
pub struct Tracker {
    src_port: u16,
    dst_port: u16,
    pseudo: PseudoSum,
    /// Next sequence number to stamp on an outbound segment.
    seq: AtomicU32,
    /// Highest segment end acknowledged to the peer.
    ack: AtomicU32,
    /// Whether `ack` has been installed from a peer segment yet. The peer's
    /// ISN is random, so the first observed segment end is adopted outright;
    /// serial-number comparison against the initial zero would reject any
    /// ISN in the upper half of the space.
    ack_primed: AtomicBool,
}

impl Tracker {
    /// Create a tracker with ports fixed for the connection's lifetime.
    /// The outbound counter starts at zero until [`Tracker::seed`] installs
    /// the ISN; the ack side primes itself from the first peer segment.
    pub fn new(src_port: u16, dst_port: u16, pseudo: PseudoSum) -> Self {
        Self {
            src_port,
            dst_port,
            pseudo,
            seq: AtomicU32::new(0),
            ack: AtomicU32::new(0),
            ack_primed: AtomicBool::new(false),
        }
    }

    /// Install the outbound ISN. The handshake stamps its segments through
    /// this tracker, so the data plane continues the same numbering.
    pub fn seed(&self, seq: u32) {
        self.seq.store(seq, Ordering::Release);
    }

    /// Current outbound sequence number (next to be stamped).
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Current acknowledgment number.
    pub fn ack(&self) -> u32 {
        self.ack.load(Ordering::Acquire)
    }

    /// Stamp a disguise header onto `seg`, whose first [`TCP_HEADER_LEN`]
    /// bytes are reserved for it and whose remainder is the payload.
    ///
    /// `trailer` is the number of wire bytes that will be appended after
    /// this call (the AEAD tag); `seq` advances by payload + trailer so the
    /// on-wire byte count matches the advertised numbering. The checksum is
    /// finalized over the current contents; the crypto framer refreshes it
    /// after sealing.
    pub fn attach(&self, seg: &mut [u8], trailer: usize) -> Result<(), DisguiseError> {
        self.attach_with_flags(seg, trailer, SEGMENT_FLAGS)
    }

    /// [`Tracker::attach`] with caller-chosen TCP flags. The handshake uses
    /// plain ACK segments so a data segment that races ahead of the final
    /// handshake message can be told apart by its PSH bit.
    pub fn attach_with_flags(
        &self,
        seg: &mut [u8],
        trailer: usize,
        flags: u8,
    ) -> Result<(), DisguiseError> {
        if seg.len() < TCP_HEADER_LEN {
            return Err(DisguiseError::Truncated(seg.len()));
        }
        let wire_len = (seg.len() - TCP_HEADER_LEN + trailer) as u32;
        let seq = self.seq.fetch_add(wire_len, Ordering::AcqRel);
        let hdr = TcpHeader {
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq,
            ack: self.ack(),
            flags,
            window: SEGMENT_WINDOW,
            marked: true,
        };
        hdr.encode(seg);
        finalize_checksum(seg, &self.pseudo);
        Ok(())
    }

    /// Verify the disguise mark on an inbound segment, advance `ack`
    /// monotonically past its payload, and return the parsed header. The
    /// caller strips the header after decryption.
    ///
    /// The first marked segment installs the peer's numbering; after that
    /// `ack` never regresses, out-of-order delivery only raises it to the
    /// highest segment end seen so far.
    pub fn detach(&self, seg: &[u8]) -> Result<TcpHeader, DisguiseError> {
        let hdr = TcpHeader::decode(seg)?;
        if !hdr.marked {
            return Err(DisguiseError::Foreign);
        }
        let end = hdr.seq.wrapping_add((seg.len() - TCP_HEADER_LEN) as u32);
        if !self.ack_primed.swap(true, Ordering::AcqRel) {
            self.ack.store(end, Ordering::Release);
        } else {
            self.ack
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                    seq_after(end, cur).then_some(end)
                })
                .ok();
        }
        Ok(hdr)
    }

    /// Pseudo-header sum shared with the crypto framer for checksum refresh.
    pub fn pseudo(&self) -> PseudoSum {
        self.pseudo
    }
}
