//! Synthetic TCP header encoding/decoding
//!
//! Header layout (20 bytes, no options):
//! ```text
//! +--------+--------+--------+--------+
//! |    Src Port     |    Dst Port     |
//! +--------+--------+--------+--------+
//! |          Sequence Number          |
//! +--------+--------+--------+--------+
//! |       Acknowledgment Number       |
//! +--------+--------+--------+--------+
//! | Offset |  Flags |     Window      |
//! +--------+--------+--------+--------+
//! |    Checksum     |     Urgent      |
//! +--------+--------+--------+--------+
//! ```
//!
//! One reserved bit in the offset byte marks a segment as disguise-owned so
//! the receive path can tell our segments from foreign traffic (genuine
//! retransmission probes, middlebox injections) without trial decryption.

use super::DisguiseError;
use std::net::SocketAddr;

/// TCP header length (data offset 5, no options).
pub const TCP_HEADER_LEN: usize = 20;

/// Private mark bit inside the reserved bits of the offset byte.
/// Offset byte = `offset << 4 | reserved`; real stacks leave the reserved
/// bits zero, so the bit survives NAT and stateless inspection untouched.
pub const MARK_BIT: u8 = 0x04;

/// Parsed view of a disguise segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub marked: bool,
}

impl TcpHeader {
    /// Write this header into the first [`TCP_HEADER_LEN`] bytes of `seg`.
    /// The checksum field is zeroed; call [`finalize_checksum`] afterwards.
    pub fn encode(&self, seg: &mut [u8]) {
        debug_assert!(seg.len() >= TCP_HEADER_LEN);
        seg[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        seg[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        seg[4..8].copy_from_slice(&self.seq.to_be_bytes());
        seg[8..12].copy_from_slice(&self.ack.to_be_bytes());
        seg[12] = (5 << 4) | if self.marked { MARK_BIT } else { 0 };
        seg[13] = self.flags;
        seg[14..16].copy_from_slice(&self.window.to_be_bytes());
        seg[16] = 0;
        seg[17] = 0;
        seg[18] = 0;
        seg[19] = 0;
    }

    /// Parse the header at the front of `seg`.
    pub fn decode(seg: &[u8]) -> Result<Self, DisguiseError> {
        if seg.len() < TCP_HEADER_LEN {
            return Err(DisguiseError::Truncated(seg.len()));
        }
        let offset = seg[12] >> 4;
        if offset != 5 {
            return Err(DisguiseError::BadOffset(offset));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([seg[0], seg[1]]),
            dst_port: u16::from_be_bytes([seg[2], seg[3]]),
            seq: u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]),
            ack: u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]),
            flags: seg[13],
            window: u16::from_be_bytes([seg[14], seg[15]]),
            marked: seg[12] & MARK_BIT != 0,
        })
    }
}

/// Check the disguise mark without a full parse.
pub fn is_marked(seg: &[u8]) -> bool {
    seg.len() >= TCP_HEADER_LEN && seg[12] & MARK_BIT != 0
}

/// Precomputed one's-complement sum of the TCP pseudo-header's fixed part:
/// source address, destination address and protocol number. The segment
/// length is folded in per packet.
#[derive(Debug, Clone, Copy)]
pub struct PseudoSum(u32);

impl PseudoSum {
    /// Build the fixed pseudo-header sum for a connection. IPv6 completeness
    /// is a non-goal; V6 addresses fold their low 32 bits so checksums stay
    /// internally consistent on test-only V6 transports.
    pub fn new(local: &SocketAddr, remote: &SocketAddr) -> Self {
        let mut sum = 0u32;
        for addr in [local, remote] {
            match addr.ip() {
                std::net::IpAddr::V4(ip) => {
                    let o = ip.octets();
                    sum += u32::from(u16::from_be_bytes([o[0], o[1]]));
                    sum += u32::from(u16::from_be_bytes([o[2], o[3]]));
                }
                std::net::IpAddr::V6(ip) => {
                    let o = ip.octets();
                    sum += u32::from(u16::from_be_bytes([o[12], o[13]]));
                    sum += u32::from(u16::from_be_bytes([o[14], o[15]]));
                }
            }
        }
        sum += 6; // protocol: TCP
        Self(sum)
    }

    fn with_len(&self, seg_len: usize) -> u32 {
        self.0 + seg_len as u32
    }
}

/// One's-complement sum of a byte slice, padded with a trailing zero byte
/// when the length is odd.
fn ones_sum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute and store the TCP checksum for a complete segment. The fixed
/// pseudo-header part comes precomputed in `pseudo`; only the length and
/// the segment bytes themselves are summed here, and the latter cannot be
/// cached because sealing rewrites the whole payload.
pub fn finalize_checksum(seg: &mut [u8], pseudo: &PseudoSum) {
    seg[16] = 0;
    seg[17] = 0;
    let ck = fold(pseudo.with_len(seg.len()) + ones_sum(seg));
    seg[16..18].copy_from_slice(&ck.to_be_bytes());
}

/// Verify that a segment's stored checksum matches its contents.
pub fn checksum_valid(seg: &[u8], pseudo: &PseudoSum) -> bool {
    if seg.len() < TCP_HEADER_LEN {
        return false;
    }
    // Summing a correct segment including its checksum field folds to zero.
    fold(pseudo.with_len(seg.len()) + ones_sum(seg)) == 0
}
