//! FakeTCP disguise layer
//!
//! Wraps every data-plane payload in a synthetic, checksum-valid TCP header
//! so passive inspection sees an ordinary TCP stream. No kernel TCP state
//! exists behind these headers; the seq/ack numbers are maintained by the
//! [`Tracker`] and seeded from the handshake so the data plane is numerically
//! continuous with the scripted exchange that preceded it.

mod header;
mod tracker;

pub use header::{
    checksum_valid, finalize_checksum, is_marked, PseudoSum, TcpHeader, MARK_BIT, TCP_HEADER_LEN,
};
pub use tracker::Tracker;

use thiserror::Error;

/// Disguise layer errors
#[derive(Debug, Error)]
pub enum DisguiseError {
    #[error("Segment too short: {0} bytes, need at least {TCP_HEADER_LEN}")]
    Truncated(usize),

    #[error("Segment does not carry the disguise mark")]
    Foreign,

    #[error("Unsupported data offset: {0} words")]
    BadOffset(u8),
}

/// TCP flags stamped on every disguise segment.
pub const SEGMENT_FLAGS: u8 = 0x18; // PSH | ACK

/// Advertised receive window. A plausible, commonly observed value
/// (Linux default MSS clamp), fixed per connection.
pub const SEGMENT_WINDOW: u16 = 64240;
