//! AEAD framing of TCP-shaped segments
//!
//! The unit of encryption is a complete disguise segment: a 20-byte TCP
//! header followed by the payload. The header stays in clear (it must look
//! like TCP), the payload is sealed in place and the 16-byte tag is appended
//! as extra payload bytes, after which the TCP checksum is refreshed from
//! the connection's precomputed pseudo-header sum.
//!
//! ## Nonce derivation
//!
//! nonce = header seq (4 bytes) || per-direction salt (8 bytes).
//!
//! Uniqueness for the key's lifetime: within one direction `seq` advances by
//! the wire payload length on every segment (always > 0 once the tag is
//! counted), the two directions use disjoint HKDF-derived salts, and
//! [`SegmentCipher::seal`] refuses to run once the direction has moved close
//! enough to 2^32 bytes that `seq` could revisit a used value.
//!
//! ## Associated data
//!
//! The first 12 header bytes (ports, seq, ack). The checksum field lives at
//! bytes 16..18 and is rewritten after sealing, so the AAD is bit-identical
//! at seal and open time on both ends.

use super::{CryptoError, Hkdf, TunnelKey, NONCE_LEN, TAG_LEN};
use crate::disguise::{finalize_checksum, PseudoSum, TCP_HEADER_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of header bytes bound as associated data.
const AAD_LEN: usize = 12;

/// Stop sealing this far short of the 32-bit sequence space so a wrapped
/// `seq` can never collide with a nonce already used under this key.
const SEQ_SPACE_MARGIN: u64 = 128 * 1024;

fn direction_salt(key: &TunnelKey, transcript: &[u8], label: &[u8]) -> [u8; 8] {
    let mut salt = [0u8; 8];
    Hkdf::new(Some(transcript), &key.0)
        .expand(label, &mut salt)
        .expect("salt derivation cannot fail for 8-byte output");
    salt
}

/// AEAD framer for one tunnel connection. Stateless apart from the cipher
/// and the nonce-exhaustion guard.
pub struct SegmentCipher {
    key: LessSafeKey,
    tx_salt: [u8; 8],
    rx_salt: [u8; 8],
    pseudo: PseudoSum,
    /// Wire bytes sealed so far; guards the seq-derived nonce space.
    sealed: AtomicU64,
}

impl SegmentCipher {
    fn new(
        key: &TunnelKey,
        tx_salt: [u8; 8],
        rx_salt: [u8; 8],
        pseudo: PseudoSum,
    ) -> Result<Self, CryptoError> {
        let unbound =
            UnboundKey::new(&AES_128_GCM, &key.0).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            tx_salt,
            rx_salt,
            pseudo,
            sealed: AtomicU64::new(0),
        })
    }

    /// Framer for the client side: seals client→server, opens server→client.
    pub fn client(
        key: &TunnelKey,
        transcript: &[u8],
        pseudo: PseudoSum,
    ) -> Result<Self, CryptoError> {
        Self::new(
            key,
            direction_salt(key, transcript, b"mirage nonce client"),
            direction_salt(key, transcript, b"mirage nonce server"),
            pseudo,
        )
    }

    /// Framer for the server side, mirrored salts.
    pub fn server(
        key: &TunnelKey,
        transcript: &[u8],
        pseudo: PseudoSum,
    ) -> Result<Self, CryptoError> {
        Self::new(
            key,
            direction_salt(key, transcript, b"mirage nonce server"),
            direction_salt(key, transcript, b"mirage nonce client"),
            pseudo,
        )
    }

    fn nonce(seg: &[u8], salt: &[u8; 8]) -> Nonce {
        let mut bytes = [0u8; NONCE_LEN];
        bytes[0..4].copy_from_slice(&seg[4..8]);
        bytes[4..12].copy_from_slice(salt);
        Nonce::assume_unique_for_key(bytes)
    }

    /// Encrypt a segment's payload in place and append the tag.
    ///
    /// No allocation occurs when the caller pre-reserves [`TAG_LEN`] bytes
    /// of trailing capacity.
    pub fn seal(&self, seg: &mut Vec<u8>) -> Result<(), CryptoError> {
        if seg.len() < TCP_HEADER_LEN {
            return Err(CryptoError::ShortBuffer { need: TCP_HEADER_LEN, got: seg.len() });
        }
        let wire = (seg.len() - TCP_HEADER_LEN + TAG_LEN) as u64;
        if self.sealed.fetch_add(wire, Ordering::AcqRel) + wire > u64::from(u32::MAX) - SEQ_SPACE_MARGIN
        {
            return Err(CryptoError::NonceExhausted);
        }

        let nonce = Self::nonce(seg, &self.tx_salt);
        let mut aad = [0u8; AAD_LEN];
        aad.copy_from_slice(&seg[..AAD_LEN]);

        let (_, payload) = seg.split_at_mut(TCP_HEADER_LEN);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), payload)
            .map_err(|_| CryptoError::Authentication)?;
        seg.extend_from_slice(tag.as_ref());

        finalize_checksum(seg, &self.pseudo);
        Ok(())
    }

    /// Verify and decrypt a segment's payload in place, truncating the tag.
    ///
    /// An authentication failure discards the payload; the segment must not
    /// be retried.
    pub fn open(&self, seg: &mut Vec<u8>) -> Result<(), CryptoError> {
        let need = TCP_HEADER_LEN + TAG_LEN;
        if seg.len() < need {
            return Err(CryptoError::ShortBuffer { need, got: seg.len() });
        }

        let nonce = Self::nonce(seg, &self.rx_salt);
        let mut aad = [0u8; AAD_LEN];
        aad.copy_from_slice(&seg[..AAD_LEN]);

        let (_, payload) = seg.split_at_mut(TCP_HEADER_LEN);
        self.key
            .open_in_place(nonce, Aad::from(aad), payload)
            .map_err(|_| CryptoError::Authentication)?;

        seg.truncate(seg.len() - TAG_LEN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disguise::{checksum_valid, TcpHeader, SEGMENT_FLAGS, SEGMENT_WINDOW};

    fn pseudo() -> PseudoSum {
        PseudoSum::new(
            &"198.51.100.1:9000".parse().unwrap(),
            &"198.51.100.2:443".parse().unwrap(),
        )
    }

    fn pair() -> (SegmentCipher, SegmentCipher) {
        let key = TunnelKey([0x42; 16]);
        let transcript = [7u8; 32];
        (
            SegmentCipher::client(&key, &transcript, pseudo()).unwrap(),
            SegmentCipher::server(&key, &transcript, pseudo()).unwrap(),
        )
    }

    fn segment(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut seg = Vec::with_capacity(TCP_HEADER_LEN + payload.len() + TAG_LEN);
        seg.resize(TCP_HEADER_LEN, 0);
        seg.extend_from_slice(payload);
        TcpHeader {
            src_port: 9000,
            dst_port: 443,
            seq,
            ack: 77,
            flags: SEGMENT_FLAGS,
            window: SEGMENT_WINDOW,
            marked: true,
        }
        .encode(&mut seg);
        seg
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (client, server) = pair();
        let mut seg = segment(1000, b"tunnel payload");

        client.seal(&mut seg).unwrap();
        assert_eq!(seg.len(), TCP_HEADER_LEN + 14 + TAG_LEN);
        assert!(checksum_valid(&seg, &pseudo()));
        assert_ne!(&seg[TCP_HEADER_LEN..TCP_HEADER_LEN + 14], b"tunnel payload");

        server.open(&mut seg).unwrap();
        assert_eq!(&seg[TCP_HEADER_LEN..], b"tunnel payload");
    }

    #[test]
    fn test_checksum_valid_across_payload_sizes() {
        let (client, _) = pair();
        for len in [0usize, 1, 7, 100, 1400] {
            let payload = vec![0xA5u8; len];
            let mut seg = segment(len as u32 * 131, &payload);
            client.seal(&mut seg).unwrap();
            assert!(checksum_valid(&seg, &pseudo()), "len={}", len);
        }
    }

    #[test]
    fn test_tamper_detection() {
        let (client, server) = pair();
        let mut seg = segment(5, b"data");
        client.seal(&mut seg).unwrap();
        let last = seg.len() - 1;
        seg[last] ^= 0xFF;
        assert!(matches!(server.open(&mut seg), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_header_is_authenticated() {
        let (client, server) = pair();
        let mut seg = segment(5, b"data");
        client.seal(&mut seg).unwrap();
        // Flip a bit of the ack field: AAD covers it.
        seg[9] ^= 0x01;
        assert!(matches!(server.open(&mut seg), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_directions_use_distinct_nonces() {
        let (client, server) = pair();
        // Same seq both ways; ciphertexts must differ because the
        // per-direction salts differ.
        let mut up = segment(9999, b"same bytes");
        let mut down = segment(9999, b"same bytes");
        client.seal(&mut up).unwrap();
        server.seal(&mut down).unwrap();
        assert_ne!(up[TCP_HEADER_LEN..], down[TCP_HEADER_LEN..]);
    }

    #[test]
    fn test_short_buffer() {
        let (_, server) = pair();
        let mut seg = vec![0u8; TCP_HEADER_LEN + 3];
        assert!(matches!(
            server.open(&mut seg),
            Err(CryptoError::ShortBuffer { need: 36, got: 23 })
        ));
    }

    #[test]
    fn test_nonce_exhaustion_guard() {
        let (client, _) = pair();
        client.sealed.store(u64::from(u32::MAX), Ordering::Release);
        let mut seg = segment(1, b"x");
        assert!(matches!(client.seal(&mut seg), Err(CryptoError::NonceExhausted)));
    }
}
