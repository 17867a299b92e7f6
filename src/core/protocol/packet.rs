// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Binary packet format: encode/decode and canonical bytes for signing.
//!
//! ## Wire layout (version 1)
//! ```text
//! version:u8 | type:u8 | ttl:u8 | timestamp_ms:u64be | flags:u8 |
//! payload_len:u16be | sender_id:8B | [recipient_id:8B] | payload |
//! [route: count:u8 + count*8B] | [signature:64B]
//! ```
//!
//! ## Canonical bytes for signing
//! The full encoding with the signature omitted, its flag cleared, and the
//! TTL byte normalized to zero. TTL is excluded so that decrement-then-forward
//! relaying does not invalidate signatures; the route, when present, IS part
//! of the signed bytes.

use crate::core::protocol::codec;
use crate::core::types::{MessageType, PeerId, MAX_PACKET, MAX_PAYLOAD, PROTOCOL_VERSION};
use thiserror::Error;

/// Fixed header size: version..sender_id inclusive.
pub const HEADER_LEN: usize = 22;

/// Byte offset of the TTL field.
pub const TTL_OFFSET: usize = 2;

/// Byte offset of the flags field.
pub const FLAGS_OFFSET: usize = 11;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Route lists longer than this are rejected as malformed.
pub const ROUTE_MAX_HOPS: usize = 16;

/// Wire decode/encode failures. Bad packets are dropped, counted, and never
/// relayed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the advertised fields.
    #[error("truncated packet")]
    Truncated,
    /// Version byte is not the supported protocol version.
    #[error("unknown version")]
    UnknownVersion,
    /// Type byte does not map to a known message type.
    #[error("unknown message type")]
    UnknownType,
    /// Reserved flag bits set, or framing inconsistent with flags.
    #[error("bad flags")]
    BadFlags,
    /// Payload exceeds `MAX_PAYLOAD` (raw or after decompression).
    #[error("payload too large")]
    PayloadTooLarge,
    /// Route count is zero or exceeds `ROUTE_MAX_HOPS`.
    #[error("invalid route count")]
    RouteCountInvalid,
    /// Compressed payload failed to decompress.
    #[error("compression")]
    Compression,
}

/// Optional-field flag bitset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Recipient ID field present.
    pub const HAS_RECIPIENT: u8 = 0x01;
    /// Signature field present.
    pub const HAS_SIGNATURE: u8 = 0x02;
    /// Payload is LZ4-compressed on the wire.
    pub const IS_COMPRESSED: u8 = 0x04;
    /// Source route field present.
    pub const HAS_ROUTE: u8 = 0x08;

    const KNOWN: u8 = 0x0F;

    /// Wrap a raw flags byte; reserved bits are rejected by `decode`.
    pub fn new(v: u8) -> Self {
        Self(v)
    }

    /// Raw byte.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// A decoded (logical) packet. `payload` is always the uncompressed bytes;
/// compression is a wire-level concern applied inside `encode`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Message type.
    pub msg_type: MessageType,
    /// Remaining hop budget, 0..=7.
    pub ttl: u8,
    /// Sender clock, milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
    /// Sender peer ID.
    pub sender_id: PeerId,
    /// Optional recipient; `None` or the broadcast sentinel means broadcast.
    pub recipient_id: Option<PeerId>,
    /// Logical payload bytes.
    pub payload: Vec<u8>,
    /// Optional intermediate hops for source-routed unicast.
    pub route: Option<Vec<PeerId>>,
    /// Optional Ed25519 signature over the canonical bytes.
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Packet {
    /// Construct an unsigned packet with default TTL.
    pub fn new(
        msg_type: MessageType,
        sender_id: PeerId,
        recipient_id: Option<PeerId>,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            ttl: crate::core::types::MAX_TTL,
            timestamp_ms,
            sender_id,
            recipient_id,
            payload,
            route: None,
            signature: None,
        }
    }

    /// True when the packet is not addressed to a single peer.
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(r) => r.is_broadcast(),
        }
    }

    fn flags_for_wire(&self, compressed: bool) -> u8 {
        let mut f = 0u8;
        if self.recipient_id.is_some() {
            f |= PacketFlags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            f |= PacketFlags::HAS_SIGNATURE;
        }
        if compressed {
            f |= PacketFlags::IS_COMPRESSED;
        }
        if self.route.is_some() {
            f |= PacketFlags::HAS_ROUTE;
        }
        f
    }

    fn encode_inner(&self, include_signature: bool, zero_ttl: bool) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge);
        }
        if let Some(route) = &self.route {
            if route.is_empty() || route.len() > ROUTE_MAX_HOPS {
                return Err(WireError::RouteCountInvalid);
            }
        }

        let (wire_payload, compressed) = match codec::compress_if_worthwhile(&self.payload) {
            Some(c) => (c, true),
            None => (self.payload.clone(), false),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + wire_payload.len() + 96);
        out.push(PROTOCOL_VERSION);
        out.push(self.msg_type.as_u8());
        out.push(if zero_ttl { 0 } else { self.ttl });
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        let mut flags = self.flags_for_wire(compressed);
        if !include_signature {
            flags &= !PacketFlags::HAS_SIGNATURE;
        }
        out.push(flags);
        out.extend_from_slice(&(wire_payload.len() as u16).to_be_bytes());
        out.extend_from_slice(self.sender_id.as_bytes());
        if let Some(r) = &self.recipient_id {
            out.extend_from_slice(r.as_bytes());
        }
        out.extend_from_slice(&wire_payload);
        if let Some(route) = &self.route {
            out.push(route.len() as u8);
            for hop in route {
                out.extend_from_slice(hop.as_bytes());
            }
        }
        if include_signature {
            if let Some(sig) = &self.signature {
                out.extend_from_slice(sig);
            }
        }

        if out.len() > MAX_PACKET {
            return Err(WireError::PayloadTooLarge);
        }
        Ok(out)
    }

    /// Encode to wire bytes. Compression is applied when the payload is at
    /// least `COMPRESS_THRESHOLD` bytes and shrinks by 10% or more.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        self.encode_inner(true, false)
    }

    /// Canonical bytes for signing: signature omitted, signature flag
    /// cleared, TTL normalized to zero.
    pub fn canonical_for_signing(&self) -> Result<Vec<u8>, WireError> {
        self.encode_inner(false, true)
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(WireError::UnknownVersion);
        }
        let msg_type = MessageType::from_u8(bytes[1]).ok_or(WireError::UnknownType)?;
        let ttl = bytes[TTL_OFFSET];
        let timestamp_ms = u64::from_be_bytes(
            bytes[3..11].try_into().map_err(|_| WireError::Truncated)?,
        );
        let flags = PacketFlags::new(bytes[FLAGS_OFFSET]);
        if flags.as_u8() & !PacketFlags::KNOWN != 0 {
            return Err(WireError::BadFlags);
        }
        let payload_len =
            u16::from_be_bytes(bytes[12..14].try_into().map_err(|_| WireError::Truncated)?)
                as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge);
        }
        let mut sender = [0u8; 8];
        sender.copy_from_slice(&bytes[14..22]);
        let sender_id = PeerId::from_bytes(sender);

        let mut pos = HEADER_LEN;
        let recipient_id = if flags.has(PacketFlags::HAS_RECIPIENT) {
            if bytes.len() < pos + 8 {
                return Err(WireError::Truncated);
            }
            let mut r = [0u8; 8];
            r.copy_from_slice(&bytes[pos..pos + 8]);
            pos += 8;
            Some(PeerId::from_bytes(r))
        } else {
            None
        };

        if bytes.len() < pos + payload_len {
            return Err(WireError::Truncated);
        }
        let wire_payload = &bytes[pos..pos + payload_len];
        pos += payload_len;

        let route = if flags.has(PacketFlags::HAS_ROUTE) {
            if bytes.len() < pos + 1 {
                return Err(WireError::Truncated);
            }
            let count = bytes[pos] as usize;
            pos += 1;
            if count == 0 || count > ROUTE_MAX_HOPS {
                return Err(WireError::RouteCountInvalid);
            }
            if bytes.len() < pos + count * 8 {
                return Err(WireError::Truncated);
            }
            let mut hops = Vec::with_capacity(count);
            for _ in 0..count {
                let mut h = [0u8; 8];
                h.copy_from_slice(&bytes[pos..pos + 8]);
                hops.push(PeerId::from_bytes(h));
                pos += 8;
            }
            Some(hops)
        } else {
            None
        };

        let signature = if flags.has(PacketFlags::HAS_SIGNATURE) {
            if bytes.len() < pos + SIGNATURE_LEN {
                return Err(WireError::Truncated);
            }
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(&bytes[pos..pos + SIGNATURE_LEN]);
            pos += SIGNATURE_LEN;
            Some(sig)
        } else {
            None
        };

        if pos != bytes.len() {
            // Trailing garbage means the flags do not describe the framing.
            return Err(WireError::BadFlags);
        }

        let payload = if flags.has(PacketFlags::IS_COMPRESSED) {
            codec::decompress(wire_payload, MAX_PAYLOAD)?
        } else {
            wire_payload.to_vec()
        };

        Ok(Self {
            msg_type,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id,
            payload,
            route,
            signature,
        })
    }

    /// Canonical signing bytes recomputed from received wire bytes, without
    /// a re-encode: strips the trailing signature, clears its flag, zeroes
    /// the TTL byte.
    pub fn canonical_of_wire(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let flags = PacketFlags::new(bytes[FLAGS_OFFSET]);
        let mut out = if flags.has(PacketFlags::HAS_SIGNATURE) {
            if bytes.len() < HEADER_LEN + SIGNATURE_LEN {
                return Err(WireError::Truncated);
            }
            bytes[..bytes.len() - SIGNATURE_LEN].to_vec()
        } else {
            bytes.to_vec()
        };
        out[TTL_OFFSET] = 0;
        out[FLAGS_OFFSET] &= !PacketFlags::HAS_SIGNATURE;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MAX_TTL;

    fn pkt(payload: Vec<u8>) -> Packet {
        Packet::new(
            MessageType::Message,
            PeerId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
            Some(PeerId::from_bytes([9, 9, 9, 9, 9, 9, 9, 9])),
            1_700_000_000_000,
            payload,
        )
    }

    #[test]
    fn roundtrip_simple() {
        let p = pkt(b"hello mesh".to_vec());
        let bytes = p.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn roundtrip_with_route() {
        let mut p = pkt(b"routed".to_vec());
        p.route = Some(vec![
            PeerId::from_bytes([0xA; 8]),
            PeerId::from_bytes([0xB; 8]),
        ]);
        let bytes = p.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn canonical_excludes_signature_and_ttl() {
        let mut p = pkt(b"signed".to_vec());
        p.signature = Some([0x5A; 64]);
        p.ttl = MAX_TTL;
        let canonical = p.canonical_for_signing().unwrap();
        assert!(!canonical
            .windows(SIGNATURE_LEN)
            .any(|w| w == [0x5A; 64].as_slice()));
        assert_eq!(canonical[TTL_OFFSET], 0);

        // The wire-side recomputation matches the sender-side encoding.
        let wire = p.encode().unwrap();
        assert_eq!(Packet::canonical_of_wire(&wire).unwrap(), canonical);
    }

    #[test]
    fn canonical_stable_across_relay_decrement() {
        let mut p = pkt(b"relayed".to_vec());
        p.signature = Some([7; 64]);
        let mut wire = p.encode().unwrap();
        let before = Packet::canonical_of_wire(&wire).unwrap();
        wire[TTL_OFFSET] -= 1;
        assert_eq!(Packet::canonical_of_wire(&wire).unwrap(), before);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = pkt(vec![1]).encode().unwrap();
        bytes[0] = 9;
        assert_eq!(Packet::decode(&bytes), Err(WireError::UnknownVersion));
    }

    #[test]
    fn rejects_reserved_flags() {
        let mut bytes = pkt(vec![1]).encode().unwrap();
        bytes[FLAGS_OFFSET] |= 0x80;
        assert_eq!(Packet::decode(&bytes), Err(WireError::BadFlags));
    }

    #[test]
    fn rejects_truncated() {
        let bytes = pkt(b"0123456789".to_vec()).encode().unwrap();
        assert_eq!(
            Packet::decode(&bytes[..bytes.len() - 3]),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = pkt(vec![1]).encode().unwrap();
        bytes.push(0);
        assert_eq!(Packet::decode(&bytes), Err(WireError::BadFlags));
    }

    #[test]
    fn compressible_payload_roundtrips() {
        // Highly repetitive payload well past the compression threshold.
        let p = pkt(vec![0x41; 2048]);
        let bytes = p.encode().unwrap();
        assert!(bytes.len() < 2048);
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }
}
