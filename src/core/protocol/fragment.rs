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

//! Fragmentation of oversized packets and timed reassembly.
//!
//! Each fragment payload is
//! `fragment_id:8B | index:u16be | total:u16be | original_type:u8 | data`.
//! The data slices are taken from the encoded bytes of the original packet,
//! so reassembly is a concatenate-then-decode.

use crate::core::protocol::packet::{Packet, WireError};
use crate::core::types::{
    MessageType, PeerId, FRAGMENT_TIMEOUT_MS, MAX_FRAGMENT_SETS, MAX_PACKET,
};
use std::collections::{BTreeMap, HashMap};

/// Fragment payload header size.
pub const FRAGMENT_HEADER_LEN: usize = 8 + 2 + 2 + 1;

/// Data bytes carried per fragment, sized so a fully dressed fragment
/// packet (header, recipient, fragment header, signature) stays within
/// `FRAGMENT_THRESHOLD`.
pub const FRAGMENT_DATA_MAX: usize = 400;

/// Parsed fragment payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Random id shared by all fragments of one packet.
    pub fragment_id: [u8; 8],
    /// Zero-based fragment index.
    pub index: u16,
    /// Total fragment count.
    pub total: u16,
    /// Message type of the original packet.
    pub original_type: u8,
}

fn parse_fragment(payload: &[u8]) -> Result<(FragmentHeader, &[u8]), WireError> {
    if payload.len() < FRAGMENT_HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let mut fragment_id = [0u8; 8];
    fragment_id.copy_from_slice(&payload[..8]);
    let index = u16::from_be_bytes([payload[8], payload[9]]);
    let total = u16::from_be_bytes([payload[10], payload[11]]);
    let original_type = payload[12];
    if total == 0 || index >= total {
        return Err(WireError::BadFlags);
    }
    Ok((
        FragmentHeader {
            fragment_id,
            index,
            total,
            original_type,
        },
        &payload[FRAGMENT_HEADER_LEN..],
    ))
}

/// Split an oversized packet into fragment packets.
///
/// The caller supplies the random `fragment_id` and only calls this when the
/// encoded size exceeds `FRAGMENT_THRESHOLD`.
pub fn split(packet: &Packet, fragment_id: [u8; 8]) -> Result<Vec<Packet>, WireError> {
    let encoded = packet.encode()?;
    let total = encoded.len().div_ceil(FRAGMENT_DATA_MAX);
    if total > u16::MAX as usize {
        return Err(WireError::PayloadTooLarge);
    }
    let total = total as u16;

    let mut out = Vec::with_capacity(total as usize);
    for (i, chunk) in encoded.chunks(FRAGMENT_DATA_MAX).enumerate() {
        let index = i as u16;
        let msg_type = if index == 0 {
            MessageType::FragmentStart
        } else if index + 1 == total {
            MessageType::FragmentEnd
        } else {
            MessageType::FragmentContinue
        };

        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
        payload.extend_from_slice(&fragment_id);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&total.to_be_bytes());
        payload.push(packet.msg_type.as_u8());
        payload.extend_from_slice(chunk);

        let mut frag = Packet::new(
            msg_type,
            packet.sender_id,
            packet.recipient_id,
            packet.timestamp_ms,
            payload,
        );
        frag.ttl = packet.ttl;
        out.push(frag);
    }
    Ok(out)
}

struct FragSet {
    total: u16,
    original_type: u8,
    chunks: BTreeMap<u16, Vec<u8>>,
    created_ms: u64,
    bytes: usize,
}

/// Buffers incoming fragments until a set completes or times out.
///
/// At most `MAX_FRAGMENT_SETS` concurrent sets are kept; when full, the
/// oldest set is evicted. Duplicate fragments are dropped silently.
#[derive(Default)]
pub struct Reassembler {
    sets: HashMap<(PeerId, [u8; 8]), FragSet>,
}

impl Reassembler {
    /// Empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight sets.
    pub fn in_flight(&self) -> usize {
        self.sets.len()
    }

    /// Feed one fragment packet. Returns the reconstructed packet when its
    /// set completes.
    pub fn ingest(&mut self, packet: &Packet, now_ms: u64) -> Result<Option<Packet>, WireError> {
        let (header, data) = parse_fragment(&packet.payload)?;

        // A hostile total that could never decode is rejected up front.
        if header.total as usize * FRAGMENT_DATA_MAX > MAX_PACKET + FRAGMENT_DATA_MAX {
            return Err(WireError::PayloadTooLarge);
        }

        let key = (packet.sender_id, header.fragment_id);
        if !self.sets.contains_key(&key) && self.sets.len() >= MAX_FRAGMENT_SETS {
            self.evict_oldest();
        }
        let set = self.sets.entry(key).or_insert_with(|| FragSet {
            total: header.total,
            original_type: header.original_type,
            chunks: BTreeMap::new(),
            created_ms: now_ms,
            bytes: 0,
        });

        if set.total != header.total || set.original_type != header.original_type {
            return Err(WireError::BadFlags);
        }
        if set.chunks.contains_key(&header.index) {
            return Ok(None); // duplicate fragment
        }
        set.bytes += data.len();
        if set.bytes > MAX_PACKET {
            self.sets.remove(&key);
            return Err(WireError::PayloadTooLarge);
        }
        set.chunks.insert(header.index, data.to_vec());

        if set.chunks.len() < set.total as usize {
            return Ok(None);
        }

        let Some(set) = self.sets.remove(&key) else {
            return Ok(None);
        };
        let mut encoded = Vec::with_capacity(set.bytes);
        for (_, chunk) in set.chunks {
            encoded.extend_from_slice(&chunk);
        }
        let packet = Packet::decode(&encoded)?;
        Ok(Some(packet))
    }

    /// Drop sets older than `FRAGMENT_TIMEOUT_MS`; returns how many expired.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.sets.len();
        self.sets
            .retain(|_, s| now_ms.saturating_sub(s.created_ms) < FRAGMENT_TIMEOUT_MS);
        before - self.sets.len()
    }

    /// Drop everything (panic reset).
    pub fn clear(&mut self) {
        self.sets.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .sets
            .iter()
            .min_by_key(|(_, s)| s.created_ms)
            .map(|(k, _)| *k)
        {
            self.sets.remove(&key);
        }
    }
}
