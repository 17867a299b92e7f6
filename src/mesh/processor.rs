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

//! Ingress pipeline: decode, reassemble, guard, verify, plan relay.
//!
//! The processor owns the byte-level path. Type dispatch (announce
//! handling, session feeding, UI events) stays with the node loop, which is
//! the single writer of the peer table and session state.

use crate::core::protocol::fragment::Reassembler;
use crate::core::protocol::packet::{Packet, TTL_OFFSET, WireError};
use crate::core::protocol::tlv::AnnouncePayload;
use crate::core::types::{MessageType, PeerId, MAX_TTL};
use crate::mesh::graph::{MeshGraph, RelayPlan};
use crate::mesh::guard::{DropReason, IngressGuard, SignatureError};
use crate::mesh::peers::PeerManager;
use thiserror::Error;

/// Why ingress rejected a packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DropCause {
    /// Framing failure.
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    /// Guard rejection (dedup, replay, rate).
    #[error("guard: {0:?}")]
    Guard(DropReason),
    /// Signature rejection.
    #[error("signature: {0}")]
    Signature(#[from] SignatureError),
}

/// Result of feeding one wire packet through ingress.
#[derive(Debug, PartialEq)]
pub struct Ingest {
    /// Fully validated packet for local dispatch. `None` when the input was
    /// a fragment that did not yet complete its set.
    pub packet: Option<Packet>,
    /// Relay decision for the received bytes.
    pub relay: RelayPlan,
    /// TTL-decremented copy of the wire bytes to forward when relaying.
    pub relay_bytes: Option<Vec<u8>>,
    /// Hops travelled so far (`MAX_TTL - ttl`), for loop telemetry.
    pub hops: u8,
}

/// The ingress processor: guard plus fragment reassembly.
pub struct PacketProcessor {
    guard: IngressGuard,
    reassembler: Reassembler,
    relay_enabled: bool,
}

impl PacketProcessor {
    /// New processor; `relay_enabled` gates all forwarding.
    pub fn new(relay_enabled: bool) -> Self {
        Self {
            guard: IngressGuard::new(),
            reassembler: Reassembler::new(),
            relay_enabled,
        }
    }

    /// Sweep expired fragment sets. Returns how many were dropped.
    pub fn sweep_fragments(&mut self, now_ms: u64) -> usize {
        self.reassembler.sweep(now_ms)
    }

    /// Forget per-sender guard state for a pruned peer.
    pub fn forget_sender(&mut self, peer: &PeerId) {
        self.guard.forget_sender(peer);
    }

    /// Drop all guard and reassembly state (panic reset).
    pub fn clear(&mut self) {
        self.guard.clear();
        self.reassembler.clear();
    }

    fn verify(
        packet: &Packet,
        canonical: &[u8],
        peers: &PeerManager,
    ) -> Result<(), SignatureError> {
        let bound = peers.signing_key(&packet.sender_id);
        // Bootstrap: an unknown announcer is checked against the signing
        // key it carries inline; the key is pinned only after this passes.
        let inline = if packet.msg_type == MessageType::Announce && bound.is_none() {
            AnnouncePayload::decode(&packet.payload)
                .ok()
                .map(|a| a.signing_public_key)
        } else {
            None
        };
        IngressGuard::verify_signature(packet, canonical, bound.as_ref(), inline.as_ref())
    }

    /// Feed one wire packet from `inbound_peer` (when the link is bound).
    pub fn ingest(
        &mut self,
        bytes: &[u8],
        inbound_peer: Option<PeerId>,
        peers: &PeerManager,
        graph: &MeshGraph,
        local: PeerId,
        now_ms: u64,
    ) -> Result<Ingest, DropCause> {
        let packet = Packet::decode(bytes)?;
        let canonical = Packet::canonical_of_wire(bytes)?;

        self.guard
            .admit(&packet, &canonical, now_ms)
            .map_err(DropCause::Guard)?;
        Self::verify(&packet, &canonical, peers)?;

        let ttl = packet.ttl.min(MAX_TTL);
        let hops = MAX_TTL - ttl;

        // Relay planning on the wire bytes; a TTL of 1 or 0 is processed
        // locally but never forwarded.
        let relay = if self.relay_enabled && ttl >= 2 {
            graph.plan_relay(&packet, inbound_peer, local, now_ms)
        } else {
            RelayPlan::None
        };
        let relay_bytes = match relay {
            RelayPlan::None => None,
            _ => {
                let mut copy = bytes.to_vec();
                copy[TTL_OFFSET] = ttl - 1;
                Some(copy)
            }
        };

        // Fragments feed the reassembler; everything else dispatches as-is.
        let packet = if packet.msg_type.is_fragment() {
            match self.reassembler.ingest(&packet, now_ms) {
                Ok(Some(inner)) => {
                    // The reassembled packet is validated in its own right
                    // but never re-relayed: its fragments already were.
                    let inner_canonical = inner.canonical_for_signing()?;
                    self.guard
                        .admit(&inner, &inner_canonical, now_ms)
                        .map_err(DropCause::Guard)?;
                    Self::verify(&inner, &inner_canonical, peers)?;
                    Some(inner)
                }
                Ok(None) => None,
                Err(e) => return Err(DropCause::Wire(e)),
            }
        } else {
            Some(packet)
        };

        Ok(Ingest {
            packet,
            relay,
            relay_bytes,
            hops,
        })
    }
}
