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

//! Transport ports the core is wired against.
//!
//! The radio driver (BLE GATT or otherwise) and the relay overlay live
//! outside this crate. Outbound operations are trait methods; inbound
//! traffic arrives on mpsc channels the node loop selects on. Link IDs are
//! opaque strings that never survive restarts; the core maps them to peer
//! IDs by observing ANNOUNCE on the link.

use crate::core::types::PeerId;
use std::collections::HashMap;

/// Opaque transport link identifier.
pub type LinkId = String;

/// Inbound events from the mesh transport driver.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// Raw packet bytes received on a link.
    Packet {
        /// Wire bytes.
        bytes: Vec<u8>,
        /// Link the bytes arrived on.
        link: LinkId,
    },
    /// A link came up.
    LinkUp(LinkId),
    /// A link went away.
    LinkDown(LinkId),
}

/// Mesh transport port: broadcast/unicast over one or more radio links.
pub trait MeshTransport: Send + Sync {
    /// Send to every connected link.
    fn broadcast(&self, bytes: &[u8]);
    /// Send to one link; `false` means the link is gone.
    fn send_to(&self, link: &LinkId, bytes: &[u8]) -> bool;
    /// This node's own link identifier.
    fn local_link_id(&self) -> LinkId;
    /// Bring the radio up.
    fn start(&self);
    /// Tear the radio down.
    fn stop(&self);
}

/// Inbound events from the overlay transport driver.
#[derive(Clone, Debug)]
pub enum OverlayEvent {
    /// A gift-wrapped envelope addressed to us was unsealed by the driver.
    GiftWrapped {
        /// Sender's overlay public key.
        from: [u8; 32],
        /// Inner Noise payload record, identical to the mesh format.
        inner: Vec<u8>,
    },
    /// Overlay reachability changed.
    Reachable(bool),
}

/// Overlay transport status snapshot.
#[derive(Clone, Debug, Default)]
pub struct OverlayStatus {
    /// Driver is running.
    pub running: bool,
    /// Relay bootstrap progress, 0..=100.
    pub bootstrap_percent: u8,
    /// Last driver error, if any.
    pub last_error: Option<String>,
}

impl OverlayStatus {
    /// True when sends can be handed to the overlay right now.
    pub fn is_reachable(&self) -> bool {
        self.running && self.bootstrap_percent >= 100
    }
}

/// Overlay transport port: sealed envelopes through a relay network.
pub trait OverlayTransport: Send + Sync {
    /// Seal `inner` to `to_pub` and hand it to the relays.
    fn send_gift_wrapped(&self, to_pub: &[u8; 32], inner: &[u8]);
    /// Start listening for envelopes addressed to `pubkey`.
    fn subscribe(&self, pubkey: &[u8; 32]);
    /// Stop listening for `pubkey`.
    fn unsubscribe(&self, pubkey: &[u8; 32]);
    /// Current reachability.
    fn status(&self) -> OverlayStatus;
}

/// Bidirectional link/peer mapping maintained from ANNOUNCE observations.
#[derive(Default)]
pub struct LinkMap {
    peer_by_link: HashMap<LinkId, PeerId>,
    link_by_peer: HashMap<PeerId, LinkId>,
}

impl LinkMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `link` to `peer`, replacing any stale binding either way.
    pub fn bind(&mut self, link: LinkId, peer: PeerId) {
        if let Some(old_peer) = self.peer_by_link.get(&link) {
            self.link_by_peer.remove(old_peer);
        }
        if let Some(old_link) = self.link_by_peer.get(&peer) {
            self.peer_by_link.remove(old_link);
        }
        self.peer_by_link.insert(link.clone(), peer);
        self.link_by_peer.insert(peer, link);
    }

    /// Peer observed on `link`, if any.
    pub fn peer_for_link(&self, link: &LinkId) -> Option<PeerId> {
        self.peer_by_link.get(link).copied()
    }

    /// Link a peer is directly reachable on, if any.
    pub fn link_for_peer(&self, peer: &PeerId) -> Option<&LinkId> {
        self.link_by_peer.get(peer)
    }

    /// Drop a link (transport reported it down). Returns the peer that was
    /// bound to it.
    pub fn unbind_link(&mut self, link: &LinkId) -> Option<PeerId> {
        let peer = self.peer_by_link.remove(link)?;
        self.link_by_peer.remove(&peer);
        Some(peer)
    }

    /// Drop a peer binding (peer pruned or rebound).
    pub fn unbind_peer(&mut self, peer: &PeerId) -> Option<LinkId> {
        let link = self.link_by_peer.remove(peer)?;
        self.peer_by_link.remove(&link);
        Some(link)
    }

    /// Rebind a rotated peer ID onto the link of its old identity.
    pub fn rebind_peer(&mut self, old: &PeerId, new: PeerId) {
        if let Some(link) = self.unbind_peer(old) {
            self.bind(link, new);
        }
    }

    /// Peers currently bound to a live link.
    pub fn direct_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.link_by_peer.keys()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.peer_by_link.clear();
        self.link_by_peer.clear();
    }
}
