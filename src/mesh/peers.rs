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

//! Peer table: nickname/key bindings, fingerprint index, rotation merging,
//! announce bookkeeping, staleness pruning.
//!
//! A record with a non-null static key has a fixed fingerprint forever.
//! When the same fingerprint shows up under a new peer ID, the record is
//! rebound: the old peer-ID edge is removed and the new one attached; the
//! fingerprint never changes.

use crate::core::types::{Fingerprint, PeerId, ANNOUNCE_MIN_INTERVAL_MS, PEER_STALE_TIMEOUT_MS};
use std::collections::BTreeMap;
use tracing::debug;

/// Everything the mesh knows about one peer.
#[derive(Clone, Debug, Default)]
pub struct PeerRecord {
    /// Announced nickname.
    pub nickname: Option<String>,
    /// X25519 static public key from ANNOUNCE.
    pub static_noise_pub: Option<[u8; 32]>,
    /// Ed25519 signing key from ANNOUNCE.
    pub signing_pub: Option<[u8; 32]>,
    /// `SHA-256(static_noise_pub)`; fixed once set.
    pub fingerprint: Option<Fingerprint>,
    /// Last observed signal strength.
    pub rssi: Option<i8>,
    /// Last reception, milliseconds.
    pub last_seen_ms: u64,
    /// Peer is on a live link of ours.
    pub is_direct: bool,
    /// Peer has announced itself to us.
    pub announced_to_us: bool,
    /// We sent this peer a peer-directed announce this session.
    pub we_announced: bool,
    /// Signed announce verified against the carried signing key.
    pub verified: bool,
}

/// Outcome of processing an identity announcement.
#[derive(Debug, PartialEq, Eq)]
pub struct AnnounceOutcome {
    /// First time we see this peer ID.
    pub is_new: bool,
    /// The fingerprint was previously bound to this peer ID, which the new
    /// announce replaces. Sessions and chats keyed by it must be merged.
    pub rebound_from: Option<PeerId>,
}

/// Reason an announce broadcast is being considered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceTrigger {
    /// 30-second periodic timer.
    Periodic,
    /// Mesh just started.
    MeshStart,
    /// Our nickname changed.
    NicknameChange,
    /// A new direct link appeared.
    NewDirectLink,
}

/// Peer table plus fingerprint secondary index.
#[derive(Default)]
pub struct PeerManager {
    peers: BTreeMap<PeerId, PeerRecord>,
    by_fingerprint: BTreeMap<Fingerprint, PeerId>,
    last_broadcast_announce_ms: u64,
}

impl PeerManager {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record.
    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    /// Current peer ID bound to a fingerprint.
    pub fn peer_for_fingerprint(&self, fp: &Fingerprint) -> Option<PeerId> {
        self.by_fingerprint.get(fp).copied()
    }

    /// Signing key currently bound to a peer, for signature verification.
    pub fn signing_key(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.peers.get(peer).and_then(|r| r.signing_pub)
    }

    /// Record an identity announcement, creating, updating, or rebinding
    /// the record as needed.
    pub fn observe_announce(
        &mut self,
        peer: PeerId,
        nickname: &str,
        static_pub: [u8; 32],
        signing_pub: [u8; 32],
        verified: bool,
        now_ms: u64,
    ) -> AnnounceOutcome {
        let fp = Fingerprint::of_static_key(&static_pub);

        let rebound_from = match self.by_fingerprint.get(&fp) {
            Some(old) if *old != peer => {
                let old = *old;
                // Same identity under a new peer ID: detach the old edge.
                let prior = self.peers.remove(&old);
                debug!(%old, new = %peer, fingerprint = %fp, "peer id rotated");
                if let Some(mut record) = prior {
                    record.last_seen_ms = now_ms;
                    self.peers.insert(peer, record);
                }
                Some(old)
            }
            _ => None,
        };

        let is_new = !self.peers.contains_key(&peer);
        let record = self.peers.entry(peer).or_default();
        record.nickname = Some(nickname.to_string());
        record.static_noise_pub = Some(static_pub);
        record.signing_pub = Some(signing_pub);
        record.fingerprint = Some(fp);
        record.announced_to_us = true;
        record.verified = verified;
        record.last_seen_ms = now_ms;
        self.by_fingerprint.insert(fp, peer);

        AnnounceOutcome {
            is_new,
            rebound_from,
        }
    }

    /// Touch a peer on any valid reception; creates a skeleton record for
    /// senders we have not seen announce yet.
    pub fn update_last_seen(&mut self, peer: PeerId, now_ms: u64) {
        let record = self.peers.entry(peer).or_default();
        record.last_seen_ms = now_ms;
    }

    /// Record signal strength.
    pub fn update_rssi(&mut self, peer: &PeerId, rssi: i8) {
        if let Some(r) = self.peers.get_mut(peer) {
            r.rssi = Some(rssi);
        }
    }

    /// Mark/unmark a peer as directly linked.
    pub fn set_direct(&mut self, peer: PeerId, direct: bool) {
        let record = self.peers.entry(peer).or_default();
        record.is_direct = direct;
    }

    /// One-shot guard for peer-directed announces.
    pub fn mark_announced_to(&mut self, peer: PeerId) -> bool {
        let record = self.peers.entry(peer).or_default();
        let first = !record.we_announced;
        record.we_announced = true;
        first
    }

    /// Peers seen within the staleness window.
    pub fn get_active_peers(&self, now_ms: u64) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_seen_ms) < PEER_STALE_TIMEOUT_MS)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Peers whose announce signature verified.
    pub fn get_verified_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, r)| r.verified)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Directly linked peers.
    pub fn direct_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, r)| r.is_direct)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Remove a peer outright (graceful LEAVE).
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        let record = self.peers.remove(peer)?;
        if let Some(fp) = record.fingerprint {
            if self.by_fingerprint.get(&fp) == Some(peer) {
                self.by_fingerprint.remove(&fp);
            }
        }
        Some(record)
    }

    /// Drop records older than the staleness window. Returns the pruned IDs.
    pub fn prune_stale(&mut self, now_ms: u64) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_seen_ms) >= PEER_STALE_TIMEOUT_MS)
            .map(|(p, _)| *p)
            .collect();
        for p in &stale {
            self.remove(p);
        }
        stale
    }

    /// Broadcast-announce throttle: explicit triggers always pass, the
    /// periodic timer passes at most once per `ANNOUNCE_MIN_INTERVAL_MS`.
    pub fn should_broadcast_announce(&mut self, trigger: AnnounceTrigger, now_ms: u64) -> bool {
        let due = match trigger {
            AnnounceTrigger::Periodic => {
                now_ms.saturating_sub(self.last_broadcast_announce_ms) >= ANNOUNCE_MIN_INTERVAL_MS
            }
            _ => true,
        };
        if due {
            self.last_broadcast_announce_ms = now_ms;
        }
        due
    }

    /// Drop everything (panic reset).
    pub fn clear(&mut self) {
        self.peers.clear();
        self.by_fingerprint.clear();
        self.last_broadcast_announce_ms = 0;
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
