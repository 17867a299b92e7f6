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

//! Message router: picks a transport per recipient, parks what cannot be
//! sent, and unifies a logical conversation across its aliases.
//!
//! A target may be addressed by its current mesh peer ID, its stable noise
//! key, or an overlay alias. The router maps every alias to one canonical
//! conversation key; when two aliases turn out to be the same identity the
//! queues are merged and subsequent sends use the canonical key. Per-target
//! FIFO order is preserved across transports; nothing is guaranteed across
//! distinct targets.

use crate::core::types::{ConversationKey, DeliveryStatus, PeerId, SEND_MAX_AGE_MS};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::debug;

/// Router errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// No transport can currently reach the target (send was parked).
    #[error("no transport")]
    NoTransport,
    /// The target cannot be resolved to any known identity.
    #[error("target unknown")]
    TargetUnknown,
    /// The send was cancelled before it reached a transport.
    #[error("cancelled")]
    Cancelled,
}

/// What the node knows about reaching a target right now.
#[derive(Clone, Copy, Debug, Default)]
pub struct Reachability {
    /// Live mesh peer with an established session.
    pub mesh_peer: Option<PeerId>,
    /// Mutual favorite's relay key, when the overlay is reachable.
    pub overlay_pub: Option<[u8; 32]>,
}

/// Where a private send goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDecision {
    /// Encrypt and send over the mesh to this peer now.
    Mesh(PeerId),
    /// Gift-wrap and send via the overlay to this relay key.
    Overlay([u8; 32]),
    /// Parked in the outbox until the target becomes reachable.
    Parked,
    /// The message id was already accepted; nothing to do.
    Duplicate,
}

/// A send waiting in the outbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSend {
    /// Message id.
    pub id: String,
    /// UTF-8 content.
    pub content: String,
    /// When it was first accepted.
    pub enqueued_ms: u64,
}

const INCOMING_DEDUP_CAP: usize = 4096;

/// The router state. Single-writer; owned by the node loop.
#[derive(Default)]
pub struct MessageRouter {
    /// alias (canonical string form) -> canonical conversation key.
    aliases: HashMap<String, String>,
    /// canonical key -> FIFO of parked sends.
    outbox: HashMap<String, VecDeque<PendingSend>>,
    /// message id -> (status, accepted_at).
    statuses: HashMap<String, (DeliveryStatus, u64)>,
    /// (conversation, message id) pairs already surfaced to the UI.
    seen_incoming: HashSet<(String, String)>,
    seen_order: VecDeque<(String, String)>,
}

impl MessageRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a key through the alias table to its canonical form.
    pub fn canonical_key(&self, key: &ConversationKey) -> String {
        let s = key.to_string();
        self.aliases.get(&s).cloned().unwrap_or(s)
    }

    /// Declare that `alias` refers to the identity canonically known as
    /// `canonical`. Any messages parked under the alias are folded into the
    /// canonical queue (alias entries first retain their own order).
    /// Returns true when queues were actually merged.
    pub fn unify(&mut self, alias: &ConversationKey, canonical: &ConversationKey) -> bool {
        let alias_s = alias.to_string();
        let canonical_s = canonical.to_string();
        if alias_s == canonical_s {
            return false;
        }
        self.aliases.insert(alias_s.clone(), canonical_s.clone());

        // Re-point any aliases that resolved to the old alias.
        for v in self.aliases.values_mut() {
            if *v == alias_s {
                *v = canonical_s.clone();
            }
        }

        let Some(moved) = self.outbox.remove(&alias_s) else {
            return false;
        };
        debug!(from = %alias_s, into = %canonical_s, merged = moved.len(), "conversation unified");
        self.outbox.entry(canonical_s).or_default().extend(moved);
        true
    }

    /// Route one private send. The caller resolves reachability; the
    /// router enforces idempotence and the mesh-then-overlay preference,
    /// and parks what cannot move now.
    pub fn send_private(
        &mut self,
        target: &ConversationKey,
        content: &str,
        id: &str,
        reach: Reachability,
        now_ms: u64,
    ) -> RouteDecision {
        if self.statuses.contains_key(id) {
            return RouteDecision::Duplicate;
        }
        self.statuses
            .insert(id.to_string(), (DeliveryStatus::Sending, now_ms));

        if let Some(peer) = reach.mesh_peer {
            return RouteDecision::Mesh(peer);
        }
        if let Some(relay) = reach.overlay_pub {
            return RouteDecision::Overlay(relay);
        }

        let key = self.canonical_key(target);
        self.outbox.entry(key).or_default().push_back(PendingSend {
            id: id.to_string(),
            content: content.to_string(),
            enqueued_ms: now_ms,
        });
        RouteDecision::Parked
    }

    /// Repark a send that already passed the idempotence gate (the
    /// transport failed after routing).
    pub fn park(&mut self, target: &ConversationKey, content: &str, id: &str, now_ms: u64) {
        let key = self.canonical_key(target);
        self.outbox.entry(key).or_default().push_back(PendingSend {
            id: id.to_string(),
            content: content.to_string(),
            enqueued_ms: now_ms,
        });
    }

    /// Take every parked send for the identity behind `key`, oldest first.
    /// Called when a mesh session establishes, the overlay becomes
    /// reachable, or a new overlay key is learned.
    pub fn drain(&mut self, key: &ConversationKey) -> Vec<PendingSend> {
        let canonical = self.canonical_key(key);
        self.outbox
            .remove(&canonical)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Parked messages for one target.
    pub fn outbox_depth(&self, key: &ConversationKey) -> usize {
        let canonical = self.canonical_key(key);
        self.outbox
            .get(&canonical)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Total parked messages.
    pub fn total_parked(&self) -> usize {
        self.outbox.values().map(VecDeque::len).sum()
    }

    /// Record a delivery ack. Returns the new status when it changed.
    pub fn on_delivery_ack(&mut self, id: &str) -> Option<DeliveryStatus> {
        let (status, _) = self.statuses.get_mut(id)?;
        match status {
            DeliveryStatus::Sending => {
                *status = DeliveryStatus::Delivered;
                Some(DeliveryStatus::Delivered)
            }
            _ => None,
        }
    }

    /// Record a read receipt. Returns the new status when it changed.
    pub fn on_read_receipt(&mut self, id: &str) -> Option<DeliveryStatus> {
        let (status, _) = self.statuses.get_mut(id)?;
        match status {
            DeliveryStatus::Sending | DeliveryStatus::Delivered => {
                *status = DeliveryStatus::Read;
                Some(DeliveryStatus::Read)
            }
            _ => None,
        }
    }

    /// Current delivery status of a send.
    pub fn status_of(&self, id: &str) -> Option<DeliveryStatus> {
        self.statuses.get(id).map(|(s, _)| *s)
    }

    /// At-most-once gate for incoming private messages. Returns false when
    /// this (conversation, id) was already surfaced.
    pub fn accept_incoming(&mut self, conversation: &ConversationKey, id: &str) -> bool {
        let key = (self.canonical_key(conversation), id.to_string());
        if self.seen_incoming.contains(&key) {
            return false;
        }
        while self.seen_incoming.len() >= INCOMING_DEDUP_CAP {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_incoming.remove(&old);
            } else {
                break;
            }
        }
        self.seen_incoming.insert(key.clone());
        self.seen_order.push_back(key);
        true
    }

    /// Age out undelivered sends. Returns ids that just failed.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<String> {
        let mut failed = Vec::new();
        for (id, (status, accepted_ms)) in self.statuses.iter_mut() {
            if *status == DeliveryStatus::Sending
                && now_ms.saturating_sub(*accepted_ms) >= SEND_MAX_AGE_MS
            {
                *status = DeliveryStatus::Failed;
                failed.push(id.clone());
            }
        }
        if !failed.is_empty() {
            let failed_set: HashSet<&String> = failed.iter().collect();
            for queue in self.outbox.values_mut() {
                queue.retain(|p| !failed_set.contains(&p.id));
            }
            self.outbox.retain(|_, q| !q.is_empty());
        }
        failed
    }

    /// Cancel a parked send. Removes it from the outbox without ever
    /// letting a partial packet reach the wire.
    pub fn cancel(&mut self, id: &str) -> Result<(), RouterError> {
        let mut found = false;
        for queue in self.outbox.values_mut() {
            let before = queue.len();
            queue.retain(|p| p.id != id);
            found |= queue.len() != before;
        }
        self.outbox.retain(|_, q| !q.is_empty());
        if found {
            self.statuses.remove(id);
            Ok(())
        } else {
            Err(RouterError::Cancelled)
        }
    }

    /// Drop everything (panic reset).
    pub fn clear(&mut self) {
        self.aliases.clear();
        self.outbox.clear();
        self.statuses.clear();
        self.seen_incoming.clear();
        self.seen_order.clear();
    }
}
