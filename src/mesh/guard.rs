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

//! Ingress guard: packet de-duplication, replay window, per-sender rate
//! gating, and signature verification.

use crate::core::protocol::packet::Packet;
use crate::core::security::keystore;
use crate::core::types::{
    PeerId, DEDUP_CAPACITY, DEDUP_TTL_MS, RATE_LIMIT_PACKETS, RATE_WINDOW_MS, REPLAY_WINDOW_MS,
};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Signature verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// No signing key is bound to the sender and none was carried inline.
    #[error("missing signing key")]
    MissingKey,
    /// Signature did not verify under the bound key.
    #[error("bad signature")]
    BadSignature,
}

/// Why the guard dropped a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Seen within the dedup TTL.
    Duplicate,
    /// Timestamp outside the replay window.
    Replay,
    /// Sender exceeded its token bucket.
    RateLimited,
}

/// SHA-256 of a packet's canonical bytes.
pub fn packet_digest(canonical: &[u8]) -> [u8; 32] {
    let d = ring::digest::digest(&ring::digest::SHA256, canonical);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}

/// Bounded dedup window keyed by packet digest, LRU-evicted with TTL.
struct DedupSet {
    seen: HashMap<[u8; 32], u64>,
    order: VecDeque<[u8; 32]>,
}

impl DedupSet {
    fn new() -> Self {
        Self {
            seen: HashMap::with_capacity(DEDUP_CAPACITY),
            order: VecDeque::with_capacity(DEDUP_CAPACITY),
        }
    }

    /// Returns true when the digest was already present (and fresh).
    fn check_and_insert(&mut self, digest: [u8; 32], now_ms: u64) -> bool {
        if let Some(&inserted) = self.seen.get(&digest) {
            if now_ms.saturating_sub(inserted) < DEDUP_TTL_MS {
                return true;
            }
            self.seen.remove(&digest);
        }

        // Evict expired entries opportunistically, then by capacity.
        while let Some(front) = self.order.front() {
            let expired = self
                .seen
                .get(front)
                .map(|&t| now_ms.saturating_sub(t) >= DEDUP_TTL_MS)
                .unwrap_or(true);
            if expired {
                let k = *front;
                self.order.pop_front();
                self.seen.remove(&k);
            } else {
                break;
            }
        }
        while self.seen.len() >= DEDUP_CAPACITY {
            if let Some(k) = self.order.pop_front() {
                self.seen.remove(&k);
            } else {
                break;
            }
        }

        self.seen.insert(digest, now_ms);
        self.order.push_back(digest);
        false
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

struct TokenBucket {
    window_start_ms: u64,
    count: u32,
}

/// The full ingress guard.
pub struct IngressGuard {
    dedup: DedupSet,
    buckets: HashMap<PeerId, TokenBucket>,
}

impl Default for IngressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressGuard {
    /// Fresh guard.
    pub fn new() -> Self {
        Self {
            dedup: DedupSet::new(),
            buckets: HashMap::new(),
        }
    }

    /// Run the dedup/replay/rate checks. `Ok(())` admits the packet.
    pub fn admit(
        &mut self,
        packet: &Packet,
        canonical: &[u8],
        now_ms: u64,
    ) -> Result<(), DropReason> {
        // Replay window on the sender clock.
        let skew = now_ms.abs_diff(packet.timestamp_ms);
        if skew > REPLAY_WINDOW_MS {
            return Err(DropReason::Replay);
        }

        // Per-sender token bucket.
        let bucket = self.buckets.entry(packet.sender_id).or_insert(TokenBucket {
            window_start_ms: now_ms,
            count: 0,
        });
        if now_ms.saturating_sub(bucket.window_start_ms) >= RATE_WINDOW_MS {
            bucket.window_start_ms = now_ms;
            bucket.count = 0;
        }
        if bucket.count >= RATE_LIMIT_PACKETS {
            return Err(DropReason::RateLimited);
        }
        bucket.count += 1;

        // Dedup last so rejected packets do not pollute the window.
        if self.dedup.check_and_insert(packet_digest(canonical), now_ms) {
            return Err(DropReason::Duplicate);
        }
        Ok(())
    }

    /// Verify a packet signature. `bound_key` is the signing key currently
    /// bound to the sender; `inline_key` is the key carried inside an
    /// ANNOUNCE TLV, accepted only for bootstrap.
    pub fn verify_signature(
        packet: &Packet,
        canonical: &[u8],
        bound_key: Option<&[u8; 32]>,
        inline_key: Option<&[u8; 32]>,
    ) -> Result<(), SignatureError> {
        let Some(sig) = &packet.signature else {
            // Unsigned packets are only tolerated when we have no key to
            // check against; once a key is bound, absence is a failure.
            return match bound_key {
                None => Ok(()),
                Some(_) => Err(SignatureError::BadSignature),
            };
        };

        let key = bound_key.or(inline_key).ok_or(SignatureError::MissingKey)?;
        keystore::verify_bytes(key, canonical, sig).map_err(|_| SignatureError::BadSignature)
    }

    /// Drop a sender's bucket (peer pruned).
    pub fn forget_sender(&mut self, peer: &PeerId) {
        self.buckets.remove(peer);
    }

    /// Drop everything (panic reset).
    pub fn clear(&mut self) {
        self.dedup.clear();
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MessageType;

    fn packet(ts: u64) -> Packet {
        Packet::new(
            MessageType::Message,
            PeerId::from_bytes([1; 8]),
            None,
            ts,
            b"payload".to_vec(),
        )
    }

    #[test]
    fn duplicate_within_ttl_dropped() {
        let mut g = IngressGuard::new();
        let p = packet(1000);
        let canonical = p.canonical_for_signing().unwrap();
        assert_eq!(g.admit(&p, &canonical, 1000), Ok(()));
        assert_eq!(g.admit(&p, &canonical, 2000), Err(DropReason::Duplicate));
        // After the TTL the same bytes are admitted again.
        assert_eq!(g.admit(&p, &canonical, 1000 + DEDUP_TTL_MS), Ok(()));
    }

    #[test]
    fn replay_window_enforced() {
        let mut g = IngressGuard::new();
        let p = packet(0);
        let canonical = p.canonical_for_signing().unwrap();
        assert_eq!(
            g.admit(&p, &canonical, REPLAY_WINDOW_MS + 1),
            Err(DropReason::Replay)
        );

        // Future timestamps are equally rejected.
        let p = packet(REPLAY_WINDOW_MS + 1000);
        let canonical = p.canonical_for_signing().unwrap();
        assert_eq!(g.admit(&p, &canonical, 1), Err(DropReason::Replay));
    }

    #[test]
    fn rate_gate_trips_after_budget() {
        let mut g = IngressGuard::new();
        let mut admitted = 0;
        for i in 0..RATE_LIMIT_PACKETS + 10 {
            let mut p = packet(1000 + i as u64);
            p.payload = format!("p{i}").into_bytes();
            let canonical = p.canonical_for_signing().unwrap();
            if g.admit(&p, &canonical, 1000).is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, RATE_LIMIT_PACKETS);

        // A fresh window refills the bucket.
        let p = packet(1000 + RATE_WINDOW_MS);
        let canonical = p.canonical_for_signing().unwrap();
        assert_eq!(g.admit(&p, &canonical, 1000 + RATE_WINDOW_MS), Ok(()));
    }

    #[test]
    fn dedup_capacity_bounded() {
        let mut g = IngressGuard::new();
        for i in 0..DEDUP_CAPACITY + 100 {
            let mut p = packet(1000);
            p.payload = format!("{i}").into_bytes();
            // Different senders so the rate gate stays out of the way.
            p.sender_id = PeerId::from_bytes((i as u64).to_be_bytes());
            let canonical = p.canonical_for_signing().unwrap();
            let _ = g.admit(&p, &canonical, 1000);
        }
        assert!(g.dedup.seen.len() <= DEDUP_CAPACITY);
    }
}
