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

//! Store-and-forward cache: per-recipient FIFO of messages queued while a
//! mutual favorite is offline.
//!
//! The working set lives in memory; every envelope is mirrored into a sled
//! tree (`fingerprint || seq`) so queued messages survive restarts. The
//! insertion policy (mutual favorite, currently offline) is enforced by the
//! caller; this module owns caps, ordering, expiry, and drains.

use crate::core::types::{Fingerprint, CACHE_MAX_PER_RECIPIENT, CACHE_TTL_MS};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

const TREE_NAME: &str = "store_forward";

/// One queued message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEnvelope {
    /// Encoded wire packet to replay on drain.
    pub packet: Vec<u8>,
    /// Insertion time, milliseconds.
    pub inserted_at_ms: u64,
    /// Expiry time (`inserted_at + 7 days`).
    pub expire_at_ms: u64,
}

fn tree_key(fp: &Fingerprint, seq: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(&fp.0);
    key[32..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// The cache itself.
pub struct StoreForwardCache {
    tree: sled::Tree,
    queues: BTreeMap<Fingerprint, VecDeque<(u64, CachedEnvelope)>>,
    next_seq: u64,
}

impl StoreForwardCache {
    /// Open over a sled database, reloading any surviving envelopes and
    /// discarding expired ones.
    pub fn open(db: &sled::Db, now_ms: u64) -> Result<Self, StoreError> {
        let tree = db.open_tree(TREE_NAME).map_err(|_| StoreError::Db)?;
        let mut queues: BTreeMap<Fingerprint, VecDeque<(u64, CachedEnvelope)>> = BTreeMap::new();
        let mut next_seq = 0u64;

        for item in tree.iter() {
            let (key, value) = item.map_err(|_| StoreError::Db)?;
            if key.len() != 40 {
                let _ = tree.remove(&key);
                continue;
            }
            let mut fp = [0u8; 32];
            fp.copy_from_slice(&key[..32]);
            let fp = Fingerprint(fp);
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&key[32..]);
            let seq = u64::from_be_bytes(seq_bytes);

            let envelope: CachedEnvelope = match bincode::deserialize(&value) {
                Ok(e) => e,
                Err(_) => {
                    warn!("dropping undecodable cached envelope");
                    let _ = tree.remove(&key);
                    continue;
                }
            };
            if now_ms >= envelope.expire_at_ms {
                let _ = tree.remove(&key);
                continue;
            }
            next_seq = next_seq.max(seq + 1);
            queues.entry(fp).or_default().push_back((seq, envelope));
        }

        // Keys iterate in fingerprint-then-seq order, so each queue is
        // already FIFO.
        Ok(Self {
            tree,
            queues,
            next_seq,
        })
    }

    /// Queue a packet for an offline mutual favorite. When the recipient's
    /// FIFO is full the oldest envelope gives way. Returns the envelope
    /// actually stored.
    pub fn insert(
        &mut self,
        recipient: Fingerprint,
        packet: Vec<u8>,
        now_ms: u64,
    ) -> Result<CachedEnvelope, StoreError> {
        let envelope = CachedEnvelope {
            packet,
            inserted_at_ms: now_ms,
            expire_at_ms: now_ms + CACHE_TTL_MS,
        };

        let queue = self.queues.entry(recipient).or_default();
        while queue.len() >= CACHE_MAX_PER_RECIPIENT {
            if let Some((old_seq, _)) = queue.pop_front() {
                let _ = self.tree.remove(tree_key(&recipient, old_seq));
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let value = bincode::serialize(&envelope).map_err(|_| StoreError::Codec)?;
        self.tree
            .insert(tree_key(&recipient, seq), value)
            .map_err(|_| StoreError::Db)?;
        queue.push_back((seq, envelope.clone()));
        Ok(envelope)
    }

    /// Remove and return everything queued for `recipient`, oldest first.
    pub fn drain(&mut self, recipient: &Fingerprint) -> Vec<CachedEnvelope> {
        let Some(queue) = self.queues.remove(recipient) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(queue.len());
        for (seq, envelope) in queue {
            let _ = self.tree.remove(tree_key(recipient, seq));
            out.push(envelope);
        }
        out
    }

    /// Queued message count for one recipient.
    pub fn depth(&self, recipient: &Fingerprint) -> usize {
        self.queues.get(recipient).map(VecDeque::len).unwrap_or(0)
    }

    /// Total queued messages.
    pub fn total_depth(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Discard expired envelopes. Returns how many were dropped.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let mut dropped = 0;
        for (fp, queue) in self.queues.iter_mut() {
            while let Some((seq, envelope)) = queue.front() {
                if now_ms >= envelope.expire_at_ms {
                    let _ = self.tree.remove(tree_key(fp, *seq));
                    queue.pop_front();
                    dropped += 1;
                } else {
                    break;
                }
            }
        }
        self.queues.retain(|_, q| !q.is_empty());
        dropped
    }

    /// Drop everything (panic reset).
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.queues.clear();
        self.tree.clear().map_err(|_| StoreError::Db)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_cache(dir: &tempfile::TempDir, now: u64) -> (sled::Db, StoreForwardCache) {
        let db = sled::open(dir.path().join("db")).expect("sled open");
        let cache = StoreForwardCache::open(&db, now).expect("cache open");
        (db, cache)
    }

    fn fp(n: u8) -> Fingerprint {
        Fingerprint([n; 32])
    }

    #[test]
    fn fifo_order_preserved_on_drain() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mut cache) = open_cache(&dir, 0);
        for i in 0..3u8 {
            cache.insert(fp(1), vec![i], i as u64).unwrap();
        }
        let drained = cache.drain(&fp(1));
        assert_eq!(
            drained.iter().map(|e| e.packet.clone()).collect::<Vec<_>>(),
            vec![vec![0], vec![1], vec![2]]
        );
        assert_eq!(cache.depth(&fp(1)), 0);
    }

    #[test]
    fn per_recipient_cap_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mut cache) = open_cache(&dir, 0);
        for i in 0..CACHE_MAX_PER_RECIPIENT + 5 {
            cache
                .insert(fp(1), (i as u32).to_be_bytes().to_vec(), i as u64)
                .unwrap();
        }
        assert_eq!(cache.depth(&fp(1)), CACHE_MAX_PER_RECIPIENT);
        let first = cache.drain(&fp(1)).remove(0);
        assert_eq!(first.packet, 5u32.to_be_bytes().to_vec());
    }

    #[test]
    fn expiry_sweep_drops_old_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mut cache) = open_cache(&dir, 0);
        cache.insert(fp(1), vec![1], 0).unwrap();
        cache.insert(fp(1), vec![2], 10).unwrap();
        assert_eq!(cache.sweep(CACHE_TTL_MS + 5), 1);
        assert_eq!(cache.depth(&fp(1)), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_db, mut cache) = open_cache(&dir, 0);
            cache.insert(fp(1), vec![7, 7], 0).unwrap();
            cache.insert(fp(2), vec![8], 0).unwrap();
        }
        let (_db, mut cache) = open_cache(&dir, 100);
        assert_eq!(cache.depth(&fp(1)), 1);
        assert_eq!(cache.drain(&fp(1))[0].packet, vec![7, 7]);
        assert_eq!(cache.depth(&fp(2)), 1);
    }

    #[test]
    fn reopen_discards_expired() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_db, mut cache) = open_cache(&dir, 0);
            cache.insert(fp(1), vec![1], 0).unwrap();
        }
        let (_db, cache) = open_cache(&dir, CACHE_TTL_MS + 1);
        assert_eq!(cache.total_depth(), 0);
    }
}
