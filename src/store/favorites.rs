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

//! Favorite relationships, persisted as JSON records keyed by the peer's
//! noise public key (lowercase hex).

use crate::core::types::Fingerprint;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const TREE_NAME: &str = "favorites";

/// One favorite relationship.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteRecord {
    /// Peer's X25519 static public key, 64 lowercase hex chars.
    pub peer_noise_pub: String,
    /// Peer's overlay relay public key (bech32 or hex), when known.
    pub peer_relay_pub: Option<String>,
    /// Last known nickname.
    pub nickname: String,
    /// We favor them.
    pub we_favored: bool,
    /// They favor us.
    pub they_favored: bool,
    /// When the relationship first appeared, unix milliseconds.
    pub favored_at: u64,
    /// Last change, unix milliseconds.
    pub last_updated: u64,
}

impl FavoriteRecord {
    /// Both sides favor each other.
    pub fn is_mutual(&self) -> bool {
        self.we_favored && self.they_favored
    }

    /// Raw noise public key bytes.
    pub fn noise_pub_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.peer_noise_pub).ok()?;
        bytes.try_into().ok()
    }

    /// Fingerprint of the noise key (store-and-forward queues key on it).
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.noise_pub_bytes()
            .map(|k| Fingerprint::of_static_key(&k))
    }

    /// Overlay relay key decoded to raw bytes, when stored as hex.
    pub fn relay_pub_bytes(&self) -> Option<[u8; 32]> {
        let raw = self.peer_relay_pub.as_deref()?;
        let bytes = hex::decode(raw).ok()?;
        bytes.try_into().ok()
    }
}

/// Change notifications pushed to subscribers.
#[derive(Clone, Debug)]
pub enum FavoriteChange {
    /// A record was created or updated.
    Updated(FavoriteRecord),
    /// A record was removed (key = noise pub hex).
    Removed(String),
    /// The store was cleared.
    Cleared,
}

/// sled-backed favorites store with change notifications.
pub struct FavoritesStore {
    tree: sled::Tree,
    listeners: Vec<mpsc::UnboundedSender<FavoriteChange>>,
}

impl FavoritesStore {
    /// Open over a sled database.
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(TREE_NAME).map_err(|_| StoreError::Db)?;
        Ok(Self {
            tree,
            listeners: Vec::new(),
        })
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<FavoriteChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn notify(&mut self, change: FavoriteChange) {
        self.listeners.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Fetch one record by noise public key.
    pub fn get(&self, noise_pub: &[u8; 32]) -> Result<Option<FavoriteRecord>, StoreError> {
        let key = hex::encode(noise_pub);
        let Some(value) = self.tree.get(key.as_bytes()).map_err(|_| StoreError::Db)? else {
            return Ok(None);
        };
        serde_json::from_slice(&value)
            .map(Some)
            .map_err(|_| StoreError::Codec)
    }

    /// Insert or replace a record.
    pub fn put(&mut self, record: &FavoriteRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record).map_err(|_| StoreError::Codec)?;
        self.tree
            .insert(record.peer_noise_pub.as_bytes(), value)
            .map_err(|_| StoreError::Db)?;
        self.tree.flush().map_err(|_| StoreError::Db)?;
        self.notify(FavoriteChange::Updated(record.clone()));
        Ok(())
    }

    /// Remove a record.
    pub fn remove(&mut self, noise_pub: &[u8; 32]) -> Result<(), StoreError> {
        let key = hex::encode(noise_pub);
        self.tree
            .remove(key.as_bytes())
            .map_err(|_| StoreError::Db)?;
        self.tree.flush().map_err(|_| StoreError::Db)?;
        self.notify(FavoriteChange::Removed(key));
        Ok(())
    }

    /// All records.
    pub fn list(&self) -> Result<Vec<FavoriteRecord>, StoreError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item.map_err(|_| StoreError::Db)?;
            let record = serde_json::from_slice(&value).map_err(|_| StoreError::Codec)?;
            out.push(record);
        }
        Ok(out)
    }

    /// Wipe the store (panic reset).
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.tree.clear().map_err(|_| StoreError::Db)?;
        self.tree.flush().map_err(|_| StoreError::Db)?;
        self.notify(FavoriteChange::Cleared);
        Ok(())
    }

    /// Flip our side of the relationship; creates the record on first
    /// favorite. Returns the new state. This is the atomic backend of
    /// `toggle_favorite`.
    pub fn toggle_we_favored(
        &mut self,
        noise_pub: &[u8; 32],
        nickname: &str,
        now_ms: u64,
    ) -> Result<FavoriteRecord, StoreError> {
        let mut record = self.get(noise_pub)?.unwrap_or(FavoriteRecord {
            peer_noise_pub: hex::encode(noise_pub),
            peer_relay_pub: None,
            nickname: nickname.to_string(),
            we_favored: false,
            they_favored: false,
            favored_at: now_ms,
            last_updated: now_ms,
        });
        record.we_favored = !record.we_favored;
        record.nickname = nickname.to_string();
        record.last_updated = now_ms;
        self.put(&record)?;
        Ok(record)
    }

    /// Record the peer's side from a favorite notification, learning their
    /// overlay key when it is shared.
    pub fn set_they_favored(
        &mut self,
        noise_pub: &[u8; 32],
        nickname: &str,
        favored: bool,
        relay_pub: Option<[u8; 32]>,
        now_ms: u64,
    ) -> Result<FavoriteRecord, StoreError> {
        let mut record = self.get(noise_pub)?.unwrap_or(FavoriteRecord {
            peer_noise_pub: hex::encode(noise_pub),
            peer_relay_pub: None,
            nickname: nickname.to_string(),
            we_favored: false,
            they_favored: false,
            favored_at: now_ms,
            last_updated: now_ms,
        });
        record.they_favored = favored;
        if let Some(relay) = relay_pub {
            record.peer_relay_pub = Some(hex::encode(relay));
        }
        record.last_updated = now_ms;
        self.put(&record)?;
        Ok(record)
    }

    /// Mutual favorites with a known overlay key.
    pub fn overlay_reachable(&self) -> Result<Vec<FavoriteRecord>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.is_mutual() && r.peer_relay_pub.is_some())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> (sled::Db, FavoritesStore) {
        let db = sled::open(dir.path().join("db")).expect("sled");
        let favorites = FavoritesStore::open(&db).expect("favorites");
        (db, favorites)
    }

    #[test]
    fn toggle_creates_then_flips() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mut favorites) = store(&dir);
        let key = [0xAB; 32];

        let r = favorites.toggle_we_favored(&key, "bob", 100).unwrap();
        assert!(r.we_favored);
        assert!(!r.is_mutual());

        let r = favorites.toggle_we_favored(&key, "bob", 200).unwrap();
        assert!(!r.we_favored);
        assert_eq!(r.last_updated, 200);
    }

    #[test]
    fn mutual_requires_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mut favorites) = store(&dir);
        let key = [0xAB; 32];
        favorites.toggle_we_favored(&key, "bob", 100).unwrap();
        let r = favorites
            .set_they_favored(&key, "bob", true, Some([0xCD; 32]), 150)
            .unwrap();
        assert!(r.is_mutual());
        assert_eq!(r.relay_pub_bytes(), Some([0xCD; 32]));
    }

    #[test]
    fn json_schema_fields() {
        let record = FavoriteRecord {
            peer_noise_pub: hex::encode([1u8; 32]),
            peer_relay_pub: None,
            nickname: "carol".to_string(),
            we_favored: true,
            they_favored: false,
            favored_at: 1,
            last_updated: 2,
        };
        let json = serde_json::to_value(&record).unwrap();
        for field in [
            "peer_noise_pub",
            "peer_relay_pub",
            "nickname",
            "we_favored",
            "they_favored",
            "favored_at",
            "last_updated",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn listeners_notified_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, mut favorites) = store(&dir);
        let mut rx = favorites.subscribe();
        favorites.toggle_we_favored(&[1; 32], "dave", 1).unwrap();
        match rx.try_recv().unwrap() {
            FavoriteChange::Updated(r) => assert!(r.we_favored),
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_db, mut favorites) = store(&dir);
            favorites.toggle_we_favored(&[1; 32], "erin", 1).unwrap();
        }
        let (_db, favorites) = store(&dir);
        let r = favorites.get(&[1; 32]).unwrap().unwrap();
        assert_eq!(r.nickname, "erin");
        assert!(r.we_favored);
    }
}
