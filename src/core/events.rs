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

//! Events surfaced to the embedding application (UI timeline, debug panel).

use crate::core::session::SessionState;
use crate::core::types::{ConversationKey, DeliveryStatus, Fingerprint, PeerId, TransportKind};
use tokio::sync::mpsc;

/// Events emitted by the mesh core.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// A peer appeared or re-announced with updated identity data.
    PeerSeen {
        /// Current peer ID.
        peer_id: PeerId,
        /// Announced nickname, if any.
        nickname: Option<String>,
        /// Stable fingerprint once the static key is known.
        fingerprint: Option<Fingerprint>,
    },
    /// A peer left gracefully or was pruned as stale.
    PeerGone {
        /// Departed peer ID.
        peer_id: PeerId,
        /// True when a LEAVE packet was received, false on prune.
        graceful: bool,
    },
    /// Public broadcast chat message.
    PublicMessage {
        /// Sender peer ID.
        from: PeerId,
        /// Sender nickname if bound.
        nickname: Option<String>,
        /// UTF-8 content.
        content: String,
        /// Sender clock, milliseconds.
        timestamp_ms: u64,
    },
    /// Decrypted private message addressed to us.
    PrivateMessage {
        /// Conversation the message belongs to.
        conversation: ConversationKey,
        /// Message id (UUID string).
        id: String,
        /// UTF-8 content.
        content: String,
        /// Transport that carried it.
        via: TransportKind,
        /// Sender clock, milliseconds.
        timestamp_ms: u64,
    },
    /// A user-initiated send changed delivery state.
    DeliveryChanged {
        /// Message id.
        id: String,
        /// New status.
        status: DeliveryStatus,
    },
    /// A session's state changed (consumed by the UI lock icon).
    SessionChanged {
        /// Remote peer.
        peer_id: PeerId,
        /// New state.
        state: SessionState,
    },
    /// A favorite relationship changed.
    FavoriteChanged {
        /// Stable identity of the peer.
        fingerprint: Fingerprint,
        /// Whether the relationship is now mutual.
        is_mutual: bool,
    },
    /// Two aliases were discovered to be the same identity and merged.
    ConversationMerged {
        /// Alias that was folded in.
        from: ConversationKey,
        /// Canonical surviving key.
        into: ConversationKey,
    },
    /// Panic reset completed; keys, records, outboxes and buffers are gone.
    AllCleared,
}

/// Receiver half handed to `subscribe_events` callers.
pub type EventRx = mpsc::Receiver<CoreEvent>;

/// Bounded sender used by the core internals.
pub type EventTx = mpsc::Sender<CoreEvent>;
