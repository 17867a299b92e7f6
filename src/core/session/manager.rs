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

//! Per-peer session bookkeeping: tie-break, coalescing, rekey, retry.
//!
//! At most one session per peer ID is ever `Established`. When both sides
//! need a session concurrently, the lexicographically smaller peer ID
//! initiates; the defensive double-initiate from the other side is
//! coalesced away by dropping the larger side's own attempt on first
//! contact with the smaller side's handshake.

use crate::core::session::noise::{NoiseSession, XX_MSG1_LEN, XX_MSG2_LEN, XX_MSG3_LEN};
use crate::core::session::{Role, SessionError, SessionState};
use crate::core::types::{
    PeerId, HANDSHAKE_TIMEOUT_MS, REKEY_INTERVAL_MS, REKEY_MESSAGES, RETRY_BACKOFF_MAX_MS,
    RETRY_BACKOFF_MS,
};
use std::collections::HashMap;
use tracing::debug;
use zeroize::Zeroizing;

/// Result of feeding one inbound handshake message.
#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    /// Bytes to send back as a `NOISE_HANDSHAKE` packet, if any.
    pub reply: Option<Vec<u8>>,
    /// Remote static key when the handshake just completed.
    pub established: Option<[u8; 32]>,
}

#[derive(Default)]
struct PeerEntry {
    current: Option<NoiseSession>,
    pending_initiator: Option<NoiseSession>,
    pending_responder: Option<NoiseSession>,
    pending_since_ms: u64,
    established_ms: u64,
    sent_messages: u64,
    failed: bool,
    backoff_ms: u64,
    next_retry_ms: u64,
}

impl PeerEntry {
    fn handshaking_role(&self) -> Option<Role> {
        if self.pending_initiator.is_some() {
            Some(Role::Initiator)
        } else if self.pending_responder.is_some() {
            Some(Role::Responder)
        } else {
            None
        }
    }
}

/// Session manager holding all per-peer Noise state.
pub struct SessionManager {
    local_id: PeerId,
    static_private: Zeroizing<Vec<u8>>,
    peers: HashMap<PeerId, PeerEntry>,
}

impl SessionManager {
    /// Create over the local static private key.
    pub fn new(local_id: PeerId, static_private: Zeroizing<Vec<u8>>) -> Self {
        Self {
            local_id,
            static_private,
            peers: HashMap::new(),
        }
    }

    /// Update the local peer ID after rotation.
    pub fn set_local_id(&mut self, id: PeerId) {
        self.local_id = id;
    }

    /// Tie-break: the lexicographically smaller peer ID initiates.
    pub fn should_initiate(&self, peer: &PeerId) -> bool {
        self.local_id.as_bytes() < peer.as_bytes()
    }

    /// Current state for the UI lock icon.
    pub fn state(&self, peer: &PeerId) -> SessionState {
        match self.peers.get(peer) {
            None => SessionState::Uninitialized,
            Some(e) => {
                if let Some(role) = e.handshaking_role() {
                    SessionState::Handshaking(role)
                } else if e.current.is_some() {
                    SessionState::Established
                } else if e.failed {
                    SessionState::Failed
                } else {
                    SessionState::Uninitialized
                }
            }
        }
    }

    /// True when an established transport exists.
    pub fn is_established(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .map(|e| e.current.is_some())
            .unwrap_or(false)
    }

    /// Remote static key of the established session.
    pub fn remote_static(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.peers
            .get(peer)?
            .current
            .as_ref()
            .and_then(|s| s.remote_static())
    }

    /// Start (or coalesce into) a handshake with `peer`. Returns the first
    /// handshake message, or `None` when an attempt is already in flight or
    /// backoff has not elapsed.
    pub fn initiate(&mut self, peer: PeerId, now_ms: u64) -> Result<Option<Vec<u8>>, SessionError> {
        let entry = self.peers.entry(peer).or_default();
        if entry.pending_initiator.is_some() || entry.pending_responder.is_some() {
            return Ok(None); // coalesced
        }
        if entry.failed && now_ms < entry.next_retry_ms {
            return Ok(None);
        }

        let mut session = NoiseSession::new_initiator(&self.static_private)?;
        let msg = session.write_handshake()?;
        entry.pending_initiator = Some(session);
        entry.pending_since_ms = now_ms;
        Ok(Some(msg))
    }

    /// Feed one inbound `NOISE_HANDSHAKE` payload from `peer`.
    pub fn process_handshake(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<HandshakeOutcome, SessionError> {
        let should_initiate = self.should_initiate(&peer);
        let entry = self.peers.entry(peer).or_default();

        match bytes.len() {
            XX_MSG1_LEN => {
                // Peer opened a handshake towards us.
                if entry.pending_initiator.is_some() {
                    if should_initiate {
                        // Tie-break says our attempt wins; ignore theirs.
                        debug!(%peer, "ignoring concurrent handshake from larger peer id");
                        return Ok(HandshakeOutcome::default());
                    }
                    // Theirs wins; abandon our own attempt.
                    entry.pending_initiator = None;
                }
                let mut session = NoiseSession::new_responder(&self.static_private)?;
                let (reply, _) = session.read_handshake(bytes)?;
                entry.pending_responder = Some(session);
                entry.pending_since_ms = now_ms;
                Ok(HandshakeOutcome {
                    reply,
                    established: None,
                })
            }
            XX_MSG2_LEN => {
                let mut session = entry
                    .pending_initiator
                    .take()
                    .ok_or(SessionError::OutOfTurn)?;
                match session.read_handshake(bytes) {
                    Ok((reply, done)) => {
                        debug_assert!(done);
                        let remote = session.remote_static();
                        Self::adopt(entry, session, now_ms);
                        Ok(HandshakeOutcome {
                            reply,
                            established: remote,
                        })
                    }
                    Err(e) => {
                        Self::mark_failed(entry, now_ms);
                        Err(e)
                    }
                }
            }
            XX_MSG3_LEN => {
                let mut session = entry
                    .pending_responder
                    .take()
                    .ok_or(SessionError::OutOfTurn)?;
                match session.read_handshake(bytes) {
                    Ok((reply, done)) => {
                        debug_assert!(done && reply.is_none());
                        let remote = session.remote_static();
                        Self::adopt(entry, session, now_ms);
                        Ok(HandshakeOutcome {
                            reply: None,
                            established: remote,
                        })
                    }
                    Err(e) => {
                        Self::mark_failed(entry, now_ms);
                        Err(e)
                    }
                }
            }
            _ => Err(SessionError::OutOfTurn),
        }
    }

    fn adopt(entry: &mut PeerEntry, session: NoiseSession, now_ms: u64) {
        // First completed handshake wins; any concurrent attempt is dropped.
        entry.pending_initiator = None;
        entry.pending_responder = None;
        entry.current = Some(session);
        entry.established_ms = now_ms;
        entry.sent_messages = 0;
        entry.failed = false;
        entry.backoff_ms = 0;
    }

    fn mark_failed(entry: &mut PeerEntry, now_ms: u64) {
        entry.pending_initiator = None;
        entry.pending_responder = None;
        entry.failed = true;
        entry.backoff_ms = if entry.backoff_ms == 0 {
            RETRY_BACKOFF_MS
        } else {
            (entry.backoff_ms * 2).min(RETRY_BACKOFF_MAX_MS)
        };
        entry.next_retry_ms = now_ms + entry.backoff_ms;
    }

    /// Encrypt a transport message to `peer`.
    pub fn encrypt(&mut self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let entry = self.peers.get_mut(peer).ok_or(SessionError::PeerUnknown)?;
        let session = entry.current.as_mut().ok_or(SessionError::NotEstablished)?;
        match session.encrypt(plaintext) {
            Ok(ct) => {
                entry.sent_messages += 1;
                Ok(ct)
            }
            Err(e) => {
                // Nonce exhaustion is fatal for the session.
                entry.current = None;
                entry.failed = true;
                Err(e)
            }
        }
    }

    /// Decrypt a transport message from `peer`.
    pub fn decrypt(&mut self, peer: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let entry = self.peers.get_mut(peer).ok_or(SessionError::PeerUnknown)?;
        let session = entry.current.as_mut().ok_or(SessionError::NotEstablished)?;
        session.decrypt(ciphertext)
    }

    /// True when the session crossed its rekey budget (time or volume).
    pub fn needs_rekey(&self, peer: &PeerId, now_ms: u64) -> bool {
        match self.peers.get(peer) {
            Some(e) if e.current.is_some() => {
                now_ms.saturating_sub(e.established_ms) >= REKEY_INTERVAL_MS
                    || e.sent_messages >= REKEY_MESSAGES
            }
            _ => false,
        }
    }

    /// Begin a rekey handshake; the old session keeps serving until the new
    /// one is established.
    pub fn begin_rekey(&mut self, peer: PeerId, now_ms: u64) -> Result<Option<Vec<u8>>, SessionError> {
        let entry = self.peers.entry(peer).or_default();
        if entry.pending_initiator.is_some() || entry.pending_responder.is_some() {
            return Ok(None);
        }
        let mut session = NoiseSession::new_initiator(&self.static_private)?;
        let msg = session.write_handshake()?;
        entry.pending_initiator = Some(session);
        entry.pending_since_ms = now_ms;
        Ok(Some(msg))
    }

    /// Time out stale handshakes. Returns peers whose attempt just failed.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<PeerId> {
        let mut failed = Vec::new();
        for (peer, entry) in self.peers.iter_mut() {
            if entry.handshaking_role().is_some()
                && now_ms.saturating_sub(entry.pending_since_ms) >= HANDSHAKE_TIMEOUT_MS
            {
                Self::mark_failed(entry, now_ms);
                failed.push(*peer);
            }
        }
        failed
    }

    /// True when a failed peer may retry its handshake.
    pub fn can_retry(&self, peer: &PeerId, now_ms: u64) -> bool {
        match self.peers.get(peer) {
            Some(e) => !e.failed || now_ms >= e.next_retry_ms,
            None => true,
        }
    }

    /// Peers with an established session.
    pub fn established_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, e)| e.current.is_some())
            .map(|(p, _)| *p)
            .collect()
    }

    /// Drop all state for `peer` (peer-ID rebind or record purge).
    pub fn invalidate(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Drop everything (panic reset).
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
