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
#![warn(missing_docs)]

//! Identifiers, wire enums, protocol constants, and node configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire protocol version. Packets with any other version are dropped.
pub const PROTOCOL_VERSION: u8 = 1;

/// Noise handshake parameters for the session layer.
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Hard cap on an encoded packet.
pub const MAX_PACKET: usize = 65_535;

/// Hard cap on a packet payload.
pub const MAX_PAYLOAD: usize = 65_000;

/// Initial (and maximum) TTL for relayed packets.
pub const MAX_TTL: u8 = 7;

/// Peers without any reception are pruned after this many milliseconds.
pub const PEER_STALE_TIMEOUT_MS: u64 = 180_000;

/// Sessions are rekeyed after this interval.
pub const REKEY_INTERVAL_MS: u64 = 30 * 60 * 1000;

/// Sessions are rekeyed after this many outbound messages.
pub const REKEY_MESSAGES: u64 = 1 << 20;

/// Encoded packets larger than this are fragmented.
pub const FRAGMENT_THRESHOLD: usize = 512;

/// Maximum concurrent reassembly sets.
pub const MAX_FRAGMENT_SETS: usize = 64;

/// Incomplete fragment sets expire after this many milliseconds.
pub const FRAGMENT_TIMEOUT_MS: u64 = 30_000;

/// Dedup window capacity (packet digests).
pub const DEDUP_CAPACITY: usize = 4096;

/// Dedup window TTL in milliseconds.
pub const DEDUP_TTL_MS: u64 = 300_000;

/// Packets whose timestamp is further than this from local time are dropped.
pub const REPLAY_WINDOW_MS: u64 = 300_000;

/// Per-sender rate gate: this many packets per `RATE_WINDOW_MS`.
pub const RATE_LIMIT_PACKETS: u32 = 60;

/// Rate gate window in milliseconds.
pub const RATE_WINDOW_MS: u64 = 10_000;

/// Gossip edges older than this are purged from the mesh graph.
pub const GRAPH_TTL_MS: u64 = 600_000;

/// Payloads at or above this size are candidates for compression.
pub const COMPRESS_THRESHOLD: usize = 256;

/// Noise-layer padding block size.
pub const PAD_BLOCK: usize = 256;

/// Bodies above this size are left unpadded.
pub const PAD_MAX: usize = 4096;

/// Handshake attempts time out after this many milliseconds.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Initial handshake retry backoff; doubles up to `RETRY_BACKOFF_MAX_MS`.
pub const RETRY_BACKOFF_MS: u64 = 1_000;

/// Retry backoff cap.
pub const RETRY_BACKOFF_MAX_MS: u64 = 30_000;

/// Store-and-forward: per-recipient queue cap.
pub const CACHE_MAX_PER_RECIPIENT: usize = 200;

/// Store-and-forward: cached envelopes expire after 7 days.
pub const CACHE_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Store-and-forward drain rate, messages per second.
pub const CACHE_DRAIN_PER_SEC: usize = 10;

/// Outbox entries fail after 7 days without delivery.
pub const SEND_MAX_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Broadcast announces are throttled to one per this interval.
pub const ANNOUNCE_MIN_INTERVAL_MS: u64 = 30_000;

/// Maximum neighbor IDs carried in a gossip TLV.
pub const GOSSIP_MAX_NEIGHBORS: usize = 10;

/// 8-byte ephemeral peer identifier, displayed as 16 lowercase hex chars.
///
/// A node may rotate its peer ID at any time; identity continuity is
/// established by the static keys carried in ANNOUNCE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 8]);

impl PeerId {
    /// Reserved all-ones sentinel used as recipient for non-addressed packets.
    pub const BROADCAST: PeerId = PeerId([0xFF; 8]);

    /// Construct from raw bytes.
    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self(b)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Parse from 16 lowercase hex chars.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 8 {
            return None;
        }
        let mut out = [0u8; 8];
        out.copy_from_slice(&bytes);
        Some(Self(out))
    }

    /// True for the broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// SHA-256 of a peer's static Noise public key, shown as 64 hex chars.
///
/// The fingerprint is the stable identity favorites are pinned to; rebinding
/// a peer ID never mutates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Derive from a static Noise public key.
    pub fn of_static_key(static_pub: &[u8; 32]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, static_pub);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        Self(out)
    }

    /// Parse from 64 lowercase hex chars.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Some(Self(out))
    }

    /// Constant-time equality for untrusted comparisons.
    pub fn ct_eq(&self, other: &Fingerprint) -> bool {
        use subtle::ConstantTimeEq;
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Wire packet types with stable discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer presence broadcast carrying nickname + keys + optional gossip.
    Announce = 0x01,
    /// Graceful peer departure.
    Leave = 0x03,
    /// Public UTF-8 chat message.
    Message = 0x04,
    /// First fragment of an oversized packet.
    FragmentStart = 0x05,
    /// Middle fragment.
    FragmentContinue = 0x06,
    /// Final fragment.
    FragmentEnd = 0x07,
    /// Plaintext delivery acknowledgement (body = UTF-8 message id).
    DeliveryAck = 0x0A,
    /// Plaintext read receipt (body = UTF-8 message id).
    ReadReceipt = 0x0B,
    /// Noise XX handshake message.
    NoiseHandshake = 0x10,
    /// Container for Noise-encrypted payloads.
    NoiseEncrypted = 0x11,
}

impl MessageType {
    /// Convert from the raw wire byte. Unknown values are dropped by callers.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Announce),
            0x03 => Some(Self::Leave),
            0x04 => Some(Self::Message),
            0x05 => Some(Self::FragmentStart),
            0x06 => Some(Self::FragmentContinue),
            0x07 => Some(Self::FragmentEnd),
            0x0A => Some(Self::DeliveryAck),
            0x0B => Some(Self::ReadReceipt),
            0x10 => Some(Self::NoiseHandshake),
            0x11 => Some(Self::NoiseEncrypted),
            _ => None,
        }
    }

    /// Raw wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the three fragment carriers.
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            Self::FragmentStart | Self::FragmentContinue | Self::FragmentEnd
        )
    }
}

/// Payload type tag inside a decrypted `NoiseEncrypted` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NoisePayloadType {
    /// TLV-framed private chat message.
    PrivateMessage = 0x01,
    /// Read receipt; body is the UTF-8 message id.
    ReadReceipt = 0x02,
    /// Delivery acknowledgement; body is the UTF-8 message id.
    DeliveryAck = 0x03,
    /// Favorite/unfavorite notification carrying an optional overlay key.
    FavoriteNotification = 0x04,
}

impl NoisePayloadType {
    /// Convert from the raw tag byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::PrivateMessage),
            0x02 => Some(Self::ReadReceipt),
            0x03 => Some(Self::DeliveryAck),
            0x04 => Some(Self::FavoriteNotification),
            _ => None,
        }
    }

    /// Raw tag byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Stable identifier under which the router groups messages for a peer.
///
/// Canonical string forms: 16-hex mesh peer ID, 64-hex noise key, or the
/// 22-char overlay alias `relay_<first 16 hex of overlay pubkey>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversationKey {
    /// Current mesh peer ID (ephemeral).
    MeshPeer(PeerId),
    /// Stable X25519 noise public key (offline-safe).
    NoiseKey([u8; 32]),
    /// Overlay alias derived from the relay pubkey.
    Overlay(String),
}

impl ConversationKey {
    /// Overlay alias for a relay public key.
    pub fn overlay_alias(relay_pub: &[u8; 32]) -> Self {
        Self::Overlay(format!("relay_{}", &hex::encode(relay_pub)[..16]))
    }

    /// Parse a canonical string form back into a key.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix("relay_") {
            if rest.len() == 16 {
                return Some(Self::Overlay(s.to_string()));
            }
            return None;
        }
        match s.len() {
            16 => PeerId::from_hex(s).map(Self::MeshPeer),
            64 => {
                let bytes = hex::decode(s).ok()?;
                let key: [u8; 32] = bytes.try_into().ok()?;
                Some(Self::NoiseKey(key))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeshPeer(p) => write!(f, "{p}"),
            Self::NoiseKey(k) => f.write_str(&hex::encode(k)),
            Self::Overlay(alias) => f.write_str(alias),
        }
    }
}

/// Delivery lifecycle of a user-initiated private send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Queued or in flight; no acknowledgement yet.
    Sending,
    /// A delivery ack arrived from the recipient.
    Delivered,
    /// A read receipt arrived from the recipient.
    Read,
    /// Gave up after `SEND_MAX_AGE_MS` without delivery.
    Failed,
}

/// Which transport carried (or will carry) a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Local short-range mesh.
    Mesh,
    /// Relay overlay.
    Overlay,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read config file.
    #[error("read config")]
    Read,
    /// Cannot parse TOML.
    #[error("parse config")]
    Parse,
}

/// Node configuration root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Display nickname announced to the mesh.
    pub nickname: String,
    /// Data directory (keys + sled stores).
    pub data_dir: String,
    /// Optional metrics listen address, e.g. `127.0.0.1:9600`.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// Our overlay relay public key (hex), shared in favorite
    /// notifications so mutual favorites can reach us off-mesh.
    #[serde(default)]
    pub overlay_pub_hex: Option<String>,
    /// Whether this node relays packets for others.
    #[serde(default = "default_true")]
    pub relay_enabled: bool,
    /// Overall connection budget hint passed to the transport driver.
    #[serde(default = "default_conn")]
    pub max_conn_overall: u32,
    /// Server-role connection budget hint.
    #[serde(default = "default_conn_half")]
    pub max_conn_server: u32,
    /// Client-role connection budget hint.
    #[serde(default = "default_conn_half")]
    pub max_conn_client: u32,
    /// Verbose protocol logging.
    #[serde(default)]
    pub verbose_log: bool,
}

fn default_true() -> bool {
    true
}
fn default_conn() -> u32 {
    8
}
fn default_conn_half() -> u32 {
    4
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            data_dir: "./data".to_string(),
            metrics_addr: None,
            overlay_pub_hex: None,
            relay_enabled: true,
            max_conn_overall: default_conn(),
            max_conn_server: default_conn_half(),
            max_conn_client: default_conn_half(),
            verbose_log: false,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
}

impl NodeConfig {
    /// Load from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
        toml::from_str(&raw).map_err(|_| ConfigError::Parse)
    }

    /// Apply `EMBERMESH_*` environment overrides on top of this config.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_str("EMBERMESH_DATA_DIR") {
            self.data_dir = v;
        }
        if let Some(v) = env_str("EMBERMESH_NICKNAME") {
            self.nickname = v;
        }
        if let Some(v) = env_str("EMBERMESH_METRICS_ADDR") {
            self.metrics_addr = Some(v);
        }
        if let Some(v) = env_u32("EMBERMESH_MAX_CONN_OVERALL") {
            self.max_conn_overall = v;
        }
        if let Some(v) = env_u32("EMBERMESH_MAX_CONN_SERVER") {
            self.max_conn_server = v;
        }
        if let Some(v) = env_u32("EMBERMESH_MAX_CONN_CLIENT") {
            self.max_conn_client = v;
        }
        if let Some(v) = env_bool("EMBERMESH_VERBOSE_LOG") {
            self.verbose_log = v;
        }
        if let Some(v) = env_bool("EMBERMESH_PACKET_RELAY_ENABLED") {
            self.relay_enabled = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_forms_roundtrip() {
        let mesh = ConversationKey::MeshPeer(PeerId::from_bytes([0xAB; 8]));
        assert_eq!(ConversationKey::parse(&mesh.to_string()), Some(mesh));

        let stable = ConversationKey::NoiseKey([0x1F; 32]);
        assert_eq!(ConversationKey::parse(&stable.to_string()), Some(stable));

        let overlay = ConversationKey::overlay_alias(&[0xC0; 32]);
        let s = overlay.to_string();
        assert_eq!(s.len(), 22);
        assert!(s.starts_with("relay_"));
        assert_eq!(ConversationKey::parse(&s), Some(overlay));

        assert_eq!(ConversationKey::parse("not-a-key"), None);
    }

    #[test]
    fn fingerprint_is_stable_for_a_key() {
        let key = [0x42u8; 32];
        assert_eq!(
            Fingerprint::of_static_key(&key),
            Fingerprint::of_static_key(&key)
        );
        assert_ne!(
            Fingerprint::of_static_key(&key),
            Fingerprint::of_static_key(&[0x43u8; 32])
        );
        assert_eq!(Fingerprint::of_static_key(&key).to_string().len(), 64);
    }

    #[test]
    fn broadcast_sentinel() {
        assert!(PeerId::BROADCAST.is_broadcast());
        assert!(!PeerId::from_bytes([1; 8]).is_broadcast());
        assert_eq!(PeerId::from_hex(&PeerId::BROADCAST.to_string()), Some(PeerId::BROADCAST));
    }
}
