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

//! Typed packet construction and noise-record dispatch.
//!
//! Every outgoing packet is signed over its canonical bytes. Private
//! payloads are padded before encryption so ciphertext lengths fall into
//! coarse classes.

use crate::core::protocol::codec;
use crate::core::protocol::packet::{Packet, WireError};
use crate::core::protocol::tlv::{
    self, AnnouncePayload, NoiseRecord, PrivateMessagePayload, TlvError,
};
use crate::core::security::keystore::{Keystore, KeystoreError};
use crate::core::types::{MessageType, NoisePayloadType, PeerId};
use thiserror::Error;

/// Packet construction failures.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Framing failure.
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    /// TLV failure.
    #[error("tlv: {0}")]
    Tlv(#[from] TlvError),
    /// Signing failure.
    #[error("keystore: {0}")]
    Keystore(#[from] KeystoreError),
}

/// Parsed content of a decrypted noise record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NoiseAction {
    /// A private chat message.
    Private {
        /// Message id.
        id: String,
        /// UTF-8 content.
        content: String,
    },
    /// The peer has read our message.
    ReadReceipt {
        /// Message id being acknowledged.
        id: String,
    },
    /// The peer's device received our message.
    DeliveryAck {
        /// Message id being acknowledged.
        id: String,
    },
    /// The peer favorited or unfavorited us.
    Favorite {
        /// New favorite state.
        favored: bool,
        /// The peer's overlay relay key, when shared.
        overlay_pub: Option<[u8; 32]>,
    },
}

/// Builds and signs outgoing packets for one local identity.
pub struct MessageHandler {
    local_id: PeerId,
}

impl MessageHandler {
    /// Handler for the given local peer ID.
    pub fn new(local_id: PeerId) -> Self {
        Self { local_id }
    }

    /// Update the local peer ID after rotation.
    pub fn set_local_id(&mut self, id: PeerId) {
        self.local_id = id;
    }

    /// The local peer ID packets are stamped with.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn sign(&self, keystore: &Keystore, packet: &mut Packet) -> Result<(), HandlerError> {
        let canonical = packet.canonical_for_signing()?;
        packet.signature = Some(keystore.sign(&canonical)?);
        Ok(())
    }

    /// Broadcast identity announcement. `gossip` lists our direct peers.
    pub fn build_announce(
        &self,
        keystore: &Keystore,
        nickname: &str,
        gossip: &[PeerId],
        recipient: Option<PeerId>,
        now_ms: u64,
    ) -> Result<Packet, HandlerError> {
        let payload = AnnouncePayload {
            nickname: nickname.to_string(),
            noise_public_key: keystore.static_public(),
            signing_public_key: keystore.signing_public(),
            gossip: gossip.to_vec(),
        }
        .encode()?;
        let mut packet = Packet::new(
            MessageType::Announce,
            self.local_id,
            recipient,
            now_ms,
            payload,
        );
        self.sign(keystore, &mut packet)?;
        Ok(packet)
    }

    /// Public broadcast chat message (plain UTF-8 payload).
    pub fn build_public_message(
        &self,
        keystore: &Keystore,
        content: &str,
        now_ms: u64,
    ) -> Result<Packet, HandlerError> {
        let mut packet = Packet::new(
            MessageType::Message,
            self.local_id,
            None,
            now_ms,
            content.as_bytes().to_vec(),
        );
        self.sign(keystore, &mut packet)?;
        Ok(packet)
    }

    /// Graceful departure.
    pub fn build_leave(&self, keystore: &Keystore, now_ms: u64) -> Result<Packet, HandlerError> {
        let mut packet = Packet::new(MessageType::Leave, self.local_id, None, now_ms, Vec::new());
        self.sign(keystore, &mut packet)?;
        Ok(packet)
    }

    /// Wrap handshake bytes for a peer.
    pub fn build_noise_handshake(
        &self,
        keystore: &Keystore,
        peer: PeerId,
        handshake: Vec<u8>,
        now_ms: u64,
    ) -> Result<Packet, HandlerError> {
        let mut packet = Packet::new(
            MessageType::NoiseHandshake,
            self.local_id,
            Some(peer),
            now_ms,
            handshake,
        );
        self.sign(keystore, &mut packet)?;
        Ok(packet)
    }

    /// Wrap a transport ciphertext for a peer. The source route, when one
    /// is attached, must be present before signing: it is part of the
    /// canonical bytes.
    pub fn build_noise_encrypted(
        &self,
        keystore: &Keystore,
        peer: PeerId,
        ciphertext: Vec<u8>,
        route: Option<Vec<PeerId>>,
        now_ms: u64,
    ) -> Result<Packet, HandlerError> {
        let mut packet = Packet::new(
            MessageType::NoiseEncrypted,
            self.local_id,
            Some(peer),
            now_ms,
            ciphertext,
        );
        packet.route = route;
        self.sign(keystore, &mut packet)?;
        Ok(packet)
    }

    /// Plaintext delivery ack (used where no session exists).
    pub fn build_delivery_ack(
        &self,
        keystore: &Keystore,
        peer: PeerId,
        message_id: &str,
        now_ms: u64,
    ) -> Result<Packet, HandlerError> {
        let mut packet = Packet::new(
            MessageType::DeliveryAck,
            self.local_id,
            Some(peer),
            now_ms,
            message_id.as_bytes().to_vec(),
        );
        self.sign(keystore, &mut packet)?;
        Ok(packet)
    }

    /// Plaintext read receipt (used where no session exists).
    pub fn build_read_receipt(
        &self,
        keystore: &Keystore,
        peer: PeerId,
        message_id: &str,
        now_ms: u64,
    ) -> Result<Packet, HandlerError> {
        let mut packet = Packet::new(
            MessageType::ReadReceipt,
            self.local_id,
            Some(peer),
            now_ms,
            message_id.as_bytes().to_vec(),
        );
        self.sign(keystore, &mut packet)?;
        Ok(packet)
    }
}

/// Build the padded plaintext for a private message record.
pub fn private_message_plaintext(id: &str, content: &str) -> Result<Vec<u8>, TlvError> {
    let body = PrivateMessagePayload {
        id: id.to_string(),
        content: content.to_string(),
    }
    .encode()?;
    let record = NoiseRecord {
        kind: NoisePayloadType::PrivateMessage,
        body,
    };
    Ok(codec::pad(record.encode()))
}

/// Build the padded plaintext for a receipt/ack/favorite record.
pub fn control_plaintext(kind: NoisePayloadType, body: Vec<u8>) -> Vec<u8> {
    codec::pad(NoiseRecord { kind, body }.encode())
}

/// Parse a decrypted (still padded) noise plaintext into an action.
pub fn parse_noise_plaintext(plaintext: &[u8]) -> Result<NoiseAction, TlvError> {
    let record = NoiseRecord::decode(codec::unpad(plaintext))?;
    match record.kind {
        NoisePayloadType::PrivateMessage => {
            let msg = PrivateMessagePayload::decode(&record.body)?;
            Ok(NoiseAction::Private {
                id: msg.id,
                content: msg.content,
            })
        }
        NoisePayloadType::ReadReceipt => Ok(NoiseAction::ReadReceipt {
            id: String::from_utf8(record.body).map_err(|_| TlvError::BadValue)?,
        }),
        NoisePayloadType::DeliveryAck => Ok(NoiseAction::DeliveryAck {
            id: String::from_utf8(record.body).map_err(|_| TlvError::BadValue)?,
        }),
        NoisePayloadType::FavoriteNotification => {
            let (favored, overlay_pub) =
                tlv::parse_favorite_body(&record.body).ok_or(TlvError::BadValue)?;
            Ok(NoiseAction::Favorite {
                favored,
                overlay_pub,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::guard::IngressGuard;

    fn fixture() -> (Keystore, MessageHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ks = Keystore::open(dir.path().to_str().unwrap()).expect("keystore");
        let handler = MessageHandler::new(PeerId::from_bytes([1; 8]));
        (ks, handler, dir)
    }

    #[test]
    fn announce_roundtrips_and_verifies() {
        let (ks, handler, _dir) = fixture();
        let packet = handler
            .build_announce(&ks, "alice", &[PeerId::from_bytes([2; 8])], None, 1000)
            .unwrap();

        let wire = packet.encode().unwrap();
        let decoded = Packet::decode(&wire).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Announce);

        let announce = AnnouncePayload::decode(&decoded.payload).unwrap();
        assert_eq!(announce.nickname, "alice");
        assert_eq!(announce.signing_public_key, ks.signing_public());

        let canonical = Packet::canonical_of_wire(&wire).unwrap();
        IngressGuard::verify_signature(
            &decoded,
            &canonical,
            None,
            Some(&announce.signing_public_key),
        )
        .unwrap();
    }

    #[test]
    fn tampered_announce_fails_verification() {
        let (ks, handler, _dir) = fixture();
        let packet = handler
            .build_announce(&ks, "alice", &[], None, 1000)
            .unwrap();
        let mut wire = packet.encode().unwrap();
        // Flip a payload byte without touching the signature.
        wire[25] ^= 0x01;
        let decoded = Packet::decode(&wire).unwrap();
        let canonical = Packet::canonical_of_wire(&wire).unwrap();
        let key = ks.signing_public();
        assert!(
            IngressGuard::verify_signature(&decoded, &canonical, Some(&key), None).is_err()
        );
    }

    #[test]
    fn private_plaintext_roundtrip() {
        let pt = private_message_plaintext("m1", "hi").unwrap();
        assert_eq!(pt.len() % 256, 0);
        let action = parse_noise_plaintext(&pt).unwrap();
        assert_eq!(
            action,
            NoiseAction::Private {
                id: "m1".to_string(),
                content: "hi".to_string()
            }
        );
    }

    #[test]
    fn ack_plaintext_roundtrip() {
        let pt = control_plaintext(NoisePayloadType::DeliveryAck, b"m1".to_vec());
        assert_eq!(
            parse_noise_plaintext(&pt).unwrap(),
            NoiseAction::DeliveryAck {
                id: "m1".to_string()
            }
        );
    }

    #[test]
    fn favorite_plaintext_roundtrip() {
        let body = tlv::encode_favorite_body(true, Some(&[9u8; 32]));
        let pt = control_plaintext(NoisePayloadType::FavoriteNotification, body);
        assert_eq!(
            parse_noise_plaintext(&pt).unwrap(),
            NoiseAction::Favorite {
                favored: true,
                overlay_pub: Some([9u8; 32])
            }
        );
    }
}
