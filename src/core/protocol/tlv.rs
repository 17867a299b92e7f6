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

//! TLV payloads: identity announcements, private messages, and the typed
//! record inside a Noise-encrypted packet.
//!
//! Every TLV is `{type:u8, length:u8, value:length bytes}`. Unknown types
//! are skipped so old nodes tolerate new fields.

use crate::core::types::{NoisePayloadType, PeerId, GOSSIP_MAX_NEIGHBORS};
use thiserror::Error;

/// Announce TLV: nickname.
pub const TLV_NICKNAME: u8 = 0x01;
/// Announce TLV: X25519 static public key.
pub const TLV_NOISE_PUBLIC_KEY: u8 = 0x02;
/// Announce TLV: Ed25519 signing public key.
pub const TLV_SIGNING_PUBLIC_KEY: u8 = 0x03;
/// Announce TLV: up to 10 directly connected peer IDs.
pub const TLV_GOSSIP: u8 = 0x04;

/// Private-message TLV: UUID message id.
pub const TLV_MESSAGE_ID: u8 = 0x01;
/// Private-message TLV: UTF-8 content chunk.
pub const TLV_CONTENT: u8 = 0x02;

/// TLV parse/build failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    /// Record ended inside a TLV.
    #[error("truncated tlv")]
    Truncated,
    /// A required TLV is absent.
    #[error("missing required tlv")]
    MissingField,
    /// A value does not fit the one-byte length.
    #[error("tlv value too large")]
    ValueTooLarge,
    /// A value has the wrong size or is not valid UTF-8.
    #[error("bad tlv value")]
    BadValue,
}

fn push_tlv(out: &mut Vec<u8>, ty: u8, value: &[u8]) -> Result<(), TlvError> {
    if value.len() > u8::MAX as usize {
        return Err(TlvError::ValueTooLarge);
    }
    out.push(ty);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
    Ok(())
}

fn walk(data: &[u8], mut f: impl FnMut(u8, &[u8]) -> Result<(), TlvError>) -> Result<(), TlvError> {
    let mut pos = 0;
    while pos < data.len() {
        if pos + 2 > data.len() {
            return Err(TlvError::Truncated);
        }
        let ty = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(TlvError::Truncated);
        }
        f(ty, &data[pos..pos + len])?;
        pos += len;
    }
    Ok(())
}

/// Identity announcement payload carried by ANNOUNCE packets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnouncePayload {
    /// Announced nickname.
    pub nickname: String,
    /// X25519 static public key; basis of the fingerprint.
    pub noise_public_key: [u8; 32],
    /// Ed25519 signing public key.
    pub signing_public_key: [u8; 32],
    /// Directly connected neighbors, at most `GOSSIP_MAX_NEIGHBORS`.
    pub gossip: Vec<PeerId>,
}

impl AnnouncePayload {
    /// Encode to TLV bytes. The gossip TLV is omitted when empty.
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut out = Vec::with_capacity(96 + self.nickname.len());
        push_tlv(&mut out, TLV_NICKNAME, self.nickname.as_bytes())?;
        push_tlv(&mut out, TLV_NOISE_PUBLIC_KEY, &self.noise_public_key)?;
        push_tlv(&mut out, TLV_SIGNING_PUBLIC_KEY, &self.signing_public_key)?;
        if !self.gossip.is_empty() {
            let mut ids = Vec::with_capacity(self.gossip.len() * 8);
            for p in self.gossip.iter().take(GOSSIP_MAX_NEIGHBORS) {
                ids.extend_from_slice(p.as_bytes());
            }
            push_tlv(&mut out, TLV_GOSSIP, &ids)?;
        }
        Ok(out)
    }

    /// Decode from TLV bytes; unknown TLV types are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut nickname = None;
        let mut noise_pub = None;
        let mut signing_pub = None;
        let mut gossip = Vec::new();

        walk(data, |ty, value| {
            match ty {
                TLV_NICKNAME => {
                    let s = std::str::from_utf8(value).map_err(|_| TlvError::BadValue)?;
                    nickname = Some(s.to_string());
                }
                TLV_NOISE_PUBLIC_KEY => {
                    let k: [u8; 32] = value.try_into().map_err(|_| TlvError::BadValue)?;
                    noise_pub = Some(k);
                }
                TLV_SIGNING_PUBLIC_KEY => {
                    let k: [u8; 32] = value.try_into().map_err(|_| TlvError::BadValue)?;
                    signing_pub = Some(k);
                }
                TLV_GOSSIP => {
                    if value.len() % 8 != 0 || value.len() / 8 > GOSSIP_MAX_NEIGHBORS {
                        return Err(TlvError::BadValue);
                    }
                    for chunk in value.chunks_exact(8) {
                        let mut id = [0u8; 8];
                        id.copy_from_slice(chunk);
                        gossip.push(PeerId::from_bytes(id));
                    }
                }
                _ => {} // forward compatible
            }
            Ok(())
        })?;

        Ok(Self {
            nickname: nickname.ok_or(TlvError::MissingField)?,
            noise_public_key: noise_pub.ok_or(TlvError::MissingField)?,
            signing_public_key: signing_pub.ok_or(TlvError::MissingField)?,
            gossip,
        })
    }
}

/// Private chat message carried inside a `PrivateMessage` noise record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateMessagePayload {
    /// Globally unique message id (UUID string).
    pub id: String,
    /// UTF-8 content.
    pub content: String,
}

impl PrivateMessagePayload {
    /// Encode to TLV bytes. Content longer than one TLV value is chunked
    /// into consecutive CONTENT TLVs which decode back in order.
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut out = Vec::with_capacity(4 + self.id.len() + self.content.len());
        push_tlv(&mut out, TLV_MESSAGE_ID, self.id.as_bytes())?;
        let content = self.content.as_bytes();
        if content.is_empty() {
            push_tlv(&mut out, TLV_CONTENT, b"")?;
        } else {
            for chunk in content.chunks(u8::MAX as usize) {
                push_tlv(&mut out, TLV_CONTENT, chunk)?;
            }
        }
        Ok(out)
    }

    /// Decode from TLV bytes.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut id = None;
        let mut content = Vec::new();
        let mut saw_content = false;

        walk(data, |ty, value| {
            match ty {
                TLV_MESSAGE_ID => {
                    let s = std::str::from_utf8(value).map_err(|_| TlvError::BadValue)?;
                    id = Some(s.to_string());
                }
                TLV_CONTENT => {
                    saw_content = true;
                    content.extend_from_slice(value);
                }
                _ => {}
            }
            Ok(())
        })?;

        if !saw_content {
            return Err(TlvError::MissingField);
        }
        Ok(Self {
            id: id.ok_or(TlvError::MissingField)?,
            content: String::from_utf8(content).map_err(|_| TlvError::BadValue)?,
        })
    }
}

/// The typed record a `NoiseEncrypted` ciphertext decrypts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoiseRecord {
    /// Payload type tag.
    pub kind: NoisePayloadType,
    /// Type-specific body.
    pub body: Vec<u8>,
}

impl NoiseRecord {
    /// Encode as `tag || body`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.body.len());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode `tag || body`; unknown tags are a `BadValue`.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let (&tag, body) = data.split_first().ok_or(TlvError::Truncated)?;
        let kind = NoisePayloadType::from_u8(tag).ok_or(TlvError::BadValue)?;
        Ok(Self {
            kind,
            body: body.to_vec(),
        })
    }
}

/// Favorite-notification body: `[FAVORITED]:<overlay pub hex>` or
/// `[UNFAVORITED]`.
pub fn encode_favorite_body(favored: bool, overlay_pub: Option<&[u8; 32]>) -> Vec<u8> {
    match (favored, overlay_pub) {
        (true, Some(pk)) => format!("[FAVORITED]:{}", hex::encode(pk)).into_bytes(),
        (true, None) => b"[FAVORITED]".to_vec(),
        (false, _) => b"[UNFAVORITED]".to_vec(),
    }
}

/// Parse a favorite-notification body. Returns `(favored, overlay_pub)`.
pub fn parse_favorite_body(body: &[u8]) -> Option<(bool, Option<[u8; 32]>)> {
    let s = std::str::from_utf8(body).ok()?;
    if s == "[UNFAVORITED]" {
        return Some((false, None));
    }
    if s == "[FAVORITED]" {
        return Some((true, None));
    }
    let hex_part = s.strip_prefix("[FAVORITED]:")?;
    let bytes = hex::decode(hex_part).ok()?;
    let pk: [u8; 32] = bytes.try_into().ok()?;
    Some((true, Some(pk)))
}
