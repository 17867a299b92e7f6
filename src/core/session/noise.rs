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

//! One Noise XX session with a single remote peer.
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//! Mutual authentication, forward secrecy, responder identity hiding. After
//! the third message both directions switch to independent transport
//! ciphers (ChaCha20-Poly1305, nonces starting at zero).

use crate::core::session::SessionError;
use crate::core::types::NOISE_PATTERN;
use snow::{Builder, HandshakeState, TransportState};

/// Maximum Noise message size (protocol constant).
pub const MAX_NOISE_MESSAGE: usize = 65_535;

/// AEAD tag overhead per transport message.
pub const NOISE_TAG_LEN: usize = 16;

/// With empty handshake payloads the three XX messages have fixed sizes;
/// the session manager routes incoming handshake bytes by them.
pub const XX_MSG1_LEN: usize = 32;
/// Second message: e, ee, s, es.
pub const XX_MSG2_LEN: usize = 96;
/// Third message: s, se.
pub const XX_MSG3_LEN: usize = 64;

/// Handshake role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends the first message.
    Initiator,
    /// Waits for the first message.
    Responder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    InitiatorStart,
    InitiatorAwaitResponse,
    ResponderAwaitInit,
    ResponderAwaitFinal,
    Transport,
    Dead,
}

/// A single Noise session: handshake state machine, then transport ciphers.
pub struct NoiseSession {
    handshake: Option<HandshakeState>,
    transport: Option<TransportState>,
    phase: Phase,
    role: Role,
    remote_static: Option<[u8; 32]>,
    buffer: Vec<u8>,
}

impl NoiseSession {
    fn build(role: Role, static_private: &[u8]) -> Result<Self, SessionError> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|_| SessionError::AuthFailure)?;
        let builder = Builder::new(params).local_private_key(static_private);
        let (handshake, phase) = match role {
            Role::Initiator => (
                builder
                    .build_initiator()
                    .map_err(|_| SessionError::AuthFailure)?,
                Phase::InitiatorStart,
            ),
            Role::Responder => (
                builder
                    .build_responder()
                    .map_err(|_| SessionError::AuthFailure)?,
                Phase::ResponderAwaitInit,
            ),
        };
        Ok(Self {
            handshake: Some(handshake),
            transport: None,
            phase,
            role,
            remote_static: None,
            buffer: vec![0u8; MAX_NOISE_MESSAGE],
        })
    }

    /// New initiator session over the local static key.
    pub fn new_initiator(static_private: &[u8]) -> Result<Self, SessionError> {
        Self::build(Role::Initiator, static_private)
    }

    /// New responder session over the local static key.
    pub fn new_responder(static_private: &[u8]) -> Result<Self, SessionError> {
        Self::build(Role::Responder, static_private)
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True once both transport ciphers are live.
    pub fn is_transport(&self) -> bool {
        self.phase == Phase::Transport
    }

    /// Remote static key, available once the peer has revealed it.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    fn capture_remote_static(&mut self) {
        if self.remote_static.is_some() {
            return;
        }
        if let Some(hs) = self.handshake.as_ref() {
            if let Some(rs) = hs.get_remote_static() {
                if rs.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(rs);
                    self.remote_static = Some(key);
                }
            }
        }
    }

    fn enter_transport(&mut self) -> Result<(), SessionError> {
        self.capture_remote_static();
        let hs = self.handshake.take().ok_or(SessionError::OutOfTurn)?;
        let transport = hs.into_transport_mode().map_err(|_| {
            self.phase = Phase::Dead;
            SessionError::AuthFailure
        })?;
        self.transport = Some(transport);
        self.phase = Phase::Transport;
        Ok(())
    }

    /// Produce the next outbound handshake message. Empty payloads only;
    /// identity data travels in ANNOUNCE, not in the handshake.
    pub fn write_handshake(&mut self) -> Result<Vec<u8>, SessionError> {
        match (self.role, self.phase) {
            (Role::Initiator, Phase::InitiatorStart)
            | (Role::Responder, Phase::ResponderAwaitFinal) => {}
            _ => return Err(SessionError::OutOfTurn),
        }
        let hs = self.handshake.as_mut().ok_or(SessionError::OutOfTurn)?;
        let len = hs.write_message(&[], &mut self.buffer).map_err(|_| {
            self.phase = Phase::Dead;
            SessionError::AuthFailure
        })?;
        let msg = self.buffer[..len].to_vec();

        match (self.role, self.phase) {
            (Role::Initiator, Phase::InitiatorStart) => {
                self.phase = Phase::InitiatorAwaitResponse;
            }
            (Role::Responder, Phase::ResponderAwaitFinal) => {
                // Responder's reply (msg2) sent; final message is inbound.
            }
            _ => {}
        }
        Ok(msg)
    }

    /// Consume an inbound handshake message; returns the reply to send, if
    /// this side owes one, and whether the handshake just completed.
    pub fn read_handshake(&mut self, message: &[u8]) -> Result<(Option<Vec<u8>>, bool), SessionError> {
        match (self.role, self.phase) {
            (Role::Initiator, Phase::InitiatorAwaitResponse)
            | (Role::Responder, Phase::ResponderAwaitInit)
            | (Role::Responder, Phase::ResponderAwaitFinal) => {}
            _ => return Err(SessionError::OutOfTurn),
        }
        let hs = self.handshake.as_mut().ok_or(SessionError::OutOfTurn)?;
        hs.read_message(message, &mut self.buffer).map_err(|_| {
            self.phase = Phase::Dead;
            SessionError::AuthFailure
        })?;

        match (self.role, self.phase) {
            (Role::Initiator, Phase::InitiatorAwaitResponse) => {
                // Got msg2; answer with msg3 and switch to transport.
                self.capture_remote_static();
                let hs = self.handshake.as_mut().ok_or(SessionError::OutOfTurn)?;
                let len = hs.write_message(&[], &mut self.buffer).map_err(|_| {
                    self.phase = Phase::Dead;
                    SessionError::AuthFailure
                })?;
                let reply = self.buffer[..len].to_vec();
                self.enter_transport()?;
                Ok((Some(reply), true))
            }
            (Role::Responder, Phase::ResponderAwaitInit) => {
                // Got msg1; answer with msg2.
                self.phase = Phase::ResponderAwaitFinal;
                let reply = self.write_handshake()?;
                Ok((Some(reply), false))
            }
            (Role::Responder, Phase::ResponderAwaitFinal) => {
                // Got msg3; handshake complete, nothing to send.
                self.enter_transport()?;
                Ok((None, true))
            }
            _ => Err(SessionError::OutOfTurn),
        }
    }

    /// Encrypt one transport message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::NotEstablished)?;
        if plaintext.len() > MAX_NOISE_MESSAGE - NOISE_TAG_LEN {
            return Err(SessionError::NonceReuse);
        }
        let len = transport
            .write_message(plaintext, &mut self.buffer)
            .map_err(|_| {
                // Nonce exhaustion is the only state error here; terminal.
                self.phase = Phase::Dead;
                SessionError::NonceReuse
            })?;
        Ok(self.buffer[..len].to_vec())
    }

    /// Decrypt one transport message.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::NotEstablished)?;
        if ciphertext.len() > MAX_NOISE_MESSAGE {
            return Err(SessionError::AuthFailure);
        }
        let len = transport
            .read_message(ciphertext, &mut self.buffer)
            .map_err(|_| SessionError::AuthFailure)?;
        Ok(self.buffer[..len].to_vec())
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("remote_static", &self.remote_static.map(hex::encode))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> snow::Keypair {
        Builder::new(NOISE_PATTERN.parse().unwrap())
            .generate_keypair()
            .unwrap()
    }

    fn handshake_pair() -> (NoiseSession, NoiseSession) {
        let (a, b) = (keypair(), keypair());
        let mut init = NoiseSession::new_initiator(&a.private).unwrap();
        let mut resp = NoiseSession::new_responder(&b.private).unwrap();

        let msg1 = init.write_handshake().unwrap();
        assert_eq!(msg1.len(), XX_MSG1_LEN);
        let (reply, done) = resp.read_handshake(&msg1).unwrap();
        assert!(!done);
        let msg2 = reply.unwrap();
        assert_eq!(msg2.len(), XX_MSG2_LEN);
        let (reply, done) = init.read_handshake(&msg2).unwrap();
        assert!(done);
        let msg3 = reply.unwrap();
        assert_eq!(msg3.len(), XX_MSG3_LEN);
        let (reply, done) = resp.read_handshake(&msg3).unwrap();
        assert!(done);
        assert!(reply.is_none());
        (init, resp)
    }

    #[test]
    fn full_handshake_reaches_transport() {
        let (init, resp) = handshake_pair();
        assert!(init.is_transport());
        assert!(resp.is_transport());
        assert!(init.remote_static().is_some());
        assert!(resp.remote_static().is_some());
        assert_ne!(init.remote_static(), resp.remote_static());
    }

    #[test]
    fn transport_roundtrip_both_directions() {
        let (mut init, mut resp) = handshake_pair();
        for i in 0..8 {
            let msg = format!("msg {i}");
            let ct = init.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(resp.decrypt(&ct).unwrap(), msg.as_bytes());
            let ct = resp.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(init.decrypt(&ct).unwrap(), msg.as_bytes());
        }
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut init, mut resp) = handshake_pair();
        let mut ct = init.encrypt(b"secret").unwrap();
        ct[0] ^= 0xFF;
        assert_eq!(resp.decrypt(&ct), Err(SessionError::AuthFailure));
    }

    #[test]
    fn encrypt_before_establishment_fails() {
        let kp = keypair();
        let mut s = NoiseSession::new_initiator(&kp.private).unwrap();
        assert_eq!(s.encrypt(b"x"), Err(SessionError::NotEstablished));
    }

    #[test]
    fn responder_cannot_write_first() {
        let kp = keypair();
        let mut s = NoiseSession::new_responder(&kp.private).unwrap();
        assert_eq!(s.write_handshake(), Err(SessionError::OutOfTurn));
    }
}
