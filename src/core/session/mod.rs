// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! End-to-end encrypted sessions: Noise XX handshakes, transport ciphers,
//! tie-break and rekey policy.

mod manager;
mod noise;

pub use manager::{HandshakeOutcome, SessionManager};
pub use noise::{NoiseSession, Role};

use thiserror::Error;

/// Per-peer session lifecycle, consumed by the UI lock icon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No session and no handshake in flight.
    Uninitialized,
    /// A handshake is in flight in the given role.
    Handshaking(Role),
    /// Transport ciphers are live in both directions.
    Established,
    /// The last attempt failed; retry after backoff.
    Failed,
    /// The session aged out and awaits rekey.
    Expired,
}

/// Session-layer errors. Only user-initiated sends surface these; internal
/// occurrences restart the handshake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No established session with this peer.
    #[error("session not established")]
    NotEstablished,
    /// The peer is not known to the session layer.
    #[error("peer unknown")]
    PeerUnknown,
    /// Handshake did not complete within the timeout.
    #[error("handshake timeout")]
    HandshakeTimeout,
    /// Decryption or handshake authentication failed.
    #[error("authentication failure")]
    AuthFailure,
    /// The cipher nonce space is exhausted; the session is terminated.
    #[error("nonce reuse")]
    NonceReuse,
    /// The session exceeded its rekey budget.
    #[error("session expired")]
    Expired,
    /// Handshake message arrived for a state that cannot accept it.
    #[error("out of turn handshake message")]
    OutOfTurn,
}
