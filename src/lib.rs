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

//! Embermesh - mesh messaging core for a decentralized peer-to-peer chat.
//!
//! This repository provides:
//! - A signed, fragmented binary packet protocol with canonical signing bytes
//! - End-to-end encrypted sessions (Noise XX) with typed payload framing
//! - Peer identity lifecycle: ephemeral peer IDs bound to stable key fingerprints
//! - Multi-hop flood/source-routed relay with de-duplication and TTL
//! - Store-and-forward for mutual favorites who are offline
//! - A message router that moves a conversation between the local mesh and an
//!   overlay relay transport
//! - Monitoring via Prometheus metrics and structured logging

/// Core protocol primitives (types, framing, sessions, identity keys).
pub mod core;
/// Mesh plane (peer table, ingress pipeline, relay planning, transports).
pub mod mesh;
/// Observability (metrics registry and exposition).
pub mod monitoring;
/// Node control surface and actor wiring.
pub mod node;
/// Message router: transport selection, outbox, conversation unification.
pub mod router;
/// Persistence (favorites, store-and-forward cache).
pub mod store;
