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

//! Node wiring: one actor loop owning all core state, commands in over a
//! channel, events out over another, timers for every periodic duty.
//!
//! Entry points never block; the loop is the single writer of the peer
//! table, session state, router, and caches.

use crate::core::events::{CoreEvent, EventRx, EventTx};
use crate::core::protocol::fragment;
use crate::core::protocol::packet::Packet;
use crate::core::security::keystore::{Keystore, KeystoreError};
use crate::core::session::{SessionManager, SessionState};
use crate::core::types::{
    ConversationKey, DeliveryStatus, Fingerprint, MessageType, NodeConfig, NoisePayloadType,
    PeerId, TransportKind, FRAGMENT_THRESHOLD, GOSSIP_MAX_NEIGHBORS,
};
use crate::mesh::graph::{EgressPlan, MeshGraph, RelayPlan};
use crate::mesh::guard::DropReason;
use crate::mesh::handler::{self, HandlerError, MessageHandler, NoiseAction};
use crate::mesh::peers::{AnnounceTrigger, PeerManager};
use crate::mesh::processor::{DropCause, PacketProcessor};
use crate::mesh::transport::{LinkEvent, LinkId, LinkMap, MeshTransport, OverlayEvent, OverlayTransport};
use crate::monitoring::metrics::{Metrics, MetricsError};
use crate::router::{MessageRouter, Reachability, RouteDecision, RouterError};
use crate::store::favorites::FavoritesStore;
use crate::store::forward::StoreForwardCache;
use crate::store::StoreError;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Node startup/control errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Keystore failure.
    #[error("keystore: {0}")]
    Keystore(#[from] KeystoreError),
    /// Persistence failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Metrics failure.
    #[error("metrics: {0}")]
    Metrics(#[from] MetricsError),
    /// Packet construction failure.
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),
    /// Router rejection surfaced to the caller.
    #[error("router: {0}")]
    Router(#[from] RouterError),
    /// sled open failure.
    #[error("db open")]
    DbOpen,
    /// The node loop is gone.
    #[error("node stopped")]
    Stopped,
}

/// Control-surface commands.
#[derive(Debug)]
enum Command {
    SetNickname(String),
    SendPublic(String),
    SendPrivate {
        content: String,
        target: ConversationKey,
        id: String,
    },
    ToggleFavorite {
        target: ConversationKey,
        reply: oneshot::Sender<Result<bool, NodeError>>,
    },
    MarkRead {
        target: ConversationKey,
        id: String,
    },
    PanicReset,
    Stop,
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Change the announced nickname (triggers an immediate announce).
    pub async fn set_nickname(&self, nickname: String) -> Result<(), NodeError> {
        self.cmd_tx
            .send(Command::SetNickname(nickname))
            .await
            .map_err(|_| NodeError::Stopped)
    }

    /// Broadcast a public chat message.
    pub async fn send_public(&self, content: String) -> Result<(), NodeError> {
        self.cmd_tx
            .send(Command::SendPublic(content))
            .await
            .map_err(|_| NodeError::Stopped)
    }

    /// Send a private message; returns the message id used for delivery
    /// tracking. `target` is any canonical conversation key form.
    pub async fn send_private(
        &self,
        content: String,
        target: &str,
        id: Option<String>,
    ) -> Result<String, NodeError> {
        let target = ConversationKey::parse(target).ok_or(RouterError::TargetUnknown)?;
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.cmd_tx
            .send(Command::SendPrivate {
                content,
                target,
                id: id.clone(),
            })
            .await
            .map_err(|_| NodeError::Stopped)?;
        Ok(id)
    }

    /// Flip our favorite state for a peer. Returns the new `we_favored`.
    pub async fn toggle_favorite(&self, target: &str) -> Result<bool, NodeError> {
        let target = ConversationKey::parse(target).ok_or(RouterError::TargetUnknown)?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ToggleFavorite { target, reply })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Send a read receipt for a message the user has now seen.
    pub async fn mark_read(&self, target: &str, id: String) -> Result<(), NodeError> {
        let target = ConversationKey::parse(target).ok_or(RouterError::TargetUnknown)?;
        self.cmd_tx
            .send(Command::MarkRead { target, id })
            .await
            .map_err(|_| NodeError::Stopped)
    }

    /// Wipe keys, records, outboxes, and buffers.
    pub async fn panic_reset(&self) -> Result<(), NodeError> {
        self.cmd_tx
            .send(Command::PanicReset)
            .await
            .map_err(|_| NodeError::Stopped)
    }

    /// Broadcast LEAVE and stop the node loop.
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.cmd_tx
            .send(Command::Stop)
            .await
            .map_err(|_| NodeError::Stopped)
    }
}

struct NodeState {
    keystore: Keystore,
    local_id: PeerId,
    nickname: String,
    overlay_pub: Option<[u8; 32]>,

    handler: MessageHandler,
    sessions: SessionManager,
    peers: PeerManager,
    processor: PacketProcessor,
    graph: MeshGraph,
    link_map: LinkMap,
    router: MessageRouter,
    favorites: FavoritesStore,
    cache: StoreForwardCache,

    mesh: Arc<dyn MeshTransport>,
    overlay: Option<Arc<dyn OverlayTransport>>,
    overlay_reachable: bool,

    /// Drained sends awaiting the paced flush (10 msgs/s).
    drain_backlog: std::collections::VecDeque<(PeerId, crate::router::PendingSend)>,

    events_tx: EventTx,
    metrics: Arc<Metrics>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Start the node. Inbound transport traffic arrives on `link_rx` and
/// `overlay_rx`; the returned receiver carries UI events.
pub fn spawn_node(
    cfg: NodeConfig,
    mesh: Arc<dyn MeshTransport>,
    mut link_rx: mpsc::Receiver<LinkEvent>,
    overlay: Option<Arc<dyn OverlayTransport>>,
    overlay_rx: Option<mpsc::Receiver<OverlayEvent>>,
    metrics: Arc<Metrics>,
) -> Result<(NodeHandle, EventRx, tokio::task::JoinHandle<()>), NodeError> {
    let keystore = Keystore::open(&cfg.data_dir)?;
    let local_id = keystore.fresh_peer_id()?;

    let db = sled::open(std::path::Path::new(&cfg.data_dir).join("state"))
        .map_err(|_| NodeError::DbOpen)?;
    let favorites = FavoritesStore::open(&db)?;
    let cache = StoreForwardCache::open(&db, now_ms())?;

    let overlay_pub = cfg
        .overlay_pub_hex
        .as_deref()
        .and_then(|h| hex::decode(h).ok())
        .and_then(|b| b.try_into().ok());

    if let Some(addr) = cfg.metrics_addr.clone() {
        let _ = crate::monitoring::metrics::spawn_exporter(addr, metrics.clone());
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, events_rx) = mpsc::channel::<CoreEvent>(1024);

    let sessions = SessionManager::new(local_id, keystore.static_private_bytes());
    let handler = MessageHandler::new(local_id);
    let processor = PacketProcessor::new(cfg.relay_enabled);

    let mut state = NodeState {
        nickname: cfg.nickname.clone(),
        overlay_pub,
        handler,
        sessions,
        peers: PeerManager::new(),
        processor,
        graph: MeshGraph::new(),
        link_map: LinkMap::new(),
        router: MessageRouter::new(),
        favorites,
        cache,
        mesh,
        overlay,
        overlay_reachable: false,
        drain_backlog: std::collections::VecDeque::new(),
        events_tx,
        metrics,
        keystore,
        local_id,
    };

    // When no overlay transport is wired in, park the select arm on a
    // channel whose sender the task keeps alive (a closed channel would
    // spin the loop).
    let (idle_overlay_tx, idle_overlay_rx) = mpsc::channel::<OverlayEvent>(1);
    let mut overlay_rx = overlay_rx.unwrap_or(idle_overlay_rx);

    let join = tokio::spawn(async move {
        let _keep_overlay_arm_parked = idle_overlay_tx;
        state.mesh.start();
        if let Some(overlay) = &state.overlay {
            if let Some(pk) = &state.overlay_pub {
                overlay.subscribe(pk);
            }
        }
        state.broadcast_announce(AnnounceTrigger::MeshStart);
        info!(peer_id = %state.local_id, "mesh node started");

        let mut announce_tick = tokio::time::interval(Duration::from_secs(30));
        let mut drain_tick = tokio::time::interval(Duration::from_secs(1));
        let mut fast_tick = tokio::time::interval(Duration::from_secs(10));
        let mut slow_tick = tokio::time::interval(Duration::from_secs(60));
        announce_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        fast_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        slow_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Stop) | None => {
                            state.shutdown();
                            break;
                        }
                        Some(cmd) => state.handle_command(cmd),
                    }
                }
                maybe_link = link_rx.recv() => {
                    match maybe_link {
                        Some(ev) => state.handle_link_event(ev),
                        None => {
                            warn!("mesh transport channel closed; stopping");
                            state.shutdown();
                            break;
                        }
                    }
                }
                maybe_overlay = overlay_rx.recv() => {
                    if let Some(ev) = maybe_overlay {
                        state.handle_overlay_event(ev);
                    }
                }
                _ = announce_tick.tick() => {
                    state.broadcast_announce(AnnounceTrigger::Periodic);
                }
                _ = drain_tick.tick() => {
                    state.flush_drain_backlog();
                }
                _ = fast_tick.tick() => {
                    state.fast_maintenance();
                }
                _ = slow_tick.tick() => {
                    state.slow_maintenance();
                }
            }
        }
    });

    Ok((NodeHandle { cmd_tx }, events_rx, join))
}

impl NodeState {
    fn emit(&self, event: CoreEvent) {
        let _ = self.events_tx.try_send(event);
    }

    // ---------------------------------------------------------------
    // Outbound plumbing
    // ---------------------------------------------------------------

    fn send_packet_bytes(&self, bytes: &[u8], prefer: Option<&PeerId>) {
        if let Some(peer) = prefer {
            if let Some(link) = self.link_map.link_for_peer(peer) {
                if self.mesh.send_to(link, bytes) {
                    return;
                }
            }
        }
        self.mesh.broadcast(bytes);
    }

    fn send_packet(&mut self, packet: &Packet, prefer: Option<&PeerId>) {
        let encoded = match packet.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(err = %e, "dropping undecodable outbound packet");
                return;
            }
        };
        if encoded.len() > FRAGMENT_THRESHOLD {
            let mut fragment_id = [0u8; 8];
            if ring::rand::SecureRandom::fill(&ring::rand::SystemRandom::new(), &mut fragment_id)
                .is_err()
            {
                return;
            }
            match fragment::split(packet, fragment_id) {
                Ok(frags) => {
                    for frag in frags {
                        match self.sign_fragment(frag) {
                            Ok(bytes) => self.send_packet_bytes(&bytes, prefer),
                            Err(e) => warn!(err = %e, "fragment signing failed"),
                        }
                    }
                }
                Err(e) => warn!(err = %e, "fragmentation failed"),
            }
            return;
        }
        self.send_packet_bytes(&encoded, prefer);
    }

    fn sign_fragment(&self, mut frag: Packet) -> Result<Vec<u8>, HandlerError> {
        let canonical = frag.canonical_for_signing()?;
        frag.signature = Some(self.keystore.sign(&canonical)?);
        Ok(frag.encode()?)
    }

    fn broadcast_announce(&mut self, trigger: AnnounceTrigger) {
        let now = now_ms();
        if !self.peers.should_broadcast_announce(trigger, now) {
            return;
        }
        let gossip: Vec<PeerId> = self
            .peers
            .direct_peers()
            .into_iter()
            .take(GOSSIP_MAX_NEIGHBORS)
            .collect();
        match self
            .handler
            .build_announce(&self.keystore, &self.nickname, &gossip, None, now)
        {
            Ok(packet) => {
                self.send_packet(&packet, None);
                self.metrics.announces_total.inc();
            }
            Err(e) => warn!(err = %e, "announce build failed"),
        }
    }

    fn send_peer_directed_announce(&mut self, peer: PeerId) {
        if !self.peers.mark_announced_to(peer) {
            return;
        }
        let now = now_ms();
        match self
            .handler
            .build_announce(&self.keystore, &self.nickname, &[], Some(peer), now)
        {
            Ok(packet) => self.send_packet(&packet, Some(&peer)),
            Err(e) => warn!(err = %e, "peer announce build failed"),
        }
    }

    fn send_handshake(&mut self, peer: PeerId, bytes: Vec<u8>) {
        let now = now_ms();
        match self
            .handler
            .build_noise_handshake(&self.keystore, peer, bytes, now)
        {
            Ok(packet) => self.send_packet(&packet, Some(&peer)),
            Err(e) => warn!(err = %e, "handshake packet build failed"),
        }
    }

    /// Encrypt and send one noise record to an established peer.
    fn send_encrypted(&mut self, peer: PeerId, plaintext: &[u8]) -> Result<(), NodeError> {
        let ciphertext = self
            .sessions
            .encrypt(&peer, plaintext)
            .map_err(|_| RouterError::NoTransport)?;
        let now = now_ms();
        let route = match self
            .graph
            .plan_egress(self.local_id, peer, &self.peers.direct_peers(), now)
        {
            EgressPlan::SourceRoute { route, .. } => Some(route),
            _ => None,
        };
        let packet =
            self.handler
                .build_noise_encrypted(&self.keystore, peer, ciphertext, route, now)?;
        self.send_packet(&packet, Some(&peer));
        self.metrics.private_sent_total.inc();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetNickname(nickname) => {
                self.nickname = nickname;
                self.broadcast_announce(AnnounceTrigger::NicknameChange);
            }
            Command::SendPublic(content) => {
                match self
                    .handler
                    .build_public_message(&self.keystore, &content, now_ms())
                {
                    Ok(packet) => self.send_packet(&packet, None),
                    Err(e) => warn!(err = %e, "public message build failed"),
                }
            }
            Command::SendPrivate {
                content,
                target,
                id,
            } => {
                self.handle_send_private(&content, &target, &id);
            }
            Command::ToggleFavorite { target, reply } => {
                let _ = reply.send(self.handle_toggle_favorite(&target));
            }
            Command::MarkRead { target, id } => self.handle_mark_read(&target, &id),
            Command::PanicReset => self.handle_panic_reset(),
            Command::Stop => unreachable!("handled by the loop"),
        }
    }

    fn resolve_noise_pub(&self, target: &ConversationKey) -> Option<[u8; 32]> {
        match target {
            ConversationKey::NoiseKey(k) => Some(*k),
            ConversationKey::MeshPeer(p) => self.peers.get(p).and_then(|r| r.static_noise_pub),
            ConversationKey::Overlay(alias) => self
                .favorites
                .list()
                .ok()?
                .into_iter()
                .find(|r| {
                    r.relay_pub_bytes()
                        .map(|pk| ConversationKey::overlay_alias(&pk).to_string() == *alias)
                        .unwrap_or(false)
                })
                .and_then(|r| r.noise_pub_bytes()),
        }
    }

    fn reachability_for(&self, target: &ConversationKey) -> (Reachability, Option<[u8; 32]>) {
        // A rotated-away mesh ID resolves through the alias table first.
        let target = &ConversationKey::parse(&self.router.canonical_key(target))
            .unwrap_or_else(|| target.clone());
        let noise_pub = self.resolve_noise_pub(target);

        let mesh_peer = match target {
            ConversationKey::MeshPeer(p) => Some(*p),
            _ => noise_pub
                .map(|k| Fingerprint::of_static_key(&k))
                .and_then(|fp| self.peers.peer_for_fingerprint(&fp)),
        }
        .filter(|p| {
            // "Live on the mesh" means a bound link and a ready session.
            self.sessions.is_established(p) && self.link_map.link_for_peer(p).is_some()
        });

        let overlay_pub = noise_pub
            .and_then(|k| self.favorites.get(&k).ok().flatten())
            .filter(|r| r.is_mutual())
            .and_then(|r| r.relay_pub_bytes())
            .filter(|_| self.overlay_is_reachable());

        (
            Reachability {
                mesh_peer,
                overlay_pub,
            },
            noise_pub,
        )
    }

    fn overlay_is_reachable(&self) -> bool {
        self.overlay_reachable
            && self
                .overlay
                .as_ref()
                .map(|o| o.status().is_reachable())
                .unwrap_or(false)
    }

    fn handle_send_private(&mut self, content: &str, target: &ConversationKey, id: &str) {
        let now = now_ms();
        let (reach, noise_pub) = self.reachability_for(target);

        // Canonicalize on the stable key as soon as it is known.
        if let Some(k) = noise_pub {
            let canonical = ConversationKey::NoiseKey(k);
            if self.router.unify(target, &canonical) {
                self.emit(CoreEvent::ConversationMerged {
                    from: target.clone(),
                    into: canonical,
                });
            }
        }

        match self.router.send_private(target, content, id, reach, now) {
            RouteDecision::Duplicate => {}
            RouteDecision::Mesh(peer) => {
                match handler::private_message_plaintext(id, content) {
                    Ok(plaintext) => {
                        if self.send_encrypted(peer, &plaintext).is_err() {
                            // The session died under us; repark.
                            self.router.park(target, content, id, now);
                            self.park_private(target, content, id, noise_pub, now);
                        }
                    }
                    Err(e) => warn!(err = %e, "private payload build failed"),
                }
            }
            RouteDecision::Overlay(relay_pub) => {
                self.send_private_via_overlay(&relay_pub, id, content);
            }
            RouteDecision::Parked => {
                self.emit(CoreEvent::DeliveryChanged {
                    id: id.to_string(),
                    status: DeliveryStatus::Sending,
                });
                self.park_mirror_and_kick(target, content, id, noise_pub, now);
            }
        }
    }

    fn send_private_via_overlay(&mut self, relay_pub: &[u8; 32], id: &str, content: &str) {
        let Some(overlay) = self.overlay.clone() else {
            return;
        };
        match handler::private_message_plaintext(id, content) {
            Ok(record) => {
                overlay.send_gift_wrapped(relay_pub, &record);
                self.metrics.private_sent_total.inc();
            }
            Err(e) => warn!(err = %e, "overlay payload build failed"),
        }
    }

    /// Mirror a parked send into the durable cache when the recipient is a
    /// mutual favorite, and lazily kick off a session if the peer is on the
    /// mesh without one.
    fn park_mirror_and_kick(
        &mut self,
        target: &ConversationKey,
        content: &str,
        id: &str,
        noise_pub: Option<[u8; 32]>,
        now: u64,
    ) {
        self.park_private(target, content, id, noise_pub, now);

        // Lazy session creation on first private send.
        let mesh_peer = match target {
            ConversationKey::MeshPeer(p) => Some(*p),
            _ => noise_pub
                .map(|k| Fingerprint::of_static_key(&k))
                .and_then(|fp| self.peers.peer_for_fingerprint(&fp)),
        };
        if let Some(peer) = mesh_peer {
            if !self.sessions.is_established(&peer) && self.sessions.can_retry(&peer, now) {
                match self.sessions.initiate(peer, now) {
                    Ok(Some(bytes)) => self.send_handshake(peer, bytes),
                    Ok(None) => {}
                    Err(e) => debug!(err = %e, %peer, "session initiate failed"),
                }
                self.emit(CoreEvent::SessionChanged {
                    peer_id: peer,
                    state: self.sessions.state(&peer),
                });
            }
        }
    }

    fn park_private(
        &mut self,
        _target: &ConversationKey,
        content: &str,
        id: &str,
        noise_pub: Option<[u8; 32]>,
        now: u64,
    ) {
        let Some(k) = noise_pub else { return };
        let mutual = self
            .favorites
            .get(&k)
            .ok()
            .flatten()
            .map(|r| r.is_mutual())
            .unwrap_or(false);
        if !mutual {
            return;
        }
        let fp = Fingerprint::of_static_key(&k);
        match handler::private_message_plaintext(id, content) {
            Ok(record) => {
                if let Err(e) = self.cache.insert(fp, record, now) {
                    warn!(err = %e, "store-and-forward insert failed");
                }
            }
            Err(e) => warn!(err = %e, "cache payload build failed"),
        }
    }

    fn handle_toggle_favorite(&mut self, target: &ConversationKey) -> Result<bool, NodeError> {
        let noise_pub = self
            .resolve_noise_pub(target)
            .ok_or(RouterError::TargetUnknown)?;
        let nickname = self
            .peers
            .peer_for_fingerprint(&Fingerprint::of_static_key(&noise_pub))
            .and_then(|p| self.peers.get(&p).and_then(|r| r.nickname.clone()))
            .unwrap_or_default();

        // Storage failure here is fatal: toggle_favorite must be atomic.
        let record = self
            .favorites
            .toggle_we_favored(&noise_pub, &nickname, now_ms())?;
        self.emit(CoreEvent::FavoriteChanged {
            fingerprint: Fingerprint::of_static_key(&noise_pub),
            is_mutual: record.is_mutual(),
        });

        if let (Some(overlay), Some(relay)) = (&self.overlay, record.relay_pub_bytes()) {
            if record.we_favored {
                overlay.subscribe(&relay);
            } else {
                overlay.unsubscribe(&relay);
            }
        }

        // Tell the peer over the session, when one exists.
        let fp = Fingerprint::of_static_key(&noise_pub);
        if let Some(peer) = self.peers.peer_for_fingerprint(&fp) {
            if self.sessions.is_established(&peer) {
                let body = crate::core::protocol::tlv::encode_favorite_body(
                    record.we_favored,
                    self.overlay_pub.as_ref(),
                );
                let plaintext =
                    handler::control_plaintext(NoisePayloadType::FavoriteNotification, body);
                let _ = self.send_encrypted(peer, &plaintext);
            }
        }

        Ok(record.we_favored)
    }

    fn handle_mark_read(&mut self, target: &ConversationKey, id: &str) {
        let (reach, noise_pub) = self.reachability_for(target);
        let receipt =
            handler::control_plaintext(NoisePayloadType::ReadReceipt, id.as_bytes().to_vec());
        if let Some(peer) = reach.mesh_peer {
            let _ = self.send_encrypted(peer, &receipt);
            return;
        }
        if let (Some(overlay), Some(k)) = (self.overlay.clone(), noise_pub) {
            if let Ok(Some(record)) = self.favorites.get(&k) {
                if let Some(relay) = record.relay_pub_bytes() {
                    overlay.send_gift_wrapped(&relay, &receipt);
                }
            }
        }
    }

    fn handle_panic_reset(&mut self) {
        if let Err(e) = self.keystore.panic_reset() {
            warn!(err = %e, "panic reset: key wipe failed");
        }
        self.local_id = self
            .keystore
            .fresh_peer_id()
            .unwrap_or(PeerId::from_bytes([0; 8]));
        self.handler.set_local_id(self.local_id);
        self.sessions = SessionManager::new(self.local_id, self.keystore.static_private_bytes());
        self.peers.clear();
        self.processor.clear();
        self.graph.clear();
        self.link_map.clear();
        self.router.clear();
        self.drain_backlog.clear();
        if let Err(e) = self.favorites.clear() {
            warn!(err = %e, "panic reset: favorites clear failed");
        }
        if let Err(e) = self.cache.clear() {
            warn!(err = %e, "panic reset: cache clear failed");
        }
        self.emit(CoreEvent::AllCleared);
        info!(peer_id = %self.local_id, "panic reset complete");
        self.broadcast_announce(AnnounceTrigger::MeshStart);
    }

    fn shutdown(&mut self) {
        match self.handler.build_leave(&self.keystore, now_ms()) {
            Ok(packet) => self.send_packet(&packet, None),
            Err(e) => warn!(err = %e, "leave build failed"),
        }
        self.mesh.stop();
        info!("mesh node stopped");
    }

    // ---------------------------------------------------------------
    // Ingress
    // ---------------------------------------------------------------

    fn handle_link_event(&mut self, ev: LinkEvent) {
        match ev {
            LinkEvent::Packet { bytes, link } => self.handle_packet(&bytes, &link),
            LinkEvent::LinkUp(link) => {
                debug!(%link, "link up");
                self.broadcast_announce(AnnounceTrigger::NewDirectLink);
            }
            LinkEvent::LinkDown(link) => {
                if let Some(peer) = self.link_map.unbind_link(&link) {
                    self.peers.set_direct(peer, false);
                    debug!(%link, %peer, "link down");
                }
            }
        }
    }

    fn count_drop(&self, cause: &DropCause) {
        match cause {
            DropCause::Wire(_) => self.metrics.wire_drop_total.inc(),
            DropCause::Signature(_) => self.metrics.signature_drop_total.inc(),
            DropCause::Guard(DropReason::Duplicate) => self.metrics.dedup_drop_total.inc(),
            DropCause::Guard(DropReason::Replay) => self.metrics.replay_drop_total.inc(),
            DropCause::Guard(DropReason::RateLimited) => self.metrics.rate_limited_total.inc(),
        }
    }

    fn handle_packet(&mut self, bytes: &[u8], link: &LinkId) {
        let now = now_ms();

        // Our own traffic looping back through the mesh is noise; the
        // dedup window also covers it, but the cheap check comes first.
        if bytes.len() > 21 && bytes[14..22] == self.local_id.0 {
            self.metrics.dedup_drop_total.inc();
            return;
        }

        let inbound_peer = self.link_map.peer_for_link(link);
        let ingest = match self.processor.ingest(
            bytes,
            inbound_peer,
            &self.peers,
            &self.graph,
            self.local_id,
            now,
        ) {
            Ok(i) => i,
            Err(cause) => {
                self.count_drop(&cause);
                debug!(err = %cause, "packet dropped");
                return;
            }
        };

        self.metrics.relay_hops_total.inc_by(ingest.hops as u64);

        if let (relay, Some(relay_bytes)) = (&ingest.relay, &ingest.relay_bytes) {
            self.execute_relay(relay, relay_bytes);
        }

        let Some(packet) = ingest.packet else { return };

        // Any valid reception refreshes the sender.
        self.peers.update_last_seen(packet.sender_id, now);

        self.dispatch(packet, link, now);
    }

    fn execute_relay(&mut self, plan: &RelayPlan, bytes: &[u8]) {
        match plan {
            RelayPlan::None => {}
            RelayPlan::Flood { skip } => {
                let targets: Vec<(PeerId, LinkId)> = self
                    .link_map
                    .direct_peers()
                    .filter(|p| !skip.contains(*p))
                    .filter_map(|p| self.link_map.link_for_peer(p).map(|l| (*p, l.clone())))
                    .collect();
                for (_, link) in targets {
                    let _ = self.mesh.send_to(&link, bytes);
                }
                self.metrics.relay_flood_total.inc();
            }
            RelayPlan::NextHop { hop } => {
                let sent = self
                    .link_map
                    .link_for_peer(hop)
                    .map(|l| self.mesh.send_to(l, bytes))
                    .unwrap_or(false);
                if !sent {
                    // Route went stale mid-flight; degrade to flood.
                    self.mesh.broadcast(bytes);
                }
                self.metrics.relay_routed_total.inc();
            }
        }
    }

    fn dispatch(&mut self, packet: Packet, link: &LinkId, now: u64) {
        match packet.msg_type {
            MessageType::Announce => self.on_announce(packet, link, now),
            MessageType::Message => {
                let content = match String::from_utf8(packet.payload.clone()) {
                    Ok(c) => c,
                    Err(_) => {
                        self.metrics.wire_drop_total.inc();
                        return;
                    }
                };
                let nickname = self
                    .peers
                    .get(&packet.sender_id)
                    .and_then(|r| r.nickname.clone());
                self.emit(CoreEvent::PublicMessage {
                    from: packet.sender_id,
                    nickname,
                    content,
                    timestamp_ms: packet.timestamp_ms,
                });
            }
            MessageType::Leave => {
                let peer = packet.sender_id;
                self.peers.remove(&peer);
                self.graph.remove_peer(&peer);
                self.link_map.unbind_peer(&peer);
                self.sessions.invalidate(&peer);
                self.processor.forget_sender(&peer);
                self.emit(CoreEvent::PeerGone {
                    peer_id: peer,
                    graceful: true,
                });
            }
            MessageType::NoiseHandshake => self.on_noise_handshake(packet, now),
            MessageType::NoiseEncrypted => self.on_noise_encrypted(packet, now),
            MessageType::DeliveryAck => {
                if let Ok(id) = String::from_utf8(packet.payload.clone()) {
                    if let Some(status) = self.router.on_delivery_ack(&id) {
                        self.emit(CoreEvent::DeliveryChanged { id, status });
                    }
                }
            }
            MessageType::ReadReceipt => {
                if let Ok(id) = String::from_utf8(packet.payload.clone()) {
                    if let Some(status) = self.router.on_read_receipt(&id) {
                        self.emit(CoreEvent::DeliveryChanged { id, status });
                    }
                }
            }
            MessageType::FragmentStart
            | MessageType::FragmentContinue
            | MessageType::FragmentEnd => {
                // Fragments never surface here; the processor reassembles.
            }
        }
    }

    fn on_announce(&mut self, packet: Packet, link: &LinkId, now: u64) {
        let announce = match crate::core::protocol::tlv::AnnouncePayload::decode(&packet.payload) {
            Ok(a) => a,
            Err(e) => {
                debug!(err = %e, "bad announce TLV");
                self.metrics.wire_drop_total.inc();
                return;
            }
        };
        let peer = packet.sender_id;
        let outcome = self.peers.observe_announce(
            peer,
            &announce.nickname,
            announce.noise_public_key,
            announce.signing_public_key,
            packet.signature.is_some(),
            now,
        );

        if let Some(old) = outcome.rebound_from {
            // Rotation: sessions bound to the old ID are invalid, chats and
            // outboxes merge into the stable identity.
            self.sessions.invalidate(&old);
            self.link_map.rebind_peer(&old, peer);
            self.graph.remove_peer(&old);
            let stable = ConversationKey::NoiseKey(announce.noise_public_key);
            if self.router.unify(&ConversationKey::MeshPeer(old), &stable) {
                self.emit(CoreEvent::ConversationMerged {
                    from: ConversationKey::MeshPeer(old),
                    into: stable.clone(),
                });
            }
        }
        // The current mesh ID is always an alias of the stable key.
        self.router.unify(
            &ConversationKey::MeshPeer(peer),
            &ConversationKey::NoiseKey(announce.noise_public_key),
        );

        // Only a first-hand announce (full TTL, not relayed) binds the link
        // and marks the peer direct; relayed announces still feed identity
        // and gossip.
        if packet.ttl == crate::core::types::MAX_TTL {
            self.link_map.bind(link.clone(), peer);
            self.peers.set_direct(peer, true);
        }
        self.graph.update_gossip(peer, &announce.gossip, now);

        self.emit(CoreEvent::PeerSeen {
            peer_id: peer,
            nickname: Some(announce.nickname.clone()),
            fingerprint: Some(Fingerprint::of_static_key(&announce.noise_public_key)),
        });

        // Complete the identity exchange once per session.
        if packet.is_broadcast() {
            self.send_peer_directed_announce(peer);
        }

        // Pending traffic for this identity warrants a session now; the
        // manager coalesces the defensive double-initiate. If a session
        // survived a link outage, the reconnect itself is the drain trigger.
        let fp = Fingerprint::of_static_key(&announce.noise_public_key);
        let stable = ConversationKey::NoiseKey(announce.noise_public_key);
        let has_pending = self.router.outbox_depth(&stable) > 0 || self.cache.depth(&fp) > 0;
        if !has_pending {
            return;
        }
        if self.sessions.is_established(&peer) {
            self.drain_mesh_pending(peer, announce.noise_public_key);
        } else if self.sessions.can_retry(&peer, now) {
            match self.sessions.initiate(peer, now) {
                Ok(Some(bytes)) => self.send_handshake(peer, bytes),
                Ok(None) => {}
                Err(e) => debug!(err = %e, %peer, "announce-triggered initiate failed"),
            }
        }
    }

    fn on_noise_handshake(&mut self, packet: Packet, now: u64) {
        let peer = packet.sender_id;
        match self.sessions.process_handshake(peer, &packet.payload, now) {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    self.send_handshake(peer, reply);
                }
                if let Some(remote_static) = outcome.established {
                    self.on_session_established(peer, remote_static);
                }
            }
            Err(e) => {
                debug!(err = %e, %peer, "handshake failed");
                self.emit(CoreEvent::SessionChanged {
                    peer_id: peer,
                    state: self.sessions.state(&peer),
                });
            }
        }
    }

    fn on_session_established(&mut self, peer: PeerId, remote_static: [u8; 32]) {
        self.emit(CoreEvent::SessionChanged {
            peer_id: peer,
            state: SessionState::Established,
        });

        let stable = ConversationKey::NoiseKey(remote_static);
        if self.router.unify(&ConversationKey::MeshPeer(peer), &stable) {
            self.emit(CoreEvent::ConversationMerged {
                from: ConversationKey::MeshPeer(peer),
                into: stable.clone(),
            });
        }

        self.drain_mesh_pending(peer, remote_static);
    }

    /// Drain the outbox and, for mutual favorites, the durable cache, onto
    /// an established session.
    fn drain_mesh_pending(&mut self, peer: PeerId, remote_static: [u8; 32]) {
        let stable = ConversationKey::NoiseKey(remote_static);
        let mut pending = self.router.drain(&stable);
        let fp = Fingerprint::of_static_key(&remote_static);
        let mutual = self
            .favorites
            .get(&remote_static)
            .ok()
            .flatten()
            .map(|r| r.is_mutual())
            .unwrap_or(false);
        if mutual {
            let already: std::collections::HashSet<String> =
                pending.iter().map(|p| p.id.clone()).collect();
            for envelope in self.cache.drain(&fp) {
                // Cached envelopes hold the ready-made private record.
                if let Ok(action) = handler::parse_noise_plaintext(&envelope.packet) {
                    if let NoiseAction::Private { id, content } = action {
                        if !already.contains(&id) {
                            pending.push(crate::router::PendingSend {
                                id,
                                content,
                                enqueued_ms: envelope.inserted_at_ms,
                            });
                        }
                    }
                }
            }
        }
        pending.sort_by_key(|p| p.enqueued_ms);

        // Handed to the paced flusher so a deep queue cannot trip the
        // recipient's rate gate.
        self.drain_backlog
            .extend(pending.into_iter().map(|p| (peer, p)));
        self.flush_drain_backlog();
    }

    /// Send up to `CACHE_DRAIN_PER_SEC` backlog entries; the 1s tick calls
    /// this again for the remainder.
    fn flush_drain_backlog(&mut self) {
        for _ in 0..crate::core::types::CACHE_DRAIN_PER_SEC {
            let Some((peer, send)) = self.drain_backlog.pop_front() else {
                return;
            };
            if !self.sessions.is_established(&peer) {
                // Session died mid-drain; repark for the next trigger.
                let key = self
                    .sessions
                    .remote_static(&peer)
                    .map(ConversationKey::NoiseKey)
                    .unwrap_or(ConversationKey::MeshPeer(peer));
                self.router.park(&key, &send.content, &send.id, send.enqueued_ms);
                continue;
            }
            match handler::private_message_plaintext(&send.id, &send.content) {
                Ok(plaintext) => {
                    if let Err(e) = self.send_encrypted(peer, &plaintext) {
                        warn!(err = %e, %peer, "outbox drain send failed");
                        let key = ConversationKey::MeshPeer(peer);
                        self.router.park(&key, &send.content, &send.id, send.enqueued_ms);
                    }
                }
                Err(e) => warn!(err = %e, "outbox payload build failed"),
            }
        }
    }

    fn on_noise_encrypted(&mut self, packet: Packet, now: u64) {
        let peer = packet.sender_id;
        let plaintext = match self.sessions.decrypt(&peer, &packet.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(err = %e, %peer, "decrypt failed; restarting handshake");
                self.sessions.invalidate(&peer);
                if self.sessions.should_initiate(&peer) {
                    if let Ok(Some(bytes)) = self.sessions.initiate(peer, now) {
                        self.send_handshake(peer, bytes);
                    }
                }
                self.emit(CoreEvent::SessionChanged {
                    peer_id: peer,
                    state: self.sessions.state(&peer),
                });
                return;
            }
        };

        let remote_static = self
            .sessions
            .remote_static(&peer)
            .or_else(|| self.peers.get(&peer).and_then(|r| r.static_noise_pub));
        let action = match handler::parse_noise_plaintext(&plaintext) {
            Ok(a) => a,
            Err(e) => {
                debug!(err = %e, %peer, "bad noise record");
                return;
            }
        };
        self.apply_noise_action(action, peer, remote_static, TransportKind::Mesh, now);
    }

    fn apply_noise_action(
        &mut self,
        action: NoiseAction,
        peer: PeerId,
        remote_static: Option<[u8; 32]>,
        via: TransportKind,
        now: u64,
    ) {
        let conversation = remote_static
            .map(ConversationKey::NoiseKey)
            .unwrap_or(ConversationKey::MeshPeer(peer));

        match action {
            NoiseAction::Private { id, content } => {
                if !self.router.accept_incoming(&conversation, &id) {
                    return; // at-most-once
                }
                self.metrics.private_received_total.inc();
                self.emit(CoreEvent::PrivateMessage {
                    conversation,
                    id: id.clone(),
                    content,
                    via,
                    timestamp_ms: now,
                });
                // Acknowledge receipt on the same path.
                let ack =
                    handler::control_plaintext(NoisePayloadType::DeliveryAck, id.into_bytes());
                match via {
                    TransportKind::Mesh => {
                        let _ = self.send_encrypted(peer, &ack);
                    }
                    TransportKind::Overlay => {
                        if let (Some(overlay), Some(k)) = (self.overlay.clone(), remote_static) {
                            if let Ok(Some(r)) = self.favorites.get(&k) {
                                if let Some(relay) = r.relay_pub_bytes() {
                                    overlay.send_gift_wrapped(&relay, &ack);
                                }
                            }
                        }
                    }
                }
            }
            NoiseAction::DeliveryAck { id } => {
                if let Some(status) = self.router.on_delivery_ack(&id) {
                    self.emit(CoreEvent::DeliveryChanged { id, status });
                }
            }
            NoiseAction::ReadReceipt { id } => {
                if let Some(status) = self.router.on_read_receipt(&id) {
                    self.emit(CoreEvent::DeliveryChanged { id, status });
                }
            }
            NoiseAction::Favorite {
                favored,
                overlay_pub,
            } => {
                let Some(k) = remote_static else { return };
                let nickname = self
                    .peers
                    .get(&peer)
                    .and_then(|r| r.nickname.clone())
                    .unwrap_or_default();
                match self
                    .favorites
                    .set_they_favored(&k, &nickname, favored, overlay_pub, now)
                {
                    Ok(record) => {
                        self.emit(CoreEvent::FavoriteChanged {
                            fingerprint: Fingerprint::of_static_key(&k),
                            is_mutual: record.is_mutual(),
                        });
                        // A newly learned overlay key may unlock parked sends.
                        if overlay_pub.is_some() {
                            self.drain_via_overlay(&k);
                        }
                    }
                    Err(e) => warn!(err = %e, "favorite update failed"),
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Overlay
    // ---------------------------------------------------------------

    fn handle_overlay_event(&mut self, ev: OverlayEvent) {
        match ev {
            OverlayEvent::Reachable(up) => {
                self.overlay_reachable = up;
                if up {
                    self.drain_all_via_overlay();
                }
            }
            OverlayEvent::GiftWrapped { from, inner } => {
                let now = now_ms();
                // Map the overlay sender back to a stable identity.
                let record = self
                    .favorites
                    .list()
                    .ok()
                    .and_then(|rs| rs.into_iter().find(|r| r.relay_pub_bytes() == Some(from)));
                let remote_static = record.as_ref().and_then(|r| r.noise_pub_bytes());
                let peer = remote_static
                    .map(|k| Fingerprint::of_static_key(&k))
                    .and_then(|fp| self.peers.peer_for_fingerprint(&fp))
                    .unwrap_or(PeerId::BROADCAST);

                match handler::parse_noise_plaintext(&inner) {
                    Ok(action) => self.apply_noise_action(
                        action,
                        peer,
                        remote_static,
                        TransportKind::Overlay,
                        now,
                    ),
                    Err(e) => debug!(err = %e, "bad overlay record"),
                }
            }
        }
    }

    fn drain_via_overlay(&mut self, noise_pub: &[u8; 32]) {
        if !self.overlay_is_reachable() {
            return;
        }
        let Some(relay) = self
            .favorites
            .get(noise_pub)
            .ok()
            .flatten()
            .filter(|r| r.is_mutual())
            .and_then(|r| r.relay_pub_bytes())
        else {
            return;
        };
        let pending = self.router.drain(&ConversationKey::NoiseKey(*noise_pub));
        for send in pending {
            self.send_private_via_overlay(&relay, &send.id, &send.content);
        }
    }

    fn drain_all_via_overlay(&mut self) {
        let reachable = match self.favorites.overlay_reachable() {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "favorites scan failed");
                return;
            }
        };
        for record in reachable {
            if let Some(k) = record.noise_pub_bytes() {
                self.drain_via_overlay(&k);
            }
        }
    }

    // ---------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------

    fn fast_maintenance(&mut self) {
        let now = now_ms();
        let expired = self.processor.sweep_fragments(now);
        if expired > 0 {
            self.metrics.fragments_expired_total.inc_by(expired as u64);
        }
        for peer in self.sessions.sweep(now) {
            self.emit(CoreEvent::SessionChanged {
                peer_id: peer,
                state: SessionState::Failed,
            });
        }
    }

    fn slow_maintenance(&mut self) {
        let now = now_ms();
        self.graph.sweep(now);
        self.cache.sweep(now);

        for id in self.router.sweep(now) {
            self.emit(CoreEvent::DeliveryChanged {
                id,
                status: DeliveryStatus::Failed,
            });
        }

        for peer in self.peers.prune_stale(now) {
            self.sessions.invalidate(&peer);
            self.link_map.unbind_peer(&peer);
            self.graph.remove_peer(&peer);
            self.processor.forget_sender(&peer);
            self.emit(CoreEvent::PeerGone {
                peer_id: peer,
                graceful: false,
            });
        }

        // Rekey aged sessions; the tie-break winner starts the handshake,
        // a volume overrun forces it from either side.
        for peer in self.sessions.established_peers() {
            if self.sessions.needs_rekey(&peer, now) && self.sessions.should_initiate(&peer) {
                match self.sessions.begin_rekey(peer, now) {
                    Ok(Some(bytes)) => self.send_handshake(peer, bytes),
                    Ok(None) => {}
                    Err(e) => debug!(err = %e, %peer, "rekey initiate failed"),
                }
            }
        }

        // Retry failed handshakes that still have traffic waiting.
        let retriable: Vec<PeerId> = self
            .peers
            .direct_peers()
            .into_iter()
            .filter(|p| {
                !self.sessions.is_established(p)
                    && self.sessions.can_retry(p, now)
                    && self
                        .peers
                        .get(p)
                        .and_then(|r| r.static_noise_pub)
                        .map(|k| {
                            self.router
                                .outbox_depth(&ConversationKey::NoiseKey(k))
                                > 0
                        })
                        .unwrap_or(false)
            })
            .collect();
        for peer in retriable {
            match self.sessions.initiate(peer, now) {
                Ok(Some(bytes)) => self.send_handshake(peer, bytes),
                Ok(None) => {}
                Err(e) => debug!(err = %e, %peer, "retry initiate failed"),
            }
        }

        // Gauges.
        self.metrics.peers.set(self.peers.len() as i64);
        self.metrics
            .sessions_established
            .set(self.sessions.established_peers().len() as i64);
        self.metrics
            .store_forward_depth
            .set(self.cache.total_depth() as i64);
        self.metrics
            .outbox_depth
            .set(self.router.total_parked() as i64);
    }
}
