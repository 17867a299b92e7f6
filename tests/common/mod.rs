// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]
#![allow(dead_code)]

//! In-memory transport fabric for multi-node integration tests: a mesh hub
//! with configurable adjacency and a relay hub for the overlay path.

use embermesh::core::events::{CoreEvent, EventRx};
use embermesh::core::types::NodeConfig;
use embermesh::mesh::transport::{
    LinkEvent, LinkId, MeshTransport, OverlayEvent, OverlayStatus, OverlayTransport,
};
use embermesh::monitoring::metrics::Metrics;
use embermesh::node::{spawn_node, NodeHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct MeshHubInner {
    links: HashMap<LinkId, mpsc::Sender<LinkEvent>>,
    adjacency: HashMap<LinkId, HashSet<LinkId>>,
}

/// A switchboard connecting node transports along explicit adjacencies.
#[derive(Default)]
pub struct MeshHub {
    inner: Mutex<MeshHubInner>,
}

impl MeshHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node under `link` and return its transport + inbound feed.
    pub fn attach(hub: &Arc<Self>, link: &str) -> (Arc<HubTransport>, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        hub.inner
            .lock()
            .expect("hub lock")
            .links
            .insert(link.to_string(), tx);
        (
            Arc::new(HubTransport {
                hub: hub.clone(),
                link: link.to_string(),
            }),
            rx,
        )
    }

    /// Bring up a bidirectional link between two nodes.
    pub fn connect(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner
            .adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        inner
            .adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
        if let Some(tx) = inner.links.get(a) {
            let _ = tx.try_send(LinkEvent::LinkUp(b.to_string()));
        }
        if let Some(tx) = inner.links.get(b) {
            let _ = tx.try_send(LinkEvent::LinkUp(a.to_string()));
        }
    }

    /// Tear a link down.
    pub fn disconnect(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().expect("hub lock");
        if let Some(set) = inner.adjacency.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = inner.adjacency.get_mut(b) {
            set.remove(a);
        }
        if let Some(tx) = inner.links.get(a) {
            let _ = tx.try_send(LinkEvent::LinkDown(b.to_string()));
        }
        if let Some(tx) = inner.links.get(b) {
            let _ = tx.try_send(LinkEvent::LinkDown(a.to_string()));
        }
    }

    fn deliver(&self, from: &str, to: Option<&str>, bytes: &[u8]) -> bool {
        let inner = self.inner.lock().expect("hub lock");
        let neighbors = match inner.adjacency.get(from) {
            Some(n) => n,
            None => return false,
        };
        let mut delivered = false;
        for target in neighbors {
            if let Some(wanted) = to {
                if target != wanted {
                    continue;
                }
            }
            if let Some(tx) = inner.links.get(target) {
                delivered |= tx
                    .try_send(LinkEvent::Packet {
                        bytes: bytes.to_vec(),
                        link: from.to_string(),
                    })
                    .is_ok();
            }
        }
        delivered
    }
}

/// One node's view of the hub.
pub struct HubTransport {
    hub: Arc<MeshHub>,
    link: LinkId,
}

impl MeshTransport for HubTransport {
    fn broadcast(&self, bytes: &[u8]) {
        let _ = self.hub.deliver(&self.link, None, bytes);
    }

    fn send_to(&self, link: &LinkId, bytes: &[u8]) -> bool {
        self.hub.deliver(&self.link, Some(link), bytes)
    }

    fn local_link_id(&self) -> LinkId {
        self.link.clone()
    }

    fn start(&self) {}
    fn stop(&self) {}
}

#[derive(Default)]
struct RelayHubInner {
    subs: HashMap<String, mpsc::Sender<OverlayEvent>>,
    reachable: bool,
}

/// Overlay relay fabric: routes gift-wrapped envelopes by recipient key.
#[derive(Default)]
pub struct RelayHub {
    inner: Mutex<RelayHubInner>,
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node under its overlay public key.
    pub fn attach(
        hub: &Arc<Self>,
        local_pub: [u8; 32],
    ) -> (Arc<RelayTransport>, mpsc::Receiver<OverlayEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        hub.inner
            .lock()
            .expect("relay lock")
            .subs
            .insert(hex::encode(local_pub), tx);
        (
            Arc::new(RelayTransport {
                hub: hub.clone(),
                local_pub,
            }),
            rx,
        )
    }

    /// Flip overlay reachability and notify every node.
    pub fn set_reachable(&self, up: bool) {
        let mut inner = self.inner.lock().expect("relay lock");
        inner.reachable = up;
        for tx in inner.subs.values() {
            let _ = tx.try_send(OverlayEvent::Reachable(up));
        }
    }
}

/// One node's overlay driver.
pub struct RelayTransport {
    hub: Arc<RelayHub>,
    local_pub: [u8; 32],
}

impl OverlayTransport for RelayTransport {
    fn send_gift_wrapped(&self, to_pub: &[u8; 32], inner_bytes: &[u8]) {
        let inner = self.hub.inner.lock().expect("relay lock");
        if !inner.reachable {
            return;
        }
        if let Some(tx) = inner.subs.get(&hex::encode(to_pub)) {
            let _ = tx.try_send(OverlayEvent::GiftWrapped {
                from: self.local_pub,
                inner: inner_bytes.to_vec(),
            });
        }
    }

    fn subscribe(&self, _pubkey: &[u8; 32]) {}
    fn unsubscribe(&self, _pubkey: &[u8; 32]) {}

    fn status(&self) -> OverlayStatus {
        let reachable = self.hub.inner.lock().expect("relay lock").reachable;
        OverlayStatus {
            running: reachable,
            bootstrap_percent: if reachable { 100 } else { 0 },
            last_error: None,
        }
    }
}

/// A running node plus its event stream and working directory.
pub struct TestNode {
    pub handle: NodeHandle,
    pub events: EventRx,
    pub dir: tempfile::TempDir,
}

/// Start a node attached to the mesh hub (and optionally the relay hub).
pub fn start_node(
    hub: &Arc<MeshHub>,
    link: &str,
    nickname: &str,
    relay: Option<(&Arc<RelayHub>, [u8; 32])>,
) -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");
    start_node_at(hub, link, nickname, relay, dir)
}

/// Start a node over an existing data directory (pre-seeded keys/stores).
pub fn start_node_at(
    hub: &Arc<MeshHub>,
    link: &str,
    nickname: &str,
    relay: Option<(&Arc<RelayHub>, [u8; 32])>,
    dir: tempfile::TempDir,
) -> TestNode {
    let mut cfg = NodeConfig {
        nickname: nickname.to_string(),
        data_dir: dir.path().to_str().expect("utf8 path").to_string(),
        ..NodeConfig::default()
    };

    let (mesh, link_rx) = MeshHub::attach(hub, link);
    let (overlay, overlay_rx) = match relay {
        Some((relay_hub, local_pub)) => {
            cfg.overlay_pub_hex = Some(hex::encode(local_pub));
            let (t, rx) = RelayHub::attach(relay_hub, local_pub);
            (
                Some(t as Arc<dyn OverlayTransport>),
                Some(rx),
            )
        }
        None => (None, None),
    };

    let metrics = Arc::new(Metrics::new().expect("metrics"));
    let (handle, events, _join) = spawn_node(cfg, mesh, link_rx, overlay, overlay_rx, metrics)
        .expect("spawn node");

    TestNode {
        handle,
        events,
        dir,
    }
}

/// Wait (up to 10s) for an event matching the predicate, discarding others.
pub async fn wait_for<F>(events: &mut EventRx, mut pred: F) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let ev = events.recv().await.expect("event channel open");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert that no event matching the predicate arrives within `window`.
pub async fn assert_quiet<F>(events: &mut EventRx, window: Duration, mut pred: F)
where
    F: FnMut(&CoreEvent) -> bool,
{
    let outcome = tokio::time::timeout(window, async {
        loop {
            match events.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(outcome.is_err(), "unexpected event: {:?}", outcome.ok());
}
