// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Multi-hop flooding: relay-once, loop suppression, exactly-one delivery.

mod common;

use common::{assert_quiet, start_node, wait_for, MeshHub};
use embermesh::core::events::CoreEvent;
use embermesh::mesh::transport::{LinkEvent, MeshTransport};
use std::time::Duration;

/// A - C - B line: B hears A's broadcast exactly once, through C.
#[tokio::test]
async fn flood_reaches_two_hops_exactly_once() {
    let hub = MeshHub::new();
    let mut a = start_node(&hub, "a", "alice", None);
    let mut b = start_node(&hub, "b", "bob", None);
    let mut c = start_node(&hub, "c", "carol", None);
    hub.connect("a", "c");
    hub.connect("c", "b");

    // A's announce floods through C, so B learns alice without a link.
    wait_for(&mut b.events, |ev| {
        matches!(ev, CoreEvent::PeerSeen { nickname: Some(n), .. } if n == "alice")
    })
    .await;
    wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::PeerSeen { nickname: Some(n), .. } if n == "bob")
    })
    .await;

    a.handle
        .send_public("ripple".to_string())
        .await
        .expect("send public");

    // C and B each see it once.
    wait_for(&mut c.events, |ev| {
        matches!(ev, CoreEvent::PublicMessage { content, .. } if content == "ripple")
    })
    .await;
    wait_for(&mut b.events, |ev| {
        matches!(ev, CoreEvent::PublicMessage { content, .. } if content == "ripple")
    })
    .await;
    assert_quiet(&mut b.events, Duration::from_secs(2), |ev| {
        matches!(ev, CoreEvent::PublicMessage { content, .. } if content == "ripple")
    })
    .await;
}

/// A node that re-observes its own broadcast through a loop stays silent.
#[tokio::test]
async fn own_broadcast_looped_back_is_suppressed() {
    let hub = MeshHub::new();
    let mut a = start_node(&hub, "a", "alice", None);

    // A "mirror" echoes every byte it hears straight back at A.
    let (mirror, mut mirror_rx) = MeshHub::attach(&hub, "mirror");
    hub.connect("a", "mirror");
    tokio::spawn(async move {
        while let Some(ev) = mirror_rx.recv().await {
            if let LinkEvent::Packet { bytes, .. } = ev {
                mirror.send_to(&"a".to_string(), &bytes);
            }
        }
    });

    a.handle
        .send_public("echo?".to_string())
        .await
        .expect("send public");

    // The mirrored copy must not surface as a timeline event.
    assert_quiet(&mut a.events, Duration::from_secs(2), |ev| {
        matches!(ev, CoreEvent::PublicMessage { .. })
    })
    .await;
}
