// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Store-and-forward: messages queued for an offline mutual favorite are
//! delivered in order when the favorite reconnects.

mod common;

use common::{start_node, wait_for, MeshHub};
use embermesh::core::events::CoreEvent;
use embermesh::core::types::TransportKind;

#[tokio::test]
async fn offline_mutual_favorite_gets_queue_in_order() {
    let hub = MeshHub::new();
    let mut a = start_node(&hub, "a", "alice", None);
    let mut b = start_node(&hub, "b", "bob", None);
    hub.connect("a", "b");

    let bob_id = match wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::PeerSeen { nickname: Some(n), .. } if n == "bob")
    })
    .await
    {
        CoreEvent::PeerSeen { peer_id, .. } => peer_id,
        _ => unreachable!(),
    };
    let alice_id = match wait_for(&mut b.events, |ev| {
        matches!(ev, CoreEvent::PeerSeen { nickname: Some(n), .. } if n == "alice")
    })
    .await
    {
        CoreEvent::PeerSeen { peer_id, .. } => peer_id,
        _ => unreachable!(),
    };

    // A first exchange brings the session up (favorite notifications need
    // an established session to travel).
    a.handle
        .send_private("hello".to_string(), &bob_id.to_string(), None)
        .await
        .expect("send");
    wait_for(&mut b.events, |ev| {
        matches!(ev, CoreEvent::PrivateMessage { content, .. } if content == "hello")
    })
    .await;

    // Favorite each other; both sides converge on a mutual relationship.
    a.handle
        .toggle_favorite(&bob_id.to_string())
        .await
        .expect("a favors b");
    wait_for(&mut b.events, |ev| {
        matches!(ev, CoreEvent::FavoriteChanged { .. })
    })
    .await;
    b.handle
        .toggle_favorite(&alice_id.to_string())
        .await
        .expect("b favors a");
    wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::FavoriteChanged { is_mutual: true, .. })
    })
    .await;
    wait_for(&mut b.events, |ev| {
        matches!(ev, CoreEvent::FavoriteChanged { is_mutual: true, .. })
    })
    .await;

    // Bob drops off the mesh; three messages queue up.
    hub.disconnect("a", "b");
    for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
        a.handle
            .send_private(
                format!("queued {i}"),
                &bob_id.to_string(),
                Some(id.to_string()),
            )
            .await
            .expect("send while offline");
    }

    // Bob returns; the queue drains in insertion order.
    hub.connect("a", "b");
    let mut got = Vec::new();
    while got.len() < 3 {
        let ev = wait_for(&mut b.events, |ev| {
            matches!(ev, CoreEvent::PrivateMessage { id, .. } if id.starts_with('m'))
        })
        .await;
        if let CoreEvent::PrivateMessage { id, via, .. } = ev {
            assert_eq!(via, TransportKind::Mesh);
            got.push(id);
        }
    }
    assert_eq!(got, vec!["m1", "m2", "m3"]);
}
