// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Peer-ID rotation: the fingerprint survives, sessions rebind, and
//! messages addressed to either ID land in one conversation.
//!
//! The rotating peer is driven by hand from the test, using the same
//! protocol primitives a node uses, so the rotation instant is exact.

mod common;

use common::{start_node, wait_for, MeshHub};
use embermesh::core::events::CoreEvent;
use embermesh::core::protocol::packet::Packet;
use embermesh::core::security::keystore::Keystore;
use embermesh::core::session::SessionManager;
use embermesh::core::types::{Fingerprint, MessageType, NoisePayloadType, PeerId, TransportKind};
use embermesh::mesh::handler::{
    control_plaintext, parse_noise_plaintext, private_message_plaintext, MessageHandler,
    NoiseAction,
};
use embermesh::mesh::transport::{LinkEvent, MeshTransport};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn next_of_type(rx: &mut mpsc::Receiver<LinkEvent>, ty: MessageType) -> Packet {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let LinkEvent::Packet { bytes, .. } =
                rx.recv().await.expect("link channel open")
            {
                if let Ok(p) = Packet::decode(&bytes) {
                    if p.msg_type == ty {
                        return p;
                    }
                }
            }
        }
    })
    .await
    .expect("timed out waiting for packet type")
}

/// A peer the test drives by hand with the library's own primitives.
struct ScriptedPeer {
    keystore: Keystore,
    handler: MessageHandler,
    sessions: SessionManager,
    _dir: tempfile::TempDir,
}

impl ScriptedPeer {
    fn new(id: PeerId) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = Keystore::open(dir.path().to_str().unwrap()).expect("keystore");
        let sessions = SessionManager::new(id, keystore.static_private_bytes());
        Self {
            keystore,
            handler: MessageHandler::new(id),
            sessions,
            _dir: dir,
        }
    }

    fn rotate(&mut self, new_id: PeerId, forget: &PeerId) {
        self.handler.set_local_id(new_id);
        self.sessions.set_local_id(new_id);
        self.sessions.invalidate(forget);
    }

    fn announce_bytes(&self, nickname: &str) -> Vec<u8> {
        self.handler
            .build_announce(&self.keystore, nickname, &[], None, now_ms())
            .expect("announce")
            .encode()
            .expect("encode")
    }

    /// Answer handshake packets until a session establishes; returns the
    /// remote peer it established with.
    async fn serve_handshake(
        &mut self,
        rx: &mut mpsc::Receiver<LinkEvent>,
        transport: &dyn MeshTransport,
    ) -> PeerId {
        loop {
            let packet = next_of_type(rx, MessageType::NoiseHandshake).await;
            let outcome = self
                .sessions
                .process_handshake(packet.sender_id, &packet.payload, now_ms())
                .expect("handshake step");
            if let Some(reply) = outcome.reply {
                let wire = self
                    .handler
                    .build_noise_handshake(&self.keystore, packet.sender_id, reply, now_ms())
                    .expect("wrap handshake")
                    .encode()
                    .expect("encode");
                transport.send_to(&"a".to_string(), &wire);
            }
            if outcome.established.is_some() {
                return packet.sender_id;
            }
        }
    }

    /// Receive one private message and acknowledge it.
    async fn recv_private(
        &mut self,
        rx: &mut mpsc::Receiver<LinkEvent>,
        transport: &dyn MeshTransport,
    ) -> (String, String) {
        let packet = next_of_type(rx, MessageType::NoiseEncrypted).await;
        let plaintext = self
            .sessions
            .decrypt(&packet.sender_id, &packet.payload)
            .expect("decrypt");
        let action = parse_noise_plaintext(&plaintext).expect("record");
        let NoiseAction::Private { id, content } = action else {
            panic!("expected private message, got {action:?}");
        };

        let ack = control_plaintext(NoisePayloadType::DeliveryAck, id.clone().into_bytes());
        let ct = self
            .sessions
            .encrypt(&packet.sender_id, &ack)
            .expect("encrypt ack");
        let wire = self
            .handler
            .build_noise_encrypted(&self.keystore, packet.sender_id, ct, None, now_ms())
            .expect("wrap ack")
            .encode()
            .expect("encode");
        transport.send_to(&"a".to_string(), &wire);

        (id, content)
    }
}

#[tokio::test]
async fn rotated_peer_keeps_identity_and_conversation() {
    let hub = MeshHub::new();
    let mut a = start_node(&hub, "a", "alice", None);

    let (b_transport, mut b_rx) = MeshHub::attach(&hub, "b");
    hub.connect("a", "b");

    let b1 = PeerId::from_bytes([0xBB, 0, 0, 0, 0, 0, 0, 0x01]);
    let b2 = PeerId::from_bytes([0xBB, 0, 0, 0, 0, 0, 0, 0x02]);
    let mut bob = ScriptedPeer::new(b1);
    let expected_fp = Fingerprint::of_static_key(&bob.keystore.static_public());

    b_transport.broadcast(&bob.announce_bytes("bob"));

    let fp1 = match wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::PeerSeen { peer_id, .. } if *peer_id == b1)
    })
    .await
    {
        CoreEvent::PeerSeen { fingerprint, .. } => fingerprint.expect("fingerprint bound"),
        _ => unreachable!(),
    };
    assert_eq!(fp1, expected_fp);

    // First message establishes a session with b1.
    a.handle
        .send_private(
            "hello b1".to_string(),
            &b1.to_string(),
            Some("m1".to_string()),
        )
        .await
        .expect("send");
    let alice_id = bob.serve_handshake(&mut b_rx, b_transport.as_ref()).await;
    let (id, content) = bob.recv_private(&mut b_rx, b_transport.as_ref()).await;
    assert_eq!((id.as_str(), content.as_str()), ("m1", "hello b1"));

    // Rotation: same keys, fresh peer ID.
    bob.rotate(b2, &alice_id);
    b_transport.broadcast(&bob.announce_bytes("bob"));

    let fp2 = match wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::PeerSeen { peer_id, .. } if *peer_id == b2)
    })
    .await
    {
        CoreEvent::PeerSeen { fingerprint, .. } => fingerprint.expect("fingerprint bound"),
        _ => unreachable!(),
    };
    assert_eq!(fp2, expected_fp);

    // Addressed to the stable key: a fresh session with b2 carries it.
    let stable = hex::encode(bob.keystore.static_public());
    a.handle
        .send_private(
            "after rotation".to_string(),
            &stable,
            Some("m2".to_string()),
        )
        .await
        .expect("send");
    bob.serve_handshake(&mut b_rx, b_transport.as_ref()).await;
    let (id, content) = bob.recv_private(&mut b_rx, b_transport.as_ref()).await;
    assert_eq!((id.as_str(), content.as_str()), ("m2", "after rotation"));

    // Addressed to the retired mesh ID: same conversation, same session.
    a.handle
        .send_private(
            "old alias".to_string(),
            &b1.to_string(),
            Some("m3".to_string()),
        )
        .await
        .expect("send");
    let (id, content) = bob.recv_private(&mut b_rx, b_transport.as_ref()).await;
    assert_eq!((id.as_str(), content.as_str()), ("m3", "old alias"));

    wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::DeliveryChanged { id, .. } if id == "m3")
    })
    .await;
}

#[tokio::test]
async fn private_message_event_carries_stable_conversation() {
    let hub = MeshHub::new();
    let mut a = start_node(&hub, "a", "alice", None);
    let (b_transport, mut b_rx) = MeshHub::attach(&hub, "b");
    hub.connect("a", "b");

    let b1 = PeerId::from_bytes([0xCC; 8]);
    let mut bob = ScriptedPeer::new(b1);
    b_transport.broadcast(&bob.announce_bytes("bob"));
    wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::PeerSeen { peer_id, .. } if *peer_id == b1)
    })
    .await;

    // Alice opens the session by sending first.
    a.handle
        .send_private("ping".to_string(), &b1.to_string(), Some("p1".to_string()))
        .await
        .expect("send");
    let alice_id = bob.serve_handshake(&mut b_rx, b_transport.as_ref()).await;
    bob.recv_private(&mut b_rx, b_transport.as_ref()).await;

    // Bob replies; Alice's event is keyed by Bob's stable noise key.
    let plaintext = private_message_plaintext("p2", "pong").unwrap();
    let ct = bob.sessions.encrypt(&alice_id, &plaintext).expect("encrypt");
    let wire = bob
        .handler
        .build_noise_encrypted(&bob.keystore, alice_id, ct, None, now_ms())
        .expect("wrap")
        .encode()
        .expect("encode");
    b_transport.send_to(&"a".to_string(), &wire);

    let ev = wait_for(&mut a.events, |ev| {
        matches!(ev, CoreEvent::PrivateMessage { id, .. } if id == "p2")
    })
    .await;
    match ev {
        CoreEvent::PrivateMessage {
            conversation,
            content,
            via,
            ..
        } => {
            assert_eq!(content, "pong");
            assert_eq!(via, TransportKind::Mesh);
            assert_eq!(
                conversation.to_string(),
                hex::encode(bob.keystore.static_public())
            );
        }
        _ => unreachable!(),
    }
}
