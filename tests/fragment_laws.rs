// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Fragmentation laws: reassembly equals the pre-split packet, in any
//! arrival order, with duplicates along the way.

use embermesh::core::protocol::fragment::{split, Reassembler};
use embermesh::core::protocol::packet::Packet;
use embermesh::core::types::{MessageType, PeerId};
use proptest::prelude::*;

fn incompressible(len: usize, seed: u32) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(2654435761).wrapping_add(seed) >> 9) as u8)
        .collect()
}

prop_compose! {
    fn arb_big_packet()(
        len in 600usize..6000,
        seed in any::<u32>(),
        sender in any::<[u8; 8]>(),
        recipient in proptest::option::of(any::<[u8; 8]>()),
    ) -> Packet {
        Packet::new(
            MessageType::Message,
            PeerId::from_bytes(sender),
            recipient.map(PeerId::from_bytes),
            1_700_000_000_000,
            incompressible(len, seed),
        )
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_reassembly_is_identity(p in arb_big_packet(), id in any::<[u8; 8]>()) {
        let frags = split(&p, id).unwrap();
        let mut r = Reassembler::new();
        let mut out = None;
        for f in &frags {
            if let Some(done) = r.ingest(f, 0).unwrap() {
                out = Some(done);
            }
        }
        prop_assert_eq!(out.unwrap(), p);
    }

    #[test]
    fn prop_arrival_order_is_irrelevant(
        p in arb_big_packet(),
        id in any::<[u8; 8]>(),
        seed in any::<u64>(),
    ) {
        let mut frags = split(&p, id).unwrap();

        // Deterministic shuffle from the seed.
        let mut state = seed | 1;
        for i in (1..frags.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            frags.swap(i, j);
        }

        let mut r = Reassembler::new();
        let mut out = None;
        for f in &frags {
            if let Some(done) = r.ingest(f, 0).unwrap() {
                out = Some(done);
            }
        }
        prop_assert_eq!(out.unwrap(), p);
        prop_assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn prop_duplicates_change_nothing(p in arb_big_packet(), id in any::<[u8; 8]>()) {
        let frags = split(&p, id).unwrap();
        let mut r = Reassembler::new();
        let mut out = None;
        for f in &frags {
            // Deliver everything twice; the second copy must be inert.
            if let Some(done) = r.ingest(f, 0).unwrap() {
                out = Some(done);
            }
            let _ = r.ingest(f, 0);
        }
        prop_assert_eq!(out.unwrap(), p);
    }
}
