// Copyright (c) 2026 Embermesh
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use embermesh::core::protocol::fragment::Reassembler;
use embermesh::core::protocol::packet::Packet;
use embermesh::core::types::{MessageType, PeerId};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Hostile fragment payloads must not panic or blow up the buffer caps.
    let mut reassembler = Reassembler::new();
    for chunk in data.chunks(64) {
        let packet = Packet::new(
            MessageType::FragmentContinue,
            PeerId::from_bytes([1; 8]),
            None,
            0,
            chunk.to_vec(),
        );
        let _ = reassembler.ingest(&packet, 0);
    }
});
