// Copyright (c) 2026 Embermesh
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decode must never panic, and anything it accepts must re-encode.
    if let Ok(packet) = embermesh::core::protocol::packet::Packet::decode(data) {
        let _ = packet.encode();
        let _ = packet.canonical_for_signing();
    }
    let _ = embermesh::core::protocol::packet::Packet::canonical_of_wire(data);
});
