// Copyright (c) 2026 Embermesh
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // TLV parsers must be robust against arbitrary bytes.
    let _ = embermesh::core::protocol::tlv::AnnouncePayload::decode(data);
    let _ = embermesh::core::protocol::tlv::PrivateMessagePayload::decode(data);
});
