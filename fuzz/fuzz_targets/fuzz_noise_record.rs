// Copyright (c) 2026 Embermesh
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Padded or not, a decrypted record must parse without panicking.
    let _ = embermesh::mesh::handler::parse_noise_plaintext(data);
    let _ = embermesh::core::protocol::codec::unpad(data);
});
