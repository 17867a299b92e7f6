// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Wire protocol: packet framing, padding/compression, TLV payloads,
//! fragmentation.

pub mod codec;
pub mod fragment;
pub mod packet;
pub mod tlv;
