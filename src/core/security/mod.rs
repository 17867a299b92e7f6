// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Identity key material and signature verification.

pub mod keystore;
