// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Persistence: favorite relationships and the store-and-forward cache.

pub mod favorites;
pub mod forward;

use thiserror::Error;

/// Storage errors. Logged, never fatal for the protocol; only
/// `toggle_favorite` treats them as fatal because it must be atomic.
#[derive(Debug, Error)]
pub enum StoreError {
    /// sled failure.
    #[error("db")]
    Db,
    /// Value encode/decode failure.
    #[error("codec")]
    Codec,
}
