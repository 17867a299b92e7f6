// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

//! Payload compression and Noise-layer padding.
//!
//! Compression is LZ4 block format with a length prefix, applied only when
//! the payload is at least `COMPRESS_THRESHOLD` bytes and shrinks by 10% or
//! more. Padding hides message length classes: bodies below `PAD_MAX` are
//! padded PKCS-style to the next 256-byte boundary (capped at a 255-byte
//! run); larger bodies travel unpadded.

use crate::core::protocol::packet::WireError;
use crate::core::types::{COMPRESS_THRESHOLD, PAD_BLOCK, PAD_MAX};

/// Compress `payload` when it is large enough and the codec actually helps.
/// Returns `None` when the payload should travel uncompressed.
pub fn compress_if_worthwhile(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < COMPRESS_THRESHOLD {
        return None;
    }
    let compressed = lz4_flex::block::compress_prepend_size(payload);
    // Require at least a 10% saving.
    if compressed.len().saturating_mul(10) <= payload.len().saturating_mul(9) {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress a wire payload, enforcing `max` on the output size.
pub fn decompress(bytes: &[u8], max: usize) -> Result<Vec<u8>, WireError> {
    let out =
        lz4_flex::block::decompress_size_prepended(bytes).map_err(|_| WireError::Compression)?;
    if out.len() > max {
        return Err(WireError::PayloadTooLarge);
    }
    Ok(out)
}

/// Pad a body before Noise encryption. Every appended byte carries the
/// padding length, so `unpad` can validate the full run. Bodies at or above
/// `PAD_MAX` are left alone. Bodies sitting exactly on a block boundary get
/// a 255-byte run (one byte cannot express a full block).
pub fn pad(mut body: Vec<u8>) -> Vec<u8> {
    if body.len() >= PAD_MAX {
        return body;
    }
    let mut needed = PAD_BLOCK - (body.len() % PAD_BLOCK);
    if needed == PAD_BLOCK {
        needed = u8::MAX as usize;
    }
    let new_len = body.len() + needed;
    body.resize(new_len, needed as u8);
    body
}

/// Reverse of `pad`. Bodies that do not carry a valid PKCS-style run are
/// returned unchanged; transport authentication already guarantees
/// integrity, this only recovers the original length.
pub fn unpad(body: &[u8]) -> &[u8] {
    if body.is_empty() || body.len() > PAD_MAX {
        return body;
    }
    let n = body[body.len() - 1] as usize;
    if n == 0 || n > body.len() {
        return body;
    }
    if body[body.len() - n..].iter().any(|&b| b != n as u8) {
        return body;
    }
    &body[..body.len() - n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_not_compressed() {
        assert!(compress_if_worthwhile(&[0u8; 255]).is_none());
    }

    #[test]
    fn incompressible_payload_left_alone() {
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        assert!(compress_if_worthwhile(&data).is_none());
    }

    #[test]
    fn compression_roundtrip() {
        let data = vec![7u8; 1024];
        let c = compress_if_worthwhile(&data).unwrap();
        assert_eq!(decompress(&c, 65_000).unwrap(), data);
    }

    #[test]
    fn pad_roundtrips_all_length_classes() {
        for len in [0usize, 1, 255, 256, 300, 511, 512, 4000, 4095] {
            let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let padded = pad(body.clone());
            assert!(padded.len() > len, "len {len}");
            assert_eq!(unpad(&padded), body.as_slice(), "len {len}");
        }
    }

    #[test]
    fn pad_lands_on_block_boundary() {
        // Except on exact multiples, the padded size is the next 256 multiple.
        let padded = pad(vec![9u8; 300]);
        assert_eq!(padded.len(), 512);
        let padded = pad(vec![9u8; 100]);
        assert_eq!(padded.len(), 256);
    }

    #[test]
    fn oversized_body_unpadded() {
        let body: Vec<u8> = (0..PAD_MAX + 1).map(|i| (i % 249) as u8).collect();
        assert_eq!(pad(body.clone()), body);
        assert_eq!(unpad(&body), body.as_slice());
    }

    #[test]
    fn boundary_4096_travels_as_is() {
        let body: Vec<u8> = (0..PAD_MAX).map(|i| (i % 249) as u8).collect();
        assert_eq!(pad(body.clone()), body);
        assert_eq!(unpad(&body), body.as_slice());
    }
}
