// File:    crypto.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: One-time pad combination and digest helpers used by the OTP processor and key store.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Pad combination primitives.
//!
//! Encoding and decoding are the same operation: the payload is XOR-ed in
//! place with the pad bytes at the same offset of the image cluster.

use sha2::{Digest, Sha256};

use crate::error::FramingError;

/// XORs `data` in place with the first `data.len()` bytes of `pad`.
///
/// The pad may be longer than the data; it must not be shorter.
pub fn xor_in_place(data: &mut [u8], pad: &[u8]) -> Result<(), FramingError> {
    if pad.len() < data.len() {
        return Err(FramingError::TooShort {
            len: pad.len(),
            min: data.len(),
        });
    }
    data.iter_mut().zip(pad).for_each(|(d, p)| *d ^= p);
    Ok(())
}

/// SHA-256 digest of the concatenated parts.
#[must_use]
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Lowercase hex rendering of a digest, for logs and fingerprints.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
