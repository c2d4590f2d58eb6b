// Copyright 2025 Janek Bevendorff
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! WARC record digest verification.
//!
//! Digest headers have the form `<algorithm>:<value>`. The value is usually
//! Base32-encoded, but Base16 and Base64 values occur in the wild as well.

use std::io::Read;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
}

impl DigestAlgorithm {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Some(DigestAlgorithm::Sha1),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
        }
    }
}

/// Split a digest header value into algorithm and decoded digest bytes.
pub fn parse_digest(value: &str) -> Option<(DigestAlgorithm, Vec<u8>)> {
    let (label, encoded) = value.split_once(':')?;
    let algorithm = DigestAlgorithm::from_label(label)?;
    let encoded = encoded.trim();
    let len = algorithm.output_len();

    let decoded = if encoded.len() == len * 2 {
        hex::decode(encoded).ok()
    } else if encoded.trim_end_matches('=').len() == (len * 8).div_ceil(5) {
        decode_base32(encoded)
    } else {
        STANDARD
            .decode(encoded)
            .or_else(|_| STANDARD_NO_PAD.decode(encoded))
            .ok()
    }?;
    (decoded.len() == len).then_some((algorithm, decoded))
}

/// Hash `prefix` followed by everything `reader` yields and compare against a digest header value.
///
/// Unsupported or malformed digest values are reported as `false` without
/// reading from `reader`.
pub fn verify_digest<R: Read + ?Sized>(value: &str, prefix: &[u8], reader: &mut R) -> Result<bool> {
    let Some((algorithm, expected)) = parse_digest(value) else {
        debug!(value, "unsupported digest");
        return Ok(false);
    };
    let mut buf = [0u8; 16 * 1024];
    match algorithm {
        DigestAlgorithm::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(prefix);
            loop {
                let n = reader.read(&mut buf).map_err(Error::from)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hasher.finalize().as_slice() == expected.as_slice())
        }
    }
}

/// RFC 4648 Base32 (case-insensitive, optional padding).
fn decode_base32(encoded: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
    let mut acc = 0u64;
    let mut bits = 0u32;
    for c in encoded.trim_end_matches('=').bytes() {
        let value = match c.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | u64::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Some(out)
}
