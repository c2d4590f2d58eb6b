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

#![allow(dead_code)]

use std::io::{Cursor, Write};

use fastwarc::{ArchiveIterator, ArchiveIteratorConfig, CompressionMode, Error, FrozenRecord, HeaderMap, SkippedRange};
use flate2::write::GzEncoder;
use flate2::Compression;
use lz4_flex::frame::FrameEncoder;

pub const MODES: [CompressionMode; 3] = [CompressionMode::None, CompressionMode::Gzip, CompressionMode::Lz4];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serialize a WARC/1.1 record with the given extra headers.
pub fn warc_record(record_type: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut data = format!("WARC/1.1\r\nWARC-Type: {record_type}\r\n").into_bytes();
    for (name, value) in headers {
        data.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    data.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    data.extend_from_slice(body);
    data.extend_from_slice(b"\r\n\r\n");
    data
}

/// Concatenate records, compressing each one separately.
pub fn encode(records: &[Vec<u8>], mode: CompressionMode) -> Vec<u8> {
    records.iter().flat_map(|record| compress(record, mode)).collect()
}

pub fn compress(data: &[u8], mode: CompressionMode) -> Vec<u8> {
    match mode {
        CompressionMode::None => data.to_vec(),
        CompressionMode::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data).unwrap();
            enc.finish().unwrap()
        }
        CompressionMode::Lz4 => {
            let mut enc = FrameEncoder::new(Vec::new());
            enc.write_all(data).unwrap();
            enc.finish().unwrap()
        }
    }
}

/// Deterministic printable noise without any `W` (and therefore no `WARC/`).
pub fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let b = b' ' + ((state >> 16) % 95) as u8;
            if b == b'W' {
                b'w'
            } else {
                b
            }
        })
        .collect()
}

/// Result of reading a whole archive.
pub struct Collected {
    pub records: Vec<FrozenRecord>,
    pub diagnostics: Vec<SkippedRange>,
    pub error: Option<Error>,
}

pub fn collect(data: &[u8], config: ArchiveIteratorConfig) -> Collected {
    let mut iter = ArchiveIterator::new(Cursor::new(data), config).unwrap();
    let mut records = Vec::new();
    let mut error = None;
    for result in iter.frozen() {
        match result {
            Ok(record) => records.push(record),
            Err(e) => error = Some(e),
        }
    }
    Collected {
        records,
        diagnostics: iter.take_diagnostics(),
        error,
    }
}

/// Everything of a record except its raw offsets.
pub fn logical(record: &FrozenRecord) -> (String, HeaderMap, Vec<u8>, u64, u64) {
    (
        record.record_type.to_string(),
        record.headers.clone(),
        record.content.clone(),
        record.content_length,
        record.stream_pos,
    )
}
