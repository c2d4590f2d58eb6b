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

//! Resilient streaming parser for WARC and ARC web archives.
//!
//! Archives are read through a stack of layers, each building on the one below:
//!
//! 1. [`source::RawSource`]: chunked buffering over any [`std::io::Read`].
//! 2. [`stream::StreamReader`]: transparent gzip-per-member, LZ4 frame or plain input.
//! 3. [`framer::Framer`]: start line, header block and body framing.
//! 4. [`resync::Resynchronizer`]: skips corrupt data to the next record start.
//! 5. [`ArchiveIterator`]: the public record sequence with filtering and offsets.

pub mod config;
pub mod digest;
pub mod error;
pub mod framer;
pub mod header;
pub mod iterator;
pub mod record;
pub mod resync;
pub mod source;
pub mod stream;

pub use config::{ArchiveIteratorConfig, ParseBudget, RecordTypeFilter};
pub use error::{Error, Result};
pub use header::{CaseInsensitiveKey, HeaderEncoding, HeaderMap};
pub use iterator::{ArchiveIterator, Frozen, Outcome};
pub use record::{
    has_block_digest, has_payload_digest, is_concurrent, is_http, is_warc_10, is_warc_11, FrozenRecord, RecordBody,
    WarcRecord, WarcRecordType,
};
pub use resync::SkippedRange;
pub use stream::CompressionMode;
