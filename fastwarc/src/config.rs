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

//! Archive iterator configuration.
//!
//! - [`ParseBudget`] holds the per-record resource ceilings.
//! - [`RecordTypeFilter`] selects which record types are returned.
//! - [`ArchiveIteratorConfig`] bundles both with I/O and filtering options.
//!
//! ```
//! use std::time::Duration;
//! use fastwarc::{ArchiveIteratorConfig, ParseBudget, RecordTypeFilter, WarcRecordType};
//!
//! let config = ArchiveIteratorConfig::default()
//!     .with_budget(ParseBudget::default().with_max_record_time(Duration::from_secs(1)))
//!     .with_record_type_filter(RecordTypeFilter::only(&[WarcRecordType::Response]));
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::error::{Error, Result};
use crate::record::WarcRecordType;

/// Default I/O chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default maximum length of a single start or header line (64 KiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Default maximum size of a record header block (256 KiB).
pub const DEFAULT_MAX_HEADER_BYTES: usize = 256 * 1024;

/// Default maximum number of bytes scanned while resynchronizing (16 MiB).
pub const DEFAULT_MAX_RESYNC_BYTES: u64 = 16 * 1024 * 1024;

/// Default time allowed for producing a single record.
pub const DEFAULT_MAX_RECORD_TIME: Duration = Duration::from_secs(10);

/// Per-record resource ceilings.
///
/// Exceeding any of these turns what would be unbounded work into a
/// skip-and-resynchronize outcome (or a terminal error in strict mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseBudget {
    max_line_bytes: usize,
    max_header_bytes: usize,
    max_resync_bytes: u64,
    max_record_time: Duration,
}

impl ParseBudget {
    pub fn with_max_line_bytes(mut self, bytes: usize) -> Self {
        self.max_line_bytes = bytes;
        self
    }

    pub fn with_max_header_bytes(mut self, bytes: usize) -> Self {
        self.max_header_bytes = bytes;
        self
    }

    pub fn with_max_resync_bytes(mut self, bytes: u64) -> Self {
        self.max_resync_bytes = bytes;
        self
    }

    pub fn with_max_record_time(mut self, time: Duration) -> Self {
        self.max_record_time = time;
        self
    }

    /// Maximum length of a single line including its terminator.
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Maximum size of a header block including the start line.
    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    /// Maximum number of bytes skipped while searching for the next record.
    pub fn max_resync_bytes(&self) -> u64 {
        self.max_resync_bytes
    }

    /// Maximum wall-clock time for framing a single record.
    pub fn max_record_time(&self) -> Duration {
        self.max_record_time
    }

    /// Validate the budget.
    pub fn validate(&self) -> Result<()> {
        // Shortest meaningful line is "WARC/1.0\n".
        if self.max_line_bytes < 16 {
            return Err(Error::InvalidConfig("max_line_bytes must be at least 16"));
        }
        if self.max_header_bytes < self.max_line_bytes {
            return Err(Error::InvalidConfig("max_header_bytes cannot be smaller than max_line_bytes"));
        }
        Ok(())
    }
}

impl Default for ParseBudget {
    fn default() -> Self {
        ParseBudget {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_resync_bytes: DEFAULT_MAX_RESYNC_BYTES,
            max_record_time: DEFAULT_MAX_RECORD_TIME,
        }
    }
}

/// Set of record types to return from an archive iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordTypeFilter(u16);

impl RecordTypeFilter {
    /// Accept every record type.
    pub const ANY: RecordTypeFilter = RecordTypeFilter(u16::MAX);

    /// Accept nothing.
    pub const NONE: RecordTypeFilter = RecordTypeFilter(0);

    /// Accept only the given record types.
    pub fn only(types: &[WarcRecordType]) -> Self {
        types.iter().fold(Self::NONE, |filter, t| filter.with(t))
    }

    /// Add a record type to the filter.
    pub fn with(self, record_type: &WarcRecordType) -> Self {
        RecordTypeFilter(self.0 | record_type.bitmask())
    }

    /// Create a filter from a raw bitmask of [`WarcRecordType::bitmask`] values.
    pub fn from_bits(bits: u16) -> Self {
        RecordTypeFilter(bits)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, record_type: &WarcRecordType) -> bool {
        record_type.matches_bitmask(self.0)
    }
}

impl Default for RecordTypeFilter {
    fn default() -> Self {
        Self::ANY
    }
}

/// Archive iterator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIteratorConfig {
    /// Size of a single read from the underlying byte source.
    pub chunk_size: usize,
    /// Per-record resource ceilings.
    pub budget: ParseBudget,
    /// Record types to return (others are skipped after header parsing).
    pub record_type_filter: RecordTypeFilter,
    /// Turn every structural error into a terminal failure instead of resynchronizing.
    pub strict_mode: bool,
    /// Parse HTTP headers of HTTP records automatically.
    pub parse_http: bool,
    /// Skip records with a declared Content-Length less than this.
    pub min_content_length: Option<u64>,
    /// Skip records with a declared Content-Length larger than this.
    pub max_content_length: Option<u64>,
}

impl ArchiveIteratorConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_budget(mut self, budget: ParseBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_record_type_filter(mut self, filter: RecordTypeFilter) -> Self {
        self.record_type_filter = filter;
        self
    }

    pub fn with_strict_mode(mut self, strict_mode: bool) -> Self {
        self.strict_mode = strict_mode;
        self
    }

    pub fn with_parse_http(mut self, parse_http: bool) -> Self {
        self.parse_http = parse_http;
        self
    }

    pub fn with_content_length_range(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_content_length = min;
        self.max_content_length = max;
        self
    }

    /// Capacity of the internal buffers.
    ///
    /// Buffers must be able to hold a full line so that start and header lines
    /// can be inspected before they are consumed.
    pub fn buffer_capacity(&self) -> usize {
        self.chunk_size.max(self.budget.max_line_bytes())
    }

    /// Whether a record with the given type and declared length passes the filters.
    pub fn accepts(&self, record_type: &WarcRecordType, content_length: u64) -> bool {
        self.record_type_filter.contains(record_type)
            && self.min_content_length.is_none_or(|min| content_length >= min)
            && self.max_content_length.is_none_or(|max| content_length <= max)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be non-zero"));
        }
        if let (Some(min), Some(max)) = (self.min_content_length, self.max_content_length) {
            if min > max {
                return Err(Error::InvalidConfig("min_content_length cannot be greater than max_content_length"));
            }
        }
        self.budget.validate()
    }
}

impl Default for ArchiveIteratorConfig {
    fn default() -> Self {
        ArchiveIteratorConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            budget: ParseBudget::default(),
            record_type_filter: RecordTypeFilter::ANY,
            strict_mode: false,
            parse_http: false,
            min_content_length: None,
            max_content_length: None,
        }
    }
}
