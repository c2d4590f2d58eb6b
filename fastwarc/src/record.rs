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

use std::fmt;
use std::io::{self, Read};

use chrono::{DateTime, NaiveDateTime, Utc};
use encoding::label::encoding_from_whatwg_label;
use tracing::debug;
use uuid::Uuid;

use crate::digest;
use crate::error::{Error, Result};
use crate::framer::{FrameHead, Framer, StartLine};
use crate::header::{HeaderEncoding, HeaderMap};
use crate::source::BufferedRead;

/// WARC record type enum
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WarcRecordType {
    WarcInfo,
    Response,
    Resource,
    Request,
    Metadata,
    Revisit,
    Conversion,
    Continuation,
    /// Legacy ARC record.
    Arc,
    /// Unrecognized `WARC-Type` value (empty if the header is missing).
    Unknown(String),
}

impl WarcRecordType {
    pub fn as_str(&self) -> &str {
        match self {
            WarcRecordType::WarcInfo => "warcinfo",
            WarcRecordType::Response => "response",
            WarcRecordType::Resource => "resource",
            WarcRecordType::Request => "request",
            WarcRecordType::Metadata => "metadata",
            WarcRecordType::Revisit => "revisit",
            WarcRecordType::Conversion => "conversion",
            WarcRecordType::Continuation => "continuation",
            WarcRecordType::Arc => "arc",
            WarcRecordType::Unknown(name) => name,
        }
    }

    /// Bit used for this type in a [`RecordTypeFilter`](crate::RecordTypeFilter).
    pub fn bitmask(&self) -> u16 {
        match self {
            WarcRecordType::WarcInfo => 2,
            WarcRecordType::Response => 4,
            WarcRecordType::Resource => 8,
            WarcRecordType::Request => 16,
            WarcRecordType::Metadata => 32,
            WarcRecordType::Revisit => 64,
            WarcRecordType::Conversion => 128,
            WarcRecordType::Continuation => 256,
            WarcRecordType::Unknown(_) => 512,
            WarcRecordType::Arc => 1024,
        }
    }

    pub fn matches_bitmask(&self, bitmask: u16) -> bool {
        self.bitmask() & bitmask != 0
    }
}

impl From<&str> for WarcRecordType {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "warcinfo" => WarcRecordType::WarcInfo,
            "response" => WarcRecordType::Response,
            "resource" => WarcRecordType::Resource,
            "request" => WarcRecordType::Request,
            "metadata" => WarcRecordType::Metadata,
            "revisit" => WarcRecordType::Revisit,
            "conversion" => WarcRecordType::Conversion,
            "continuation" => WarcRecordType::Continuation,
            _ => WarcRecordType::Unknown(value.to_string()),
        }
    }
}

impl fmt::Display for WarcRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-use handle over the body of the current record.
///
/// The handle reads at most the declared content length. It is invalidated
/// when the iterator advances, which the borrow on the iterator enforces.
pub struct RecordBody<'a> {
    reader: &'a mut dyn BufferedRead,
    framer: &'a mut Framer,
}

impl<'a> RecordBody<'a> {
    pub(crate) fn new(reader: &'a mut dyn BufferedRead, framer: &'a mut Framer) -> Self {
        RecordBody { reader, framer }
    }

    /// Body bytes not read yet.
    pub fn remaining(&self) -> u64 {
        self.framer.remaining()
    }

    /// Up to `n` body bytes without consuming them (bounded by the buffer capacity).
    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        let n = n.min(usize::try_from(self.framer.remaining()).unwrap_or(usize::MAX));
        self.reader.peek(n)
    }

    /// Skip the rest of the body.
    pub fn skip_rest(&mut self) -> Result<()> {
        let remaining = self.framer.remaining();
        self.framer.skip_body(&mut *self.reader, remaining)
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        self.framer.skip_body(&mut *self.reader, n as u64)
    }

    fn finish(&mut self) -> Result<u64> {
        self.framer.finish(&mut *self.reader)?;
        Ok(self.reader.raw_position())
    }
}

impl Read for RecordBody<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        Ok(self.framer.read_body(&mut *self.reader, out)?)
    }
}

/// A WARC record handed out by the archive iterator.
///
/// The record borrows the iterator: its body is streamed directly from the
/// underlying input and has to be read (or is skipped) before the next record.
/// Use [`WarcRecord::freeze`] to detach it.
pub struct WarcRecord<'a> {
    head: FrameHead,
    raw_end: Option<u64>,
    http_parsed: bool,
    http_block: Vec<u8>,
    http_headers: Option<HeaderMap>,
    http_charset: Option<String>,
    body: RecordBody<'a>,
}

impl<'a> WarcRecord<'a> {
    pub(crate) fn new(head: FrameHead, body: RecordBody<'a>) -> Self {
        WarcRecord {
            head,
            raw_end: None,
            http_parsed: false,
            http_block: Vec::new(),
            http_headers: None,
            http_charset: None,
            body,
        }
    }

    /// Record type (same as `headers['WARC-Type']`).
    pub fn record_type(&self) -> &WarcRecordType {
        &self.head.record_type
    }

    /// WARC record headers.
    ///
    /// For ARC records, the start line fields are exposed as headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Parsed record start line.
    pub fn start_line(&self) -> &StartLine {
        &self.head.start_line
    }

    /// Declared body length.
    pub fn content_length(&self) -> u64 {
        self.head.content_length
    }

    /// Record start offset in the decompressed stream.
    pub fn stream_pos(&self) -> u64 {
        self.head.stream_pos
    }

    /// Record body stream.
    pub fn body(&mut self) -> &mut RecordBody<'a> {
        &mut self.body
    }

    /// Raw start and end offset of the record.
    ///
    /// For compressed input, these are compressed-file offsets of the
    /// record's member(s) and can be used for seeking. Determining the end
    /// offset skips the unread rest of the body.
    pub fn raw_offset_range(&mut self) -> Result<(u64, u64)> {
        let end = match self.raw_end {
            Some(end) => end,
            None => {
                let end = self.body.finish()?;
                self.raw_end = Some(end);
                end
            }
        };
        Ok((self.head.raw_start, end))
    }

    /// Record ID (same as `headers['WARC-Record-ID']`).
    pub fn record_id(&self) -> Option<String> {
        self.head.headers.get("WARC-Record-ID")
    }

    /// Record ID as UUID if it is a `urn:uuid:` URN.
    pub fn record_uuid(&self) -> Option<Uuid> {
        let id = self.record_id()?;
        let urn = id.trim().trim_start_matches('<').trim_end_matches('>');
        Uuid::parse_str(urn.strip_prefix("urn:uuid:")?).ok()
    }

    /// Record date from `WARC-Date` (or the ARC archive date).
    pub fn record_date(&self) -> Option<DateTime<Utc>> {
        if let Some(date) = self.head.headers.get("WARC-Date") {
            return DateTime::parse_from_rfc3339(date.trim())
                .ok()
                .map(|d| d.with_timezone(&Utc));
        }
        let date = self.head.headers.get("Archive-Date")?;
        NaiveDateTime::parse_from_str(date.trim(), "%Y%m%d%H%M%S")
            .ok()
            .map(|d| d.and_utc())
    }

    /// Target URI (`WARC-Target-URI` or the ARC URL).
    pub fn target_uri(&self) -> Option<String> {
        let headers = &self.head.headers;
        headers
            .get("WARC-Target-URI")
            .or_else(|| headers.get("URL"))
            .map(|uri| uri.trim_start_matches('<').trim_end_matches('>').to_string())
    }

    /// Format version token from the start line (`WARC/1.1`, or `None` for ARC records).
    pub fn warc_version(&self) -> Option<&str> {
        match &self.head.start_line {
            StartLine::Warc { version } => Some(version.as_str()),
            StartLine::Arc { .. } => None,
        }
    }

    /// Whether record is an HTTP record.
    pub fn is_http(&self) -> bool {
        if self.head.record_type == WarcRecordType::Arc {
            return self
                .head
                .headers
                .get_first_bytes(b"URL")
                .is_some_and(|url| url.starts_with(b"http:") || url.starts_with(b"https:"));
        }
        self.head
            .headers
            .get_first_bytes(b"Content-Type")
            .is_some_and(|ct| ct.len() >= 16 && ct[..16].eq_ignore_ascii_case(b"application/http"))
    }

    /// Whether HTTP headers have been parsed.
    pub fn is_http_parsed(&self) -> bool {
        self.http_parsed
    }

    /// HTTP headers if record is an HTTP record and HTTP headers have been parsed yet.
    pub fn http_headers(&self) -> Option<&HeaderMap> {
        self.http_headers.as_ref()
    }

    /// Plain HTTP Content-Type without additional fields such as `charset=`.
    pub fn http_content_type(&self) -> Option<String> {
        http_content_type(self.http_headers.as_ref()?)
    }

    /// HTTP charset/encoding as returned by the server or `None` if no valid charset is set.
    ///
    /// A returned string is guaranteed to be a valid encoding name.
    pub fn http_charset(&self) -> Option<&str> {
        self.http_charset.as_deref()
    }

    /// Parse HTTP headers and advance the body to the HTTP payload.
    ///
    /// It is safe to call this method multiple times, even if the record is not
    /// an HTTP record. The header block is read from the buffered front of the
    /// body, bounded by the header budget. Header blocks without a terminating
    /// blank line are left unparsed, unless they span the whole body.
    pub fn parse_http(&mut self) -> Result<()> {
        if self.http_parsed || !self.is_http() || self.body.remaining() != self.head.content_length {
            return Ok(());
        }
        self.http_parsed = true;

        let limit = self.body.framer.budget().max_header_bytes();
        let whole_body = self.body.remaining() <= limit as u64;
        let window = self.body.peek(limit)?;
        let block_len = match find_header_end(window) {
            Some(end) => end,
            None if whole_body && window.len() as u64 == self.head.content_length => window.len(),
            None => {
                debug!(stream_pos = self.head.stream_pos, "HTTP header block not terminated within budget");
                return Ok(());
            }
        };
        let headers = HeaderMap::parse_block(&window[..block_len], HeaderEncoding::Latin1);
        self.http_block = window[..block_len].to_vec();
        self.http_charset = http_charset(&headers);
        self.http_headers = Some(headers);
        self.body.advance(block_len)
    }

    /// Verify the `WARC-Block-Digest` against the record block.
    ///
    /// Consumes the body. Returns `false` if there is no (supported) digest,
    /// or if body bytes other than the HTTP header block were read already.
    pub fn verify_block_digest(&mut self) -> Result<bool> {
        let Some(expected) = self.head.headers.get("WARC-Block-Digest") else {
            return Ok(false);
        };
        let consumed = self.head.content_length - self.body.remaining();
        if consumed != self.http_block.len() as u64 {
            debug!(consumed, "cannot verify block digest of partially read record");
            return Ok(false);
        }
        digest::verify_digest(&expected, &self.http_block, &mut self.body)
    }

    /// Verify the `WARC-Payload-Digest` against the HTTP payload.
    ///
    /// Parses the HTTP headers if necessary and consumes the body.
    pub fn verify_payload_digest(&mut self) -> Result<bool> {
        let Some(expected) = self.head.headers.get("WARC-Payload-Digest") else {
            return Ok(false);
        };
        self.parse_http()?;
        if self.head.content_length - self.body.remaining() != self.http_block.len() as u64 {
            return Ok(false);
        }
        digest::verify_digest(&expected, &[], &mut self.body)
    }

    /// "Freeze" the record by reading the remaining body into memory.
    ///
    /// The frozen record is independent of the input stream.
    pub fn freeze(mut self) -> Result<FrozenRecord> {
        let remaining = self.body.remaining();
        let mut content = Vec::with_capacity(usize::try_from(remaining).unwrap_or(0).min(1 << 20));
        self.body.read_to_end(&mut content).map_err(Error::from)?;
        let (raw_start, raw_end) = self.raw_offset_range()?;
        Ok(FrozenRecord {
            record_type: self.head.record_type,
            headers: self.head.headers,
            http_headers: self.http_headers,
            http_charset: self.http_charset,
            content_length: self.head.content_length,
            content,
            stream_pos: self.head.stream_pos,
            raw_start,
            raw_end,
        })
    }
}

/// Owned record detached from the input stream.
///
/// `content` holds the body bytes that were still unread when the record was
/// frozen (the HTTP payload if HTTP headers were parsed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenRecord {
    pub record_type: WarcRecordType,
    pub headers: HeaderMap,
    pub http_headers: Option<HeaderMap>,
    pub http_charset: Option<String>,
    pub content_length: u64,
    pub content: Vec<u8>,
    pub stream_pos: u64,
    pub raw_start: u64,
    pub raw_end: u64,
}

impl FrozenRecord {
    pub fn record_id(&self) -> Option<String> {
        self.headers.get("WARC-Record-ID")
    }

    pub fn http_content_type(&self) -> Option<String> {
        http_content_type(self.http_headers.as_ref()?)
    }
}

/// Offset after the blank line terminating an HTTP header block.
fn find_header_end(block: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, b) in block.iter().enumerate() {
        if *b != b'\n' {
            continue;
        }
        let line = &block[line_start..i];
        if line.is_empty() || line == b"\r" {
            // A block has at least a status line.
            if line_start > 0 {
                return Some(i + 1);
            }
        }
        line_start = i + 1;
    }
    None
}

fn http_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Content-Type")?
        .split(';')
        .next()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

fn http_charset(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get("Content-Type")?;
    let label = content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(|c| c == '"' || c == '\''))
    })?;
    let encoding = encoding_from_whatwg_label(label)?;
    Some(encoding.whatwg_name().unwrap_or_else(|| encoding.name()).to_string())
}

/// Record is a WARC/1.0 record.
pub fn is_warc_10(record: &WarcRecord<'_>) -> bool {
    record.warc_version() == Some("WARC/1.0")
}

/// Record is a WARC/1.1 record.
pub fn is_warc_11(record: &WarcRecord<'_>) -> bool {
    record.warc_version() == Some("WARC/1.1")
}

/// Record has a block digest.
pub fn has_block_digest(record: &WarcRecord<'_>) -> bool {
    record.headers().contains_key("WARC-Block-Digest")
}

/// Record has a payload digest.
pub fn has_payload_digest(record: &WarcRecord<'_>) -> bool {
    record.headers().contains_key("WARC-Payload-Digest")
}

/// Record is an HTTP record.
pub fn is_http(record: &WarcRecord<'_>) -> bool {
    record.is_http()
}

/// Record is concurrent to another record.
pub fn is_concurrent(record: &WarcRecord<'_>) -> bool {
    record.headers().contains_key("WARC-Concurrent-To")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_names() {
        assert_eq!(WarcRecordType::from("Response"), WarcRecordType::Response);
        assert_eq!(WarcRecordType::from("warcinfo"), WarcRecordType::WarcInfo);
        assert_eq!(WarcRecordType::from("x-custom"), WarcRecordType::Unknown("x-custom".into()));
        assert_eq!(WarcRecordType::Unknown("x-custom".into()).as_str(), "x-custom");
        assert_eq!(WarcRecordType::Revisit.to_string(), "revisit");
    }

    #[test]
    fn test_bitmasks_are_distinct() {
        let types = [
            WarcRecordType::WarcInfo,
            WarcRecordType::Response,
            WarcRecordType::Resource,
            WarcRecordType::Request,
            WarcRecordType::Metadata,
            WarcRecordType::Revisit,
            WarcRecordType::Conversion,
            WarcRecordType::Continuation,
            WarcRecordType::Arc,
            WarcRecordType::Unknown(String::new()),
        ];
        let all = types.iter().fold(0u16, |acc, t| {
            assert_eq!(acc & t.bitmask(), 0);
            acc | t.bitmask()
        });
        assert!(types.iter().all(|t| t.matches_bitmask(all)));
        assert!(!WarcRecordType::Response.matches_bitmask(WarcRecordType::Request.bitmask()));
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\nA: b\r\n\r\nbody"), Some(25));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\nA: b\n\nbody"), Some(22));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\nA: b\r\n"), None);
        assert_eq!(find_header_end(b"\r\nHTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn test_http_charset() {
        let block = b"HTTP/1.1 200 OK\r\nContent-Type: Text/HTML; Charset=\"latin1\"\r\n\r\n";
        let headers = HeaderMap::parse_block(block, HeaderEncoding::Latin1);
        assert_eq!(http_content_type(&headers).unwrap(), "text/html");
        assert_eq!(http_charset(&headers).unwrap(), "windows-1252");

        let headers = HeaderMap::parse_block(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=bogus\r\n\r\n",
            HeaderEncoding::Latin1,
        );
        assert_eq!(http_charset(&headers), None);
    }
}
