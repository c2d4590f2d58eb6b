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

//! Record framing state machine.
//!
//! A [`Framer`] walks through `ExpectStartLine → ExpectHeaders → ExpectBody → Done`
//! for every record. Lines are peeked and validated before they are consumed,
//! so a failed frame leaves the offending line in the stream for resynchronization.

use std::time::Instant;

use tracing::trace;

use crate::config::ParseBudget;
use crate::error::{Error, Result};
use crate::header::{strip_line_ending, HeaderEncoding, HeaderMap};
use crate::record::WarcRecordType;
use crate::source::BufferedRead;

/// Number of separator bytes (`CRLFCRLF`) accepted after a record body.
const MAX_SEPARATOR_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    ExpectStartLine,
    ExpectHeaders,
    ExpectBody,
    Done,
}

/// Parsed record start line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// WARC version line such as `WARC/1.1`.
    Warc { version: String },
    /// ARC v1 record line: `<url> <ip> <date> <content-type> <length>`.
    Arc {
        url: String,
        ip: String,
        date: String,
        content_type: String,
        length: u64,
    },
}

impl StartLine {
    /// Parse a start line without its line ending.
    ///
    /// WARC version lines are tried first. Anything else has to match the
    /// five-field ARC v1 grammar.
    pub fn parse(line: &[u8]) -> Option<StartLine> {
        let line = line.trim_ascii_end();
        if let Some(version) = line.strip_prefix(b"WARC/") {
            let (major, minor) = split_once(version, b'.')?;
            if is_digits(major) && is_digits(minor) {
                return Some(StartLine::Warc {
                    version: String::from_utf8_lossy(line).into_owned(),
                });
            }
            return None;
        }
        Self::parse_arc(line)
    }

    fn parse_arc(line: &[u8]) -> Option<StartLine> {
        let fields: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
        let [url, ip, date, content_type, length] = fields.as_slice() else {
            return None;
        };
        if url.is_empty() || !url.contains(&b':') || ip.is_empty() || content_type.is_empty() {
            return None;
        }
        if !is_digits(date) || !(8..=14).contains(&date.len()) || !is_digits(length) {
            return None;
        }
        let text = |field: &[u8]| String::from_utf8_lossy(field).into_owned();
        Some(StartLine::Arc {
            url: text(url),
            ip: text(ip),
            date: text(date),
            content_type: text(content_type),
            length: parse_decimal(length)?,
        })
    }

    pub fn is_warc(&self) -> bool {
        matches!(self, StartLine::Warc { .. })
    }
}

/// Header part of a framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHead {
    pub start_line: StartLine,
    pub headers: HeaderMap,
    pub record_type: WarcRecordType,
    pub content_length: u64,
    /// Start offset in the decompressed stream.
    pub stream_pos: u64,
    /// Start offset in the raw input.
    pub raw_start: u64,
}

/// Record framing state machine.
///
/// The framer owns no buffers. It works on any [`BufferedRead`] and keeps
/// track of the current record's state and remaining body length.
#[derive(Debug, Clone)]
pub struct Framer {
    budget: ParseBudget,
    state: FrameState,
    remaining: u64,
    start_position: u64,
    start_raw: u64,
}

impl Framer {
    pub fn new(budget: ParseBudget) -> Self {
        Framer {
            budget,
            state: FrameState::ExpectStartLine,
            remaining: 0,
            start_position: 0,
            start_raw: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn budget(&self) -> &ParseBudget {
        &self.budget
    }

    /// Unread body bytes of the current record.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Decompressed offset at which the last frame attempt started.
    pub fn start_position(&self) -> u64 {
        self.start_position
    }

    /// Raw offset at which the last frame attempt started.
    pub fn start_raw(&self) -> u64 {
        self.start_raw
    }

    /// Finish the current record and frame the next one up to its body.
    ///
    /// Returns `Ok(None)` if the stream ends cleanly before a new record.
    /// On error, the framer is reset and the stream is left at the point of
    /// failure.
    pub fn next_frame<B: BufferedRead + ?Sized>(&mut self, reader: &mut B) -> Result<Option<FrameHead>> {
        let result = self.finish(reader).and_then(|()| self.frame(reader));
        if result.is_err() {
            self.state = FrameState::ExpectStartLine;
            self.remaining = 0;
        }
        result
    }

    fn frame<B: BufferedRead + ?Sized>(&mut self, reader: &mut B) -> Result<Option<FrameHead>> {
        let started = Instant::now();
        self.state = FrameState::ExpectStartLine;
        self.start_position = reader.position();
        self.start_raw = reader.raw_position();

        // Skip blank lines between records.
        let mut header_bytes = 0usize;
        loop {
            let avail = reader.fill_to(1)?;
            if avail == 0 {
                return Ok(None);
            }
            let blank = reader.buffer().iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
            if blank == 0 {
                break;
            }
            reader.consume(blank);
            header_bytes += blank;
            if header_bytes > self.budget.max_header_bytes() {
                return Err(Error::HeaderTooLarge { max: self.budget.max_header_bytes() });
            }
        }
        let stream_pos = reader.position();
        let raw_start = reader.raw_position();
        self.start_position = stream_pos;
        self.start_raw = raw_start;

        let line = reader.peek_line(self.budget.max_line_bytes())?;
        if !line.ends_with(b"\n") {
            return Err(Error::Truncated);
        }
        let line_len = line.len();
        let Some(start_line) = StartLine::parse(strip_line_ending(line)) else {
            return Err(Error::InvalidStartLine(Error::excerpt(line)));
        };
        let status_line = strip_line_ending(line).to_vec();
        self.check_time(started)?;
        reader.consume(line_len);
        header_bytes = line_len;
        self.state = FrameState::ExpectHeaders;

        let (headers, record_type, content_length) = match &start_line {
            StartLine::Warc { .. } => {
                let mut headers = HeaderMap::new(HeaderEncoding::Unicode);
                headers.set_status_line(&status_line);
                self.read_headers(reader, &mut headers, header_bytes, started)?;
                let record_type = headers
                    .get("WARC-Type")
                    .map_or_else(|| WarcRecordType::Unknown(String::new()), |t| WarcRecordType::from(t.trim()));
                let content_length = parse_content_length(&headers)?;
                (headers, record_type, content_length)
            }
            StartLine::Arc { url, ip, date, content_type, length } => {
                let mut headers = HeaderMap::new(HeaderEncoding::Latin1);
                headers.append("URL", url);
                headers.append("IP-Address", ip);
                headers.append("Archive-Date", date);
                headers.append("Content-Type", content_type);
                headers.append("Content-Length", length.to_string());
                (headers, WarcRecordType::Arc, *length)
            }
        };

        trace!(stream_pos, raw_start, %record_type, content_length, "framed record");
        self.state = FrameState::ExpectBody;
        self.remaining = content_length;
        Ok(Some(FrameHead {
            start_line,
            headers,
            record_type,
            content_length,
            stream_pos,
            raw_start,
        }))
    }

    fn read_headers<B: BufferedRead + ?Sized>(
        &self,
        reader: &mut B,
        headers: &mut HeaderMap,
        mut header_bytes: usize,
        started: Instant,
    ) -> Result<()> {
        let max_header = self.budget.max_header_bytes();
        let max_line = self.budget.max_line_bytes();
        loop {
            self.check_time(started)?;
            let limit = max_line.min(max_header.saturating_sub(header_bytes));
            let line = match reader.peek_line(limit) {
                Err(Error::LineTooLong { .. }) if limit < max_line => {
                    return Err(Error::HeaderTooLarge { max: max_header });
                }
                result => result?,
            };
            if !line.ends_with(b"\n") {
                return Err(Error::Truncated);
            }
            let line_len = line.len();
            let content = strip_line_ending(line);
            if content.is_empty() {
                reader.consume(line_len);
                return Ok(());
            }
            headers.push_line(content)?;
            reader.consume(line_len);
            header_bytes += line_len;
        }
    }

    fn check_time(&self, started: Instant) -> Result<()> {
        let limit = self.budget.max_record_time();
        if started.elapsed() >= limit {
            return Err(Error::TimeBudgetExceeded(limit));
        }
        Ok(())
    }

    /// Read body bytes of the current record into `out`.
    ///
    /// Fails with [`Error::Truncated`] if the stream ends before the declared length.
    pub fn read_body<B: BufferedRead + ?Sized>(&mut self, reader: &mut B, out: &mut [u8]) -> Result<usize> {
        if self.state != FrameState::ExpectBody || self.remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        let avail = reader.fill_to(1)?;
        if avail == 0 {
            return Err(Error::Truncated);
        }
        let n = avail
            .min(out.len())
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        out[..n].copy_from_slice(&reader.buffer()[..n]);
        reader.consume(n);
        self.remaining -= n as u64;
        Ok(n)
    }

    /// Skip up to `n` body bytes of the current record.
    pub fn skip_body<B: BufferedRead + ?Sized>(&mut self, reader: &mut B, n: u64) -> Result<()> {
        if self.state != FrameState::ExpectBody {
            return Ok(());
        }
        let n = n.min(self.remaining);
        let skipped = reader.skip(n)?;
        self.remaining -= skipped;
        if skipped < n {
            return Err(Error::Truncated);
        }
        Ok(())
    }

    /// Skip the rest of the current body and the record separator.
    ///
    /// Calling this again after the record is done has no effect.
    pub fn finish<B: BufferedRead + ?Sized>(&mut self, reader: &mut B) -> Result<()> {
        if self.state != FrameState::ExpectBody {
            return Ok(());
        }
        self.skip_body(reader, self.remaining)?;
        self.state = FrameState::Done;

        match reader.fill_to(MAX_SEPARATOR_BYTES) {
            Ok(avail) => {
                let separator = reader.buffer()[..avail.min(MAX_SEPARATOR_BYTES)]
                    .iter()
                    .take_while(|&&b| b == b'\r' || b == b'\n')
                    .count();
                reader.consume(separator);
                Ok(())
            }
            // The next frame attempt runs into the same error.
            Err(e) if e.is_structural() => {
                trace!(error = %e, "could not read record separator");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse the declared body length.
///
/// Missing or non-numeric values declare an empty body. Negative values
/// and values that do not fit into a `u64` are rejected.
pub(crate) fn parse_content_length(headers: &HeaderMap) -> Result<u64> {
    let Some(value) = headers.get_first_bytes(b"Content-Length") else {
        return Ok(0);
    };
    let value = value.trim_ascii();
    if value.starts_with(b"-") {
        return Err(Error::InvalidContentLength(Error::excerpt(value)));
    }
    if !is_digits(value) {
        return Ok(0);
    }
    parse_decimal(value).ok_or_else(|| Error::InvalidContentLength(Error::excerpt(value)))
}

fn parse_decimal(digits: &[u8]) -> Option<u64> {
    digits
        .iter()
        .try_fold(0u64, |acc, &d| acc.checked_mul(10)?.checked_add(u64::from(d - b'0')))
}

fn is_digits(s: &[u8]) -> bool {
    !s.is_empty() && s.iter().all(u8::is_ascii_digit)
}

fn split_once(s: &[u8], delim: u8) -> Option<(&[u8], &[u8])> {
    let i = s.iter().position(|&b| b == delim)?;
    Some((&s[..i], &s[i + 1..]))
}
