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

//! Lazy iteration over archive records.
//!
//! ```
//! use std::io::{Cursor, Read};
//! use fastwarc::{ArchiveIterator, ArchiveIteratorConfig};
//!
//! let data = b"WARC/1.1\r\nWARC-Type: resource\r\nContent-Length: 5\r\n\r\nhello\r\n\r\n";
//! let mut iter = ArchiveIterator::new(Cursor::new(&data[..]), ArchiveIteratorConfig::default()).unwrap();
//! while let Some(record) = iter.next_record() {
//!     let mut record = record.unwrap();
//!     let mut body = String::new();
//!     record.body().read_to_string(&mut body).unwrap();
//!     assert_eq!(body, "hello");
//! }
//! assert!(iter.take_diagnostics().is_empty());
//! ```

use std::io::{self, Read, Seek, SeekFrom};

use tracing::{debug, warn};

use crate::config::ArchiveIteratorConfig;
use crate::error::{Error, Result};
use crate::framer::{FrameHead, Framer, StartLine};
use crate::record::{FrozenRecord, RecordBody, WarcRecord};
use crate::resync::{FrameOrigin, ResyncOutcome, Resynchronizer, SkippedRange};
use crate::source::{BufferedRead, RawSource};
use crate::stream::{CompressionMode, StreamReader};

/// State of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// More records may follow.
    Running,
    /// The input ended cleanly.
    Completed,
    /// Iteration stopped with a terminal error.
    Failed,
}

/// How to continue after a framing failure.
enum Recovery {
    Resume,
    End,
    Fail(Error),
}

/// Forward-only iterator over the records of a WARC or ARC stream.
///
/// Records borrow the iterator, so the previous record has to be dropped
/// before the next one is requested. Unread body bytes are skipped
/// automatically. Use [`ArchiveIterator::frozen`] for a plain [`Iterator`]
/// over owned records.
pub struct ArchiveIterator<R: Read> {
    reader: StreamReader<R>,
    framer: Framer,
    resync: Resynchronizer,
    config: ArchiveIteratorConfig,
    diagnostics: Vec<SkippedRange>,
    outcome: Outcome,
}

impl<R: Read> ArchiveIterator<R> {
    /// Open an archive stream.
    ///
    /// The compression mode is detected from the first bytes of the stream.
    pub fn new(inner: R, config: ArchiveIteratorConfig) -> Result<Self> {
        config.validate()?;
        let source = RawSource::new(inner, config.buffer_capacity());
        Self::with_source(source, config)
    }

    fn with_source(source: RawSource<R>, config: ArchiveIteratorConfig) -> Result<Self> {
        let reader = StreamReader::new(source)?;
        Ok(ArchiveIterator {
            reader,
            framer: Framer::new(config.budget),
            resync: Resynchronizer::new(&config.budget),
            config,
            diagnostics: Vec::new(),
            outcome: Outcome::Running,
        })
    }

    pub fn config(&self) -> &ArchiveIteratorConfig {
        &self.config
    }

    pub fn compression(&self) -> CompressionMode {
        self.reader.mode()
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Byte ranges skipped so far that have not been taken yet.
    pub fn diagnostics(&self) -> &[SkippedRange] {
        &self.diagnostics
    }

    /// Take the skipped byte ranges reported since the last call.
    pub fn take_diagnostics(&mut self) -> Vec<SkippedRange> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Decompressed stream position.
    pub fn stream_pos(&self) -> u64 {
        self.reader.position()
    }

    /// Return the next record.
    ///
    /// Returns `None` once the input is exhausted or after a terminal error
    /// has been returned. Corrupt records are skipped and reported through
    /// [`ArchiveIterator::take_diagnostics`], unless strict mode is enabled.
    pub fn next_record(&mut self) -> Option<Result<WarcRecord<'_>>> {
        if self.outcome != Outcome::Running {
            return None;
        }
        let head = loop {
            match self.framer.next_frame(&mut self.reader) {
                Ok(Some(head)) => {
                    if let StartLine::Arc { .. } = head.start_line {
                        self.resync.set_accept_arc(true);
                    }
                    if self.config.accepts(&head.record_type, head.content_length) {
                        break head;
                    }
                    debug!(record_type = %head.record_type, stream_pos = head.stream_pos, "skipping filtered record");
                }
                Ok(None) => {
                    self.outcome = Outcome::Completed;
                    return None;
                }
                Err(err) => match self.recover(err) {
                    Recovery::Resume => {}
                    Recovery::End => {
                        self.outcome = Outcome::Completed;
                        return None;
                    }
                    Recovery::Fail(err) => {
                        self.outcome = Outcome::Failed;
                        return Some(Err(err));
                    }
                },
            }
        };
        self.make_record(head)
    }

    fn make_record(&mut self, head: FrameHead) -> Option<Result<WarcRecord<'_>>> {
        let parse_http = self.config.parse_http;
        let body = RecordBody::new(&mut self.reader, &mut self.framer);
        let mut record = WarcRecord::new(head, body);
        if parse_http {
            if let Err(err) = record.parse_http() {
                if !err.is_structural() {
                    drop(record);
                    self.outcome = Outcome::Failed;
                    return Some(Err(err));
                }
                debug!(error = %err, "failed to parse HTTP headers");
            }
        }
        Some(Ok(record))
    }

    fn recover(&mut self, err: Error) -> Recovery {
        if !err.is_structural() {
            warn!(error = %err, "archive iteration failed");
            return Recovery::Fail(err);
        }
        let origin = FrameOrigin {
            position: self.framer.start_position(),
            raw: self.framer.start_raw(),
        };
        if self.config.strict_mode {
            warn!(error = %err, offset = origin.raw, "invalid record in strict mode");
            return Recovery::Fail(err);
        }
        if self.at_end(&err) {
            debug!(error = %err, "input ended inside a record");
            return Recovery::End;
        }

        match self.resync.resync(&mut self.reader, origin) {
            Ok(ResyncOutcome::Found(range)) => {
                warn!(start = range.start, end = range.end, error = %err, "skipped corrupt record");
                self.diagnostics.push(range);
                Recovery::Resume
            }
            Ok(ResyncOutcome::EndOfStream(range)) => {
                warn!(start = range.start, end = range.end, error = %err, "skipped corrupt data at end of input");
                if !range.is_empty() {
                    self.diagnostics.push(range);
                }
                Recovery::End
            }
            Ok(ResyncOutcome::Exhausted { offset, scanned }) => {
                Recovery::Fail(Error::UnrecoverableCorruption { offset, scanned })
            }
            Err(e) => Recovery::Fail(e),
        }
    }

    /// Whether a structural error is just the input ending early.
    fn at_end(&mut self, err: &Error) -> bool {
        match err {
            Error::Truncated => matches!(self.reader.fill_to(1), Ok(0)),
            Error::Decompression(_) => matches!(self.reader.raw_exhausted(), Ok(true)),
            _ => false,
        }
    }

    /// Iterator adapter yielding frozen records.
    pub fn frozen(&mut self) -> Frozen<'_, R> {
        Frozen { iter: self }
    }
}

impl<R: Read + Seek> ArchiveIterator<R> {
    /// Open a seekable archive stream.
    ///
    /// Unread body bytes of uncompressed streams are skipped by seeking instead of reading.
    pub fn from_seekable(inner: R, config: ArchiveIteratorConfig) -> Result<Self> {
        config.validate()?;
        let source = RawSource::new(inner, config.buffer_capacity()).with_seek_forward(seek_forward::<R>);
        Self::with_source(source, config)
    }
}

/// Seek up to `n` bytes forward, stopping at the end of the resource.
fn seek_forward<R: Seek>(inner: &mut R, n: u64) -> io::Result<u64> {
    let from = inner.stream_position()?;
    let len = inner.seek(SeekFrom::End(0))?;
    let to = from.saturating_add(n).min(len).max(from);
    inner.seek(SeekFrom::Start(to))?;
    Ok(to - from)
}

/// [`Iterator`] over frozen records of an [`ArchiveIterator`].
pub struct Frozen<'a, R: Read> {
    iter: &'a mut ArchiveIterator<R>,
}

impl<R: Read> Iterator for Frozen<'_, R> {
    type Item = Result<FrozenRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.iter.next_record()?;
        Some(record.and_then(WarcRecord::freeze))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParseBudget, RecordTypeFilter};
    use crate::record::WarcRecordType;
    use std::io::Cursor;
    use std::time::Duration;

    fn record(record_type: &str, body: &[u8]) -> Vec<u8> {
        let mut data = format!(
            "WARC/1.1\r\nWARC-Type: {record_type}\r\n\
             WARC-Record-ID: <urn:uuid:00000000-0000-0000-0000-00000000000{}>\r\n\
             Content-Length: {}\r\n\r\n",
            body.len() % 10,
            body.len()
        )
        .into_bytes();
        data.extend_from_slice(body);
        data.extend_from_slice(b"\r\n\r\n");
        data
    }

    fn iter(data: Vec<u8>, config: ArchiveIteratorConfig) -> ArchiveIterator<Cursor<Vec<u8>>> {
        ArchiveIterator::new(Cursor::new(data), config).unwrap()
    }

    #[test]
    fn test_iterates_records() {
        let mut data = record("warcinfo", b"software: test");
        data.extend(record("response", b"HTTP/1.1 200 OK\r\n\r\nbody"));
        let mut iter = iter(data, ArchiveIteratorConfig::default());

        let frozen: Vec<FrozenRecord> = iter.frozen().collect::<Result<_>>().unwrap();
        assert_eq!(frozen.len(), 2);
        assert_eq!(frozen[0].record_type, WarcRecordType::WarcInfo);
        assert_eq!(frozen[0].content, b"software: test");
        assert_eq!(frozen[1].content, b"HTTP/1.1 200 OK\r\n\r\nbody");
        assert_eq!(frozen[1].raw_start, frozen[0].raw_end);
        assert_eq!(iter.outcome(), Outcome::Completed);
        assert!(iter.next_record().is_none());
    }

    #[test]
    fn test_type_filter() {
        let mut data = record("warcinfo", b"abc");
        data.extend(record("response", b"def"));
        data.extend(record("request", b"ghi"));
        let config = ArchiveIteratorConfig::default()
            .with_record_type_filter(RecordTypeFilter::only(&[WarcRecordType::Response]));
        let types: Vec<WarcRecordType> = iter(data, config)
            .frozen()
            .map(|r| r.unwrap().record_type)
            .collect();
        assert_eq!(types, [WarcRecordType::Response]);
    }

    #[test]
    fn test_content_length_filter() {
        let mut data = record("resource", b"");
        data.extend(record("resource", b"0123456789"));
        let config = ArchiveIteratorConfig::default().with_content_length_range(Some(1), None);
        let lengths: Vec<u64> = iter(data, config).frozen().map(|r| r.unwrap().content_length).collect();
        assert_eq!(lengths, [10]);
    }

    #[test]
    fn test_partial_body_read() {
        let mut data = record("resource", b"0123456789");
        data.extend(record("metadata", b"x"));
        let mut iter = iter(data, ArchiveIteratorConfig::default());
        {
            let mut record = iter.next_record().unwrap().unwrap();
            let mut buf = [0u8; 3];
            record.body().read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"012");
            assert_eq!(record.body().remaining(), 7);
        }
        let record = iter.next_record().unwrap().unwrap();
        assert_eq!(record.record_type(), &WarcRecordType::Metadata);
    }

    #[test]
    fn test_seekable_truncated_body_stops_at_end() {
        let full = record("resource", &[b'x'; 100_000]);
        let data = full[..full.len() - 99_000].to_vec();
        let config = ArchiveIteratorConfig::default().with_chunk_size(256);

        let mut seekable = ArchiveIterator::from_seekable(Cursor::new(data.clone()), config.clone()).unwrap();
        drop(seekable.next_record().unwrap().unwrap());
        assert!(seekable.next_record().is_none());
        assert_eq!(seekable.outcome(), Outcome::Completed);
        assert_eq!(seekable.stream_pos(), data.len() as u64);

        let mut streamed = iter(data, config);
        drop(streamed.next_record().unwrap().unwrap());
        assert!(streamed.next_record().is_none());
        assert_eq!(streamed.outcome(), seekable.outcome());
        assert_eq!(streamed.stream_pos(), seekable.stream_pos());
    }

    #[test]
    fn test_parse_http_option() {
        let mut data =
            b"WARC/1.1\r\nWARC-Type: response\r\nContent-Type: application/http; msgtype=response\r\n".to_vec();
        let http = b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<p>hi</p>";
        data.extend_from_slice(format!("Content-Length: {}\r\n\r\n", http.len()).as_bytes());
        data.extend_from_slice(http);
        data.extend_from_slice(b"\r\n\r\n");

        let mut iter = iter(data, ArchiveIteratorConfig::default().with_parse_http(true));
        let mut record = iter.next_record().unwrap().unwrap();
        assert!(record.is_http());
        assert!(record.is_http_parsed());
        assert_eq!(record.http_headers().unwrap().status_code(), Some(200));
        assert_eq!(record.http_content_type().unwrap(), "text/html");
        assert_eq!(record.http_charset(), Some("utf-8"));
        let mut payload = String::new();
        record.body().read_to_string(&mut payload).unwrap();
        assert_eq!(payload, "<p>hi</p>");
    }

    #[test]
    fn test_skips_garbage_between_records() {
        let mut data = record("warcinfo", b"abc");
        data.extend_from_slice(b"this is not a record\r\n");
        data.extend(record("response", b"def"));
        let mut iter = iter(data, ArchiveIteratorConfig::default());
        let types: Vec<WarcRecordType> = iter.frozen().map(|r| r.unwrap().record_type).collect();
        assert_eq!(types, [WarcRecordType::WarcInfo, WarcRecordType::Response]);
        let diagnostics = iter.take_diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].len(), 22);
    }

    #[test]
    fn test_strict_mode_fails() {
        let mut data = record("warcinfo", b"abc");
        data.extend_from_slice(b"this is not a record\r\n");
        data.extend(record("response", b"def"));
        let mut iter = iter(data, ArchiveIteratorConfig::default().with_strict_mode(true));
        let results: Vec<Result<FrozenRecord>> = iter.frozen().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::InvalidStartLine(_))));
        assert_eq!(iter.outcome(), Outcome::Failed);
    }

    #[test]
    fn test_truncated_tail_ends_cleanly() {
        let mut data = record("warcinfo", b"abc");
        let second = record("response", b"0123456789");
        data.extend_from_slice(&second[..second.len() - 8]);
        let mut iter = iter(data, ArchiveIteratorConfig::default());
        let results: Vec<Result<FrozenRecord>> = iter.frozen().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Truncated)));
        assert!(iter.next_record().is_none());
        assert_eq!(iter.outcome(), Outcome::Completed);
    }

    #[test]
    fn test_zero_time_budget_terminates() {
        let mut data = record("warcinfo", b"abc");
        data.extend(record("response", b"def"));
        let budget = ParseBudget::default().with_max_record_time(Duration::ZERO);
        let mut iter = iter(data, ArchiveIteratorConfig::default().with_budget(budget));
        assert!(iter.next_record().is_none());
        assert_eq!(iter.outcome(), Outcome::Completed);
        assert_eq!(iter.take_diagnostics().len(), 2);
    }

    #[test]
    fn test_invalid_config() {
        let config = ArchiveIteratorConfig::default().with_chunk_size(0);
        assert!(matches!(
            ArchiveIterator::new(Cursor::new(Vec::new()), config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_seekable_skip() {
        let mut data = record("resource", &[b'x'; 4096]);
        data.extend(record("metadata", b"m"));
        let config = ArchiveIteratorConfig::default().with_chunk_size(256).with_budget(
            ParseBudget::default().with_max_line_bytes(128).with_max_header_bytes(1024),
        );
        let mut iter = ArchiveIterator::from_seekable(Cursor::new(data), config).unwrap();
        drop(iter.next_record().unwrap().unwrap());
        let record = iter.next_record().unwrap().unwrap();
        assert_eq!(record.record_type(), &WarcRecordType::Metadata);
    }
}
