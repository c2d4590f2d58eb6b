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

//! Recovery from corrupt records.
//!
//! After a failed frame, the [`Resynchronizer`] scans forward for the next
//! plausible record start line. Uncompressed and LZ4 streams are scanned byte
//! by byte (the LZ4 decoder runs across frame boundaries, so those are not
//! observable). Gzip streams are only searched at member boundaries, since a
//! record never starts in the middle of a member and the bytes of a broken
//! member are meaningless. A decoder that hit corrupt data is realigned on the
//! next member magic in the raw input.

use std::io::Read;

use tracing::{debug, warn};

use crate::config::ParseBudget;
use crate::error::{Error, Result};
use crate::framer::StartLine;
use crate::header::strip_line_ending;
use crate::source::BufferedRead;
use crate::stream::{CompressionMode, Realign, StreamReader};

const WARC_MAGIC: &[u8] = b"WARC/";

/// Raw byte range skipped while resynchronizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SkippedRange {
    pub start: u64,
    pub end: u64,
}

impl SkippedRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<SkippedRange> for Error {
    fn from(range: SkippedRange) -> Self {
        Error::CorruptRecordSkipped { start: range.start, end: range.end }
    }
}

/// Where the failed frame started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOrigin {
    /// Decompressed offset.
    pub position: u64,
    /// Raw offset.
    pub raw: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// A plausible record start was found at the end of the range.
    Found(SkippedRange),
    /// The input ended while scanning.
    EndOfStream(SkippedRange),
    /// No record start within the scan budget.
    Exhausted { offset: u64, scanned: u64 },
}

/// Scans forward for the next record start after a framing failure.
#[derive(Debug, Clone)]
pub struct Resynchronizer {
    max_bytes: u64,
    max_line: usize,
    accept_arc: bool,
}

impl Resynchronizer {
    pub fn new(budget: &ParseBudget) -> Self {
        Resynchronizer {
            max_bytes: budget.max_resync_bytes(),
            max_line: budget.max_line_bytes(),
            accept_arc: false,
        }
    }

    /// Also accept ARC record lines as record starts.
    ///
    /// ARC lines have no fixed prefix, so every line start becomes a candidate.
    pub fn set_accept_arc(&mut self, accept_arc: bool) {
        self.accept_arc = accept_arc;
    }

    /// Skip forward from a failed frame to the next record start.
    ///
    /// Always advances at least one byte past `origin`, so a frame that keeps
    /// failing at the same position cannot stall the caller.
    pub fn resync<R: Read>(&self, reader: &mut StreamReader<R>, origin: FrameOrigin) -> Result<ResyncOutcome> {
        let skip_first = reader.position() == origin.position;
        let result = match reader.mode() {
            CompressionMode::Gzip => self.scan_members(reader, origin, skip_first),
            CompressionMode::Lz4 | CompressionMode::None => self.scan_bytes(reader, origin, skip_first),
        };
        match &result {
            Ok(ResyncOutcome::Found(range)) => {
                debug!(start = range.start, end = range.end, "resynchronized on record start");
            }
            Ok(ResyncOutcome::Exhausted { offset, scanned }) => {
                warn!(offset, scanned, "no record start found within resync budget");
            }
            _ => {}
        }
        result
    }

    fn scan_bytes<R: Read>(
        &self,
        reader: &mut StreamReader<R>,
        origin: FrameOrigin,
        mut skip_first: bool,
    ) -> Result<ResyncOutcome> {
        let mut scanned = 0u64;
        loop {
            if scanned > self.max_bytes {
                return Ok(ResyncOutcome::Exhausted { offset: origin.raw, scanned });
            }
            if reader.cursor().is_broken() {
                skip_first = false;
                if let Some(outcome) = self.realign(reader, origin, &mut scanned)? {
                    return Ok(outcome);
                }
                continue;
            }
            let capacity = reader.capacity();
            let avail = match reader.fill_to(capacity) {
                Ok(avail) => avail,
                Err(Error::Decompression(_)) if reader.cursor().is_broken() => continue,
                Err(e) => return Err(e),
            };
            if avail == 0 {
                return Ok(ResyncOutcome::EndOfStream(range(origin, reader)));
            }
            if skip_first {
                skip_first = false;
                reader.consume(1);
                scanned += 1;
                continue;
            }

            match find_candidate(&reader.buffer()[..avail], self.accept_arc) {
                Some(i) => {
                    reader.consume(i);
                    scanned += i as u64;
                    if scanned > self.max_bytes {
                        continue;
                    }
                    if self.at_record_start(reader)? {
                        return Ok(ResyncOutcome::Found(range(origin, reader)));
                    }
                    reader.consume(1);
                    scanned += 1;
                }
                None => {
                    // Keep a possible partial magic at the end of a full buffer.
                    let keep = if avail == capacity { WARC_MAGIC.len() - 1 } else { 0 };
                    let n = (avail - keep).max(1);
                    reader.consume(n);
                    scanned += n as u64;
                }
            }
        }
    }

    fn scan_members<R: Read>(
        &self,
        reader: &mut StreamReader<R>,
        origin: FrameOrigin,
        mut skip_first: bool,
    ) -> Result<ResyncOutcome> {
        let mut scanned = 0u64;
        loop {
            if scanned > self.max_bytes {
                return Ok(ResyncOutcome::Exhausted { offset: origin.raw, scanned });
            }
            if reader.cursor().is_broken() {
                // Realigning moves forward in the raw input, which is progress enough.
                skip_first = false;
                if let Some(outcome) = self.realign(reader, origin, &mut scanned)? {
                    return Ok(outcome);
                }
                continue;
            }

            // Decoding at most one member ahead keeps later members out of a broken buffer.
            let avail = match reader.fill_to(1) {
                Ok(0) => return Ok(ResyncOutcome::EndOfStream(range(origin, reader))),
                Ok(_) => reader.buffer().len(),
                Err(Error::Decompression(_)) if reader.cursor().is_broken() => continue,
                Err(e) => return Err(e),
            };
            if skip_first {
                skip_first = false;
                reader.consume(1);
                scanned += 1;
                continue;
            }
            if reader.member_boundary() && self.at_record_start(reader)? {
                return Ok(ResyncOutcome::Found(range(origin, reader)));
            }
            let n = reader
                .distance_to_next_member()
                .map_or(avail, |d| usize::try_from(d).unwrap_or(usize::MAX).min(avail));
            reader.consume(n);
            scanned += n as u64;
        }
    }

    /// Move a broken decoder to the next member magic.
    ///
    /// Returns `None` once the decoder is usable again.
    fn realign<R: Read>(
        &self,
        reader: &mut StreamReader<R>,
        origin: FrameOrigin,
        scanned: &mut u64,
    ) -> Result<Option<ResyncOutcome>> {
        if reader.raw_exhausted()? {
            return Ok(Some(ResyncOutcome::EndOfStream(range(origin, reader))));
        }
        match reader.realign(self.max_bytes.saturating_sub(*scanned))? {
            Realign::Aligned { skipped } => {
                *scanned += skipped;
                Ok(None)
            }
            Realign::EndOfStream { .. } => Ok(Some(ResyncOutcome::EndOfStream(range(origin, reader)))),
            Realign::Exhausted { skipped } => Ok(Some(ResyncOutcome::Exhausted {
                offset: origin.raw,
                scanned: *scanned + skipped,
            })),
        }
    }

    /// Whether a valid start line begins at the current position.
    fn at_record_start<B: BufferedRead + ?Sized>(&self, reader: &mut B) -> Result<bool> {
        match reader.peek_line(self.max_line) {
            Ok(line) => Ok(line.ends_with(b"\n")
                && StartLine::parse(strip_line_ending(line)).is_some_and(|s| self.accept_arc || s.is_warc())),
            Err(e) if e.is_structural() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn range<R: Read>(origin: FrameOrigin, reader: &mut StreamReader<R>) -> SkippedRange {
    SkippedRange { start: origin.raw, end: reader.raw_position().max(origin.raw) }
}

/// Offset of the next position worth validating as a record start.
fn find_candidate(buf: &[u8], accept_arc: bool) -> Option<usize> {
    let warc = buf.windows(WARC_MAGIC.len()).position(|w| w == WARC_MAGIC);
    if !accept_arc {
        return warc;
    }
    let line_start = buf
        .iter()
        .enumerate()
        .skip(1)
        .find(|&(i, &b)| buf[i - 1] == b'\n' && b != b'\r' && b != b'\n')
        .map(|(i, _)| i);
    match (warc, line_start) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn budget(max_resync: u64) -> ParseBudget {
        ParseBudget::default().with_max_line_bytes(64).with_max_resync_bytes(max_resync)
    }

    fn plain(data: &[u8]) -> StreamReader<Cursor<Vec<u8>>> {
        StreamReader::open(Cursor::new(data.to_vec()), 64).unwrap()
    }

    fn gzip_member(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    const ORIGIN: FrameOrigin = FrameOrigin { position: 0, raw: 0 };

    #[test]
    fn test_find_candidate() {
        assert_eq!(find_candidate(b"xxWARC/1.0", false), Some(2));
        assert_eq!(find_candidate(b"xxWARC", false), None);
        assert_eq!(find_candidate(b"ab\ncd WARC/", true), Some(3));
        assert_eq!(find_candidate(b"ab\n\r\n", true), None);
    }

    #[test]
    fn test_skips_noise() {
        let mut data = vec![b'x'; 150];
        data.extend_from_slice(b"WARC/1.0\r\n\r\n");
        let mut reader = plain(&data);
        let outcome = Resynchronizer::new(&budget(1000)).resync(&mut reader, ORIGIN).unwrap();
        assert_eq!(outcome, ResyncOutcome::Found(SkippedRange { start: 0, end: 150 }));
        assert_eq!(reader.position(), 150);
    }

    #[test]
    fn test_advances_past_failed_start() {
        let mut reader = plain(b"WARC/1.0\r\nWARC/1.1\r\n");
        let outcome = Resynchronizer::new(&budget(1000)).resync(&mut reader, ORIGIN).unwrap();
        assert_eq!(outcome, ResyncOutcome::Found(SkippedRange { start: 0, end: 10 }));
    }

    #[test]
    fn test_rejects_invalid_candidates() {
        let mut reader = plain(b"WARC/bogus\r\nfoo WARC/1.0\r\n");
        let origin = FrameOrigin { position: 1, raw: 0 };
        let outcome = Resynchronizer::new(&budget(1000)).resync(&mut reader, origin).unwrap();
        assert_eq!(outcome, ResyncOutcome::Found(SkippedRange { start: 0, end: 16 }));
    }

    #[test]
    fn test_budget_exhausted() {
        let mut data = vec![b'x'; 500];
        data.extend_from_slice(b"WARC/1.0\r\n\r\n");
        let mut reader = plain(&data);
        let outcome = Resynchronizer::new(&budget(100)).resync(&mut reader, ORIGIN).unwrap();
        assert!(matches!(outcome, ResyncOutcome::Exhausted { offset: 0, scanned } if scanned > 100));
    }

    #[test]
    fn test_end_of_stream() {
        let mut reader = plain(&[b'x'; 90]);
        let outcome = Resynchronizer::new(&budget(1000)).resync(&mut reader, ORIGIN).unwrap();
        assert_eq!(outcome, ResyncOutcome::EndOfStream(SkippedRange { start: 0, end: 90 }));
    }

    #[test]
    fn test_arc_line_starts() {
        let mut reader = plain(b"garbage\nhttp://a/ 1.2.3.4 20240101000000 text/html 0\n");
        let mut resync = Resynchronizer::new(&budget(1000));
        resync.set_accept_arc(true);
        let outcome = resync.resync(&mut reader, ORIGIN).unwrap();
        assert_eq!(outcome, ResyncOutcome::Found(SkippedRange { start: 0, end: 8 }));
    }

    #[test]
    fn test_member_boundaries() {
        let first = gzip_member(b"WARC/1.0\r\nX: WARC/1.0\r\nWARC/1.1\r\n");
        let second = gzip_member(b"WARC/1.1\r\n\r\n");
        let mut data = first.clone();
        data.extend_from_slice(&second);
        let mut reader = StreamReader::open(Cursor::new(data), 64).unwrap();

        let outcome = Resynchronizer::new(&budget(1000)).resync(&mut reader, ORIGIN).unwrap();
        assert_eq!(
            outcome,
            ResyncOutcome::Found(SkippedRange { start: 0, end: first.len() as u64 })
        );
        assert!(reader.member_boundary());
    }

    #[test]
    fn test_lz4_scans_decoded_bytes() {
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
        enc.write_all(b"WARC/1.0\r\nnoise WARC/1.1\r\n\r\n").unwrap();
        let mut reader = StreamReader::open(Cursor::new(enc.finish().unwrap()), 64).unwrap();
        let outcome = Resynchronizer::new(&budget(1000)).resync(&mut reader, ORIGIN).unwrap();
        assert!(matches!(outcome, ResyncOutcome::Found(_)));
        assert_eq!(reader.position(), 16);
    }

    #[test]
    fn test_corrupt_member_is_realigned() {
        let first = gzip_member(b"WARC/1.0\r\n");
        let mut broken = gzip_member(b"WARC/1.0\r\nContent-Length: 0\r\n\r\n");
        for b in &mut broken[10..20] {
            *b = 0xff;
        }
        let third = gzip_member(b"WARC/1.1\r\n\r\n");
        let mut data = first.clone();
        data.extend_from_slice(&broken);
        data.extend_from_slice(&third);

        let mut reader = StreamReader::open(Cursor::new(data), 64).unwrap();
        let outcome = Resynchronizer::new(&budget(1000)).resync(&mut reader, ORIGIN).unwrap();
        let expected_end = (first.len() + broken.len()) as u64;
        assert_eq!(outcome, ResyncOutcome::Found(SkippedRange { start: 0, end: expected_end }));
    }
}
