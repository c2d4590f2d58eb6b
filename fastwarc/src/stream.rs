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

//! Transparent decompression of archive streams.
//!
//! [`StreamReader`] inspects the first bytes of its [`RawSource`] and picks one
//! of three modes:
//!
//! - **Gzip**: a sequence of independent gzip members, usually one per record.
//!   Each member is decoded by its own [`flate2::bufread::GzDecoder`], which
//!   consumes exactly the member's bytes, so the next member's magic can be
//!   probed and its compressed start offset recorded.
//! - **LZ4**: a sequence of LZ4 frames, decoded by [`lz4_flex::frame::FrameDecoder`].
//!   The decoder reads across frame boundaries on its own, so only the first
//!   frame's offset is known and later raw offsets are approximate.
//! - **None**: bytes pass through unmodified without a second buffer.
//!
//! In all modes the reader implements [`BufferedRead`], so the record framer
//! never needs to know whether the input is compressed.

use std::collections::VecDeque;
use std::io::{self, Read};

use flate2::bufread::GzDecoder;
use lz4_flex::frame::FrameDecoder;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::source::{BufferedRead, RawSource, SourceIo};

/// Gzip member magic number.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// LZ4 frame magic number (little-endian `0x184D2204`).
pub const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

/// Compression of an archive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMode {
    None,
    Gzip,
    Lz4,
}

impl CompressionMode {
    /// Detect the compression mode from the first bytes of a stream.
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(&GZIP_MAGIC) {
            CompressionMode::Gzip
        } else if prefix.starts_with(&LZ4_MAGIC) {
            CompressionMode::Lz4
        } else {
            CompressionMode::None
        }
    }

    /// Magic number introducing a compression member.
    pub fn magic(&self) -> &'static [u8] {
        match self {
            CompressionMode::None => &[],
            CompressionMode::Gzip => &GZIP_MAGIC,
            CompressionMode::Lz4 => &LZ4_MAGIC,
        }
    }

    /// Whether the stream consists of independently compressed members.
    pub fn is_compressed(&self) -> bool {
        *self != CompressionMode::None
    }
}

/// Decoder state over the owned raw source.
enum Codec<R: Read> {
    Plain(RawSource<R>),
    Gzip(GzDecoder<SourceIo<R>>),
    Lz4(FrameDecoder<SourceIo<R>>),
    /// Source parked between members (end of stream or awaiting realignment).
    Idle(RawSource<R>, CompressionMode),
}

impl<R: Read> Codec<R> {
    fn new(mode: CompressionMode, source: RawSource<R>) -> Self {
        match mode {
            CompressionMode::None => Codec::Plain(source),
            CompressionMode::Gzip => Codec::Gzip(GzDecoder::new(SourceIo(source))),
            CompressionMode::Lz4 => Codec::Lz4(FrameDecoder::new(SourceIo(source))),
        }
    }

    fn mode(&self) -> CompressionMode {
        match self {
            Codec::Plain(_) => CompressionMode::None,
            Codec::Gzip(_) => CompressionMode::Gzip,
            Codec::Lz4(_) => CompressionMode::Lz4,
            Codec::Idle(_, mode) => *mode,
        }
    }

    fn source(&self) -> &RawSource<R> {
        match self {
            Codec::Plain(source) | Codec::Idle(source, _) => source,
            Codec::Gzip(decoder) => &decoder.get_ref().0,
            Codec::Lz4(decoder) => &decoder.get_ref().0,
        }
    }

    fn source_mut(&mut self) -> &mut RawSource<R> {
        match self {
            Codec::Plain(source) | Codec::Idle(source, _) => source,
            Codec::Gzip(decoder) => &mut decoder.get_mut().0,
            Codec::Lz4(decoder) => &mut decoder.get_mut().0,
        }
    }

    fn into_source(self) -> RawSource<R> {
        match self {
            Codec::Plain(source) | Codec::Idle(source, _) => source,
            Codec::Gzip(decoder) => decoder.into_inner().0,
            Codec::Lz4(decoder) => decoder.into_inner().0,
        }
    }

    fn decode(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            Codec::Gzip(decoder) => decoder.read(out),
            Codec::Lz4(decoder) => decoder.read(out),
            Codec::Plain(source) => {
                let avail = source.fill_to(out.len()).map_err(io::Error::from)?;
                let n = avail.min(out.len());
                out[..n].copy_from_slice(&source.buffer()[..n]);
                source.consume(n);
                Ok(n)
            }
            Codec::Idle(..) => Ok(0),
        }
    }
}

/// Decompression state of a [`StreamReader`].
///
/// Positions are tracked in two coordinate spaces: `position` counts
/// decompressed bytes consumed by the caller, while member start offsets
/// refer to the raw (compressed) input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    mode: CompressionMode,
    position: u64,
    decoded: u64,
    members: u64,
    member_raw_start: u64,
    member_starts: VecDeque<(u64, u64)>,
    exhausted: bool,
    broken: bool,
}

impl StreamCursor {
    fn new(mode: CompressionMode) -> Self {
        StreamCursor {
            mode,
            position: 0,
            decoded: 0,
            members: 0,
            member_raw_start: 0,
            member_starts: VecDeque::new(),
            exhausted: false,
            broken: false,
        }
    }

    fn start_member(&mut self, raw_start: u64) {
        self.members += 1;
        self.member_raw_start = raw_start;
        self.member_starts.push_back((self.decoded, raw_start));
    }

    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    /// Number of compression members started so far.
    pub fn members(&self) -> u64 {
        self.members
    }

    /// Raw offset of the member currently being decoded.
    pub fn member_raw_start(&self) -> u64 {
        self.member_raw_start
    }

    /// Whether the decoder hit corrupt data and needs to be realigned.
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

/// Outcome of realigning a broken compressed stream to the next member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realign {
    /// A new member starts at the current raw position.
    Aligned { skipped: u64 },
    /// The raw input ended before another member was found.
    EndOfStream { skipped: u64 },
    /// The byte budget ran out before another member was found.
    Exhausted { skipped: u64 },
}

/// Decompressing reader with the [`BufferedRead`] contract.
pub struct StreamReader<R: Read> {
    codec: Option<Codec<R>>,
    cursor: StreamCursor,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl<R: Read> StreamReader<R> {
    /// Open a stream over `inner`, detecting its compression from the first bytes.
    pub fn open(inner: R, capacity: usize) -> Result<Self> {
        Self::new(RawSource::new(inner, capacity))
    }

    /// Create a stream over an existing raw source, detecting its compression.
    pub fn new(mut source: RawSource<R>) -> Result<Self> {
        let avail = source.fill_to(LZ4_MAGIC.len())?;
        let mode = CompressionMode::detect(&source.buffer()[..avail]);
        debug!(?mode, "detected stream compression");

        let mut cursor = StreamCursor::new(mode);
        let buf = if mode.is_compressed() {
            cursor.start_member(source.position());
            vec![0u8; source.capacity()].into_boxed_slice()
        } else {
            Box::default()
        };
        Ok(StreamReader {
            codec: Some(Codec::new(mode, source)),
            cursor,
            buf,
            start: 0,
            end: 0,
        })
    }

    pub fn cursor(&self) -> &StreamCursor {
        &self.cursor
    }

    pub fn mode(&self) -> CompressionMode {
        self.cursor.mode
    }

    /// Whether the current position is the first decompressed byte of a compression member.
    ///
    /// Always `false` for uncompressed streams.
    pub fn member_boundary(&self) -> bool {
        self.cursor
            .member_starts
            .front()
            .is_some_and(|&(decoded, _)| decoded == self.cursor.position)
    }

    /// Distance in decompressed bytes to the next known member start after the current position.
    ///
    /// Only members whose first bytes have already been decoded are known.
    pub fn distance_to_next_member(&self) -> Option<u64> {
        let position = self.cursor.position;
        self.cursor
            .member_starts
            .iter()
            .find(|&&(decoded, _)| decoded > position)
            .map(|&(decoded, _)| decoded - position)
    }

    /// Whether no further raw input exists.
    pub fn raw_exhausted(&mut self) -> Result<bool> {
        match self.codec.as_mut() {
            Some(codec) => Ok(codec.source_mut().fill_to(1)? == 0),
            None => Ok(true),
        }
    }

    /// Skip raw input up to the next member magic after the decoder hit corrupt data.
    ///
    /// Undelivered decompressed bytes of the broken member are discarded.
    /// At most `max_bytes` raw bytes are skipped.
    pub fn realign(&mut self, max_bytes: u64) -> Result<Realign> {
        let Some(codec) = self.codec.take() else {
            return Ok(Realign::EndOfStream { skipped: 0 });
        };
        let mode = codec.mode();
        let mut source = codec.into_source();

        let discarded = (self.end - self.start) as u64;
        self.start = 0;
        self.end = 0;
        self.cursor.position += discarded;
        self.cursor.decoded = self.cursor.position;
        self.cursor.member_starts.clear();

        let skip_current = source.position() == self.cursor.member_raw_start;
        let outcome = scan_for_magic(&mut source, mode.magic(), max_bytes, skip_current);
        match outcome {
            Ok(Realign::Aligned { skipped }) => {
                debug!(skipped, raw_offset = source.position(), "realigned to compression member");
                self.cursor.broken = false;
                self.cursor.exhausted = false;
                self.cursor.start_member(source.position());
                self.codec = Some(Codec::new(mode, source));
            }
            Ok(Realign::EndOfStream { .. }) => {
                self.cursor.broken = false;
                self.cursor.exhausted = true;
                self.codec = Some(Codec::Idle(source, mode));
            }
            _ => self.codec = Some(Codec::Idle(source, mode)),
        }
        outcome
    }

    fn source(&self) -> Option<&RawSource<R>> {
        self.codec.as_ref().map(Codec::source)
    }

    fn plain(&mut self) -> Option<&mut RawSource<R>> {
        match self.codec.as_mut() {
            Some(Codec::Plain(source)) => Some(source),
            _ => None,
        }
    }

    fn decode_error(&mut self, err: io::Error) -> Error {
        let io_failed = self
            .codec
            .as_mut()
            .is_some_and(|codec| codec.source_mut().take_io_failure());
        if io_failed {
            return Error::Io(err);
        }
        self.cursor.broken = true;
        Error::Decompression(err.to_string())
    }

    /// Advance to the next compression member after the current one has ended.
    fn next_member(&mut self) -> Result<()> {
        let Some(codec) = self.codec.take() else {
            self.cursor.exhausted = true;
            return Ok(());
        };
        let mode = codec.mode();
        let mut source = codec.into_source();
        let raw_start = source.position();
        let magic = mode.magic();

        let probe = source
            .fill_to(magic.len())
            .map(|avail| (avail, source.buffer()[..avail].starts_with(magic)));
        match probe {
            Ok((_, true)) => {
                trace!(raw_start, "next compression member");
                self.cursor.start_member(raw_start);
                self.codec = Some(Codec::new(mode, source));
                Ok(())
            }
            Ok((0, false)) => {
                self.cursor.exhausted = true;
                self.codec = Some(Codec::Idle(source, mode));
                Ok(())
            }
            Ok((_, false)) => {
                self.cursor.broken = true;
                self.codec = Some(Codec::Idle(source, mode));
                Err(Error::Decompression(format!(
                    "unexpected data after compression member at offset {raw_start}"
                )))
            }
            Err(e) => {
                self.codec = Some(Codec::Idle(source, mode));
                Err(e)
            }
        }
    }

    fn fill_decoded(&mut self, n: usize) -> Result<usize> {
        let n = n.min(self.buf.len());
        if self.end - self.start < n && self.start + n > self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        while self.end - self.start < n && !self.cursor.exhausted {
            if self.cursor.broken {
                return Err(Error::Decompression("stream is not aligned to a compression member".into()));
            }
            let Some(codec) = self.codec.as_mut() else {
                self.cursor.exhausted = true;
                break;
            };
            match codec.decode(&mut self.buf[self.end..]) {
                Ok(0) => self.next_member()?,
                Ok(k) => {
                    self.end += k;
                    self.cursor.decoded += k as u64;
                }
                Err(e) => return Err(self.decode_error(e)),
            }
        }
        Ok(self.end - self.start)
    }
}

impl<R: Read> BufferedRead for StreamReader<R> {
    fn fill_to(&mut self, n: usize) -> Result<usize> {
        match self.plain() {
            Some(source) => source.fill_to(n),
            None => self.fill_decoded(n),
        }
    }

    fn buffer(&self) -> &[u8] {
        match &self.codec {
            Some(Codec::Plain(source)) => source.buffer(),
            _ => &self.buf[self.start..self.end],
        }
    }

    fn consume(&mut self, n: usize) {
        if let Some(source) = self.plain() {
            source.consume(n);
            return;
        }
        let n = n.min(self.end - self.start);
        self.start += n;
        self.cursor.position += n as u64;
        let position = self.cursor.position;
        while self.cursor.member_starts.front().is_some_and(|&(decoded, _)| decoded < position) {
            self.cursor.member_starts.pop_front();
        }
    }

    fn position(&self) -> u64 {
        match &self.codec {
            Some(Codec::Plain(source)) => source.position(),
            _ => self.cursor.position,
        }
    }

    fn capacity(&self) -> usize {
        match &self.codec {
            Some(Codec::Plain(source)) => source.capacity(),
            _ => self.buf.len(),
        }
    }

    /// Raw offset of the current position.
    ///
    /// At a member boundary this is the exact compressed offset of the member.
    /// Inside a member, compressed and decompressed offsets do not map onto
    /// each other and the raw bytes consumed so far are reported instead.
    fn raw_position(&mut self) -> u64 {
        if let Some(source) = self.plain() {
            return source.position();
        }
        if self.start == self.end && !self.cursor.exhausted && !self.cursor.broken {
            // Let the decoder consume the member trailer and probe the next member.
            if let Err(e) = self.fill_decoded(1) {
                trace!(error = %e, "failed to settle stream position");
            }
        }
        let position = self.cursor.position;
        self.cursor
            .member_starts
            .iter()
            .find(|&&(decoded, _)| decoded == position)
            .map(|&(_, raw)| raw)
            .or_else(|| self.source().map(RawSource::position))
            .unwrap_or_default()
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        if let Some(source) = self.plain() {
            return source.skip(n);
        }
        let mut skipped = 0u64;
        while skipped < n {
            let avail = self.fill_decoded(1)?;
            if avail == 0 {
                break;
            }
            let take = avail.min(usize::try_from(n - skipped).unwrap_or(usize::MAX));
            self.consume(take);
            skipped += take as u64;
        }
        Ok(skipped)
    }
}

/// Scan raw input for the next occurrence of `magic`, consuming everything before it.
fn scan_for_magic<R: Read>(
    source: &mut RawSource<R>,
    magic: &[u8],
    max_bytes: u64,
    skip_current: bool,
) -> Result<Realign> {
    let mut skipped = 0u64;
    if magic.is_empty() {
        return Ok(Realign::Aligned { skipped });
    }
    if skip_current && source.fill_to(1)? > 0 {
        source.consume(1);
        skipped += 1;
    }
    loop {
        let avail = source.fill_to(source.capacity())?;
        if avail < magic.len() {
            source.consume(avail);
            skipped += avail as u64;
            return Ok(Realign::EndOfStream { skipped });
        }
        match source.buffer().windows(magic.len()).position(|w| w == magic) {
            Some(i) => {
                if skipped + i as u64 > max_bytes {
                    source.consume(avail);
                    return Ok(Realign::Exhausted { skipped: skipped + avail as u64 });
                }
                source.consume(i);
                return Ok(Realign::Aligned { skipped: skipped + i as u64 });
            }
            None => {
                let n = avail - (magic.len() - 1);
                source.consume(n);
                skipped += n as u64;
                if skipped > max_bytes {
                    return Ok(Realign::Exhausted { skipped });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use lz4_flex::frame::FrameEncoder;
    use std::io::{Cursor, Write};

    fn gzip_member(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn lz4_frame(data: &[u8]) -> Vec<u8> {
        let mut enc = FrameEncoder::new(Vec::new());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn read_all<R: Read>(reader: &mut StreamReader<R>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let avail = reader.fill_to(1)?;
            if avail == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&reader.buffer()[..avail]);
            reader.consume(avail);
        }
    }

    #[test]
    fn test_detect() {
        assert_eq!(CompressionMode::detect(&[0x1f, 0x8b, 0x08]), CompressionMode::Gzip);
        assert_eq!(CompressionMode::detect(&LZ4_MAGIC), CompressionMode::Lz4);
        assert_eq!(CompressionMode::detect(b"WARC/1.0"), CompressionMode::None);
        assert_eq!(CompressionMode::detect(b""), CompressionMode::None);
    }

    #[test]
    fn test_passthrough() {
        let mut reader = StreamReader::open(Cursor::new(b"plain text\n".to_vec()), 16).unwrap();
        assert_eq!(reader.mode(), CompressionMode::None);
        assert_eq!(reader.peek_line(16).unwrap(), b"plain text\n");
        assert_eq!(read_all(&mut reader).unwrap(), b"plain text\n");
        assert_eq!(reader.raw_position(), 11);
        assert!(!reader.member_boundary());
    }

    #[test]
    fn test_gzip_members_and_offsets() {
        let first = gzip_member(b"first member\n");
        let second = gzip_member(b"second member\n");
        let mut data = first.clone();
        data.extend_from_slice(&second);

        let mut reader = StreamReader::open(Cursor::new(data.clone()), 64).unwrap();
        assert_eq!(reader.mode(), CompressionMode::Gzip);
        assert!(reader.member_boundary());
        assert_eq!(reader.raw_position(), 0);

        let mut line = Vec::new();
        reader.read_until(b'\n', 64, &mut line).unwrap();
        assert_eq!(line, b"first member\n");
        assert_eq!(reader.raw_position(), first.len() as u64);
        assert!(reader.member_boundary());

        line.clear();
        reader.read_until(b'\n', 64, &mut line).unwrap();
        assert_eq!(line, b"second member\n");
        assert_eq!(reader.raw_position(), data.len() as u64);
        assert_eq!(reader.fill_to(1).unwrap(), 0);
        assert_eq!(reader.cursor().members(), 2);
        assert_eq!(reader.position(), 27);
    }

    #[test]
    fn test_lines_span_members() {
        let mut data = gzip_member(b"split ");
        data.extend_from_slice(&gzip_member(b"line\n"));
        let mut reader = StreamReader::open(Cursor::new(data), 64).unwrap();
        assert_eq!(reader.peek_line(64).unwrap(), b"split line\n");
    }

    #[test]
    fn test_lz4_frames() {
        let mut data = lz4_frame(b"lz4 one\n");
        data.extend_from_slice(&lz4_frame(b"lz4 two\n"));
        let mut reader = StreamReader::open(Cursor::new(data), 64).unwrap();
        assert_eq!(reader.mode(), CompressionMode::Lz4);
        assert_eq!(read_all(&mut reader).unwrap(), b"lz4 one\nlz4 two\n");
    }

    #[test]
    fn test_garbage_after_member_and_realign() {
        let first = gzip_member(b"one\n");
        let third = gzip_member(b"three\n");
        let mut data = first.clone();
        data.extend_from_slice(b"not a gzip member");
        data.extend_from_slice(&third);

        let mut reader = StreamReader::open(Cursor::new(data), 64).unwrap();
        let mut line = Vec::new();
        reader.read_until(b'\n', 64, &mut line).unwrap();
        assert_eq!(line, b"one\n");
        assert!(matches!(reader.fill_to(1), Err(Error::Decompression(_))));
        assert!(reader.cursor().is_broken());
        assert!(!reader.raw_exhausted().unwrap());

        assert_eq!(reader.realign(1024).unwrap(), Realign::Aligned { skipped: 17 });
        assert_eq!(reader.raw_position(), first.len() as u64 + 17);
        assert_eq!(read_all(&mut reader).unwrap(), b"three\n");
    }

    #[test]
    fn test_realign_budget() {
        let mut data = gzip_member(b"one\n");
        data.extend_from_slice(&[b'x'; 200]);
        data.extend_from_slice(&gzip_member(b"two\n"));

        let mut reader = StreamReader::open(Cursor::new(data), 64).unwrap();
        reader.skip(4).unwrap();
        assert!(reader.fill_to(1).is_err());
        assert!(matches!(reader.realign(50).unwrap(), Realign::Exhausted { .. }));
    }

    #[test]
    fn test_truncated_member() {
        let mut data = gzip_member(b"a complete record that is long enough\n");
        data.truncate(data.len() - 12);
        let mut reader = StreamReader::open(Cursor::new(data), 64).unwrap();
        assert!(matches!(read_all(&mut reader), Err(Error::Decompression(_))));
        assert!(reader.raw_exhausted().unwrap());
        assert!(matches!(reader.realign(1024).unwrap(), Realign::EndOfStream { .. }));
        assert_eq!(reader.fill_to(1).unwrap(), 0);
    }
}
