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

//! Buffered byte source.
//!
//! [`BufferedRead`] is the read contract shared by the raw byte source and the
//! decompressing stream on top of it: bounded lookahead, exact-count reads,
//! delimiter-bounded line reads and position tracking. [`RawSource`] implements
//! it over any [`std::io::Read`] with a single fixed-capacity buffer that is
//! refilled one chunk at a time.

use std::io::{self, BufRead, Read};

use crate::error::{Error, Result};

/// Bounded buffered reading.
///
/// Implementors provide the buffer primitives, all higher-level reads are
/// derived from them. No method allocates more than the buffer capacity,
/// except for [`BufferedRead::read_until`], which is bounded by its `max` argument.
pub trait BufferedRead {
    /// Make at least `n` bytes available in the buffer (capped at the buffer capacity).
    ///
    /// Returns the number of bytes available, which is less than `n` only at end of stream.
    fn fill_to(&mut self, n: usize) -> Result<usize>;

    /// Currently buffered bytes without refilling.
    fn buffer(&self) -> &[u8];

    /// Mark `n` buffered bytes as consumed.
    fn consume(&mut self, n: usize);

    /// Number of bytes consumed so far.
    fn position(&self) -> u64;

    /// Buffer capacity, which bounds every lookahead.
    fn capacity(&self) -> usize;

    /// Offset of the current position in the raw (possibly compressed) input.
    fn raw_position(&mut self) -> u64 {
        self.position()
    }

    /// Skip up to `n` bytes and return how many were skipped (less only at end of stream).
    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0u64;
        while skipped < n {
            let want = usize::try_from(n - skipped).unwrap_or(usize::MAX).min(self.capacity());
            let avail = self.fill_to(1)?.min(want);
            if avail == 0 {
                break;
            }
            self.consume(avail);
            skipped += avail as u64;
        }
        Ok(skipped)
    }

    /// Return up to `n` bytes without consuming them.
    fn peek(&mut self, n: usize) -> Result<&[u8]> {
        let avail = self.fill_to(n)?.min(n);
        Ok(&self.buffer()[..avail])
    }

    /// Fill `out` completely or fail with [`Error::Truncated`].
    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut written = 0;
        while written < out.len() {
            let avail = self.fill_to(1)?;
            if avail == 0 {
                return Err(Error::Truncated);
            }
            let n = avail.min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.buffer()[..n]);
            self.consume(n);
            written += n;
        }
        Ok(())
    }

    /// Append bytes up to and including `delim` to `out` and return the number of bytes read.
    ///
    /// Fails with [`Error::LineTooLong`] after `max` bytes without a delimiter
    /// and with [`Error::Truncated`] if the stream ends in the middle of a line.
    /// Returns `Ok(0)` only at end of stream.
    fn read_until(&mut self, delim: u8, max: usize, out: &mut Vec<u8>) -> Result<usize> {
        let mut read = 0;
        loop {
            let avail = self.fill_to(1)?;
            if avail == 0 {
                return if read == 0 { Ok(0) } else { Err(Error::Truncated) };
            }
            let window = avail.min(max - read);
            let found = self.buffer()[..window].iter().position(|&b| b == delim);
            let n = found.map_or(window, |i| i + 1);
            out.extend_from_slice(&self.buffer()[..n]);
            self.consume(n);
            read += n;
            if found.is_some() {
                return Ok(read);
            }
            if read >= max {
                return Err(Error::LineTooLong { max });
            }
        }
    }

    /// Return the next line including its `\n` terminator without consuming it.
    ///
    /// `max` is capped at the buffer capacity. At end of stream, the remaining
    /// unterminated bytes are returned (an empty slice if nothing is left).
    fn peek_line(&mut self, max: usize) -> Result<&[u8]> {
        let max = max.min(self.capacity());
        let mut scanned = 0;
        loop {
            let avail = self.buffer().len();
            let window = avail.min(max);
            if let Some(i) = self.buffer()[scanned..window].iter().position(|&b| b == b'\n') {
                return Ok(&self.buffer()[..scanned + i + 1]);
            }
            if window >= max {
                return Err(Error::LineTooLong { max });
            }
            scanned = window;
            if self.fill_to(avail + 1)? == avail {
                return Ok(&self.buffer()[..avail.min(max)]);
            }
        }
    }
}

/// Forward-skip hook for seekable resources.
///
/// Moves at most `n` bytes forward, never past the end of the resource, and
/// returns how far it actually moved.
pub(crate) type SeekForward<R> = fn(&mut R, u64) -> io::Result<u64>;

/// Buffered reader over an underlying byte-producing resource.
///
/// Reads from the underlying resource happen one chunk at a time into a
/// fixed-capacity buffer, so no read smaller than the buffer triggers more
/// than one underlying I/O call. The source owns its resource exclusively.
pub struct RawSource<R> {
    inner: R,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    position: u64,
    eof: bool,
    io_failed: bool,
    seek_forward: Option<SeekForward<R>>,
}

impl<R: Read> RawSource<R> {
    /// Create a new source with the given buffer capacity.
    pub fn new(inner: R, capacity: usize) -> Self {
        RawSource {
            inner,
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
            position: 0,
            eof: false,
            io_failed: false,
            seek_forward: None,
        }
    }

    pub(crate) fn with_seek_forward(mut self, seek_forward: SeekForward<R>) -> Self {
        self.seek_forward = Some(seek_forward);
        self
    }

    /// Whether the underlying resource has reported end of stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether the underlying resource has failed since the last call and reset the flag.
    ///
    /// Decoders stacked on top of the source report all failures as `io::Error`,
    /// this tells resource failures apart from corrupt data.
    pub(crate) fn take_io_failure(&mut self) -> bool {
        std::mem::take(&mut self.io_failed)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one chunk from the underlying resource into the free buffer space.
    fn refill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.end == self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        loop {
            match self.inner.read(&mut self.buf[self.end..]) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.end += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.io_failed = true;
                    return Err(e);
                }
            }
        }
    }
}

impl<R: Read> BufferedRead for RawSource<R> {
    fn fill_to(&mut self, n: usize) -> Result<usize> {
        let n = n.min(self.buf.len());
        if self.end - self.start < n && self.start + n > self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        while self.end - self.start < n {
            if self.refill().map_err(Error::Io)? == 0 {
                break;
            }
        }
        Ok(self.end - self.start)
    }

    fn buffer(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.end - self.start);
        self.start += n;
        self.position += n as u64;
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let buffered = (self.end - self.start).min(usize::try_from(n).unwrap_or(usize::MAX));
        self.consume(buffered);
        let rest = n - buffered as u64;
        if rest == 0 {
            return Ok(n);
        }
        match self.seek_forward {
            Some(seek_forward) if !self.eof => {
                let moved = seek_forward(&mut self.inner, rest).map_err(|e| {
                    self.io_failed = true;
                    Error::Io(e)
                })?;
                self.position += moved;
                if moved < rest {
                    self.eof = true;
                }
                Ok(buffered as u64 + moved)
            }
            _ => {
                let mut skipped = buffered as u64;
                while skipped < n {
                    if self.refill().map_err(Error::Io)? == 0 {
                        break;
                    }
                    let take = (self.end - self.start).min(usize::try_from(n - skipped).unwrap_or(usize::MAX));
                    self.consume(take);
                    skipped += take as u64;
                }
                Ok(skipped)
            }
        }
    }
}

/// `io::Read`/`io::BufRead` view of a [`RawSource`] for the decoders stacked on it.
///
/// Kept separate from [`RawSource`] so the [`BufferedRead`] methods never clash
/// with the std traits of the same name.
pub(crate) struct SourceIo<R>(pub(crate) RawSource<R>);

impl<R: Read> Read for SourceIo<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let src = &mut self.0;
        if src.start == src.end && src.refill()? == 0 {
            return Ok(0);
        }
        let n = out.len().min(src.end - src.start);
        out[..n].copy_from_slice(&src.buf[src.start..src.start + n]);
        src.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for SourceIo<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        let src = &mut self.0;
        if src.start == src.end {
            src.refill()?;
        }
        Ok(&src.buf[src.start..src.end])
    }

    fn consume(&mut self, amt: usize) {
        self.0.consume(amt);
    }
}
