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

//! Error types for archive parsing.
//!
//! Errors fall into three groups:
//!
//! - **Structural** errors (`Truncated`, `LineTooLong`, `InvalidStartLine`,
//!   `InvalidHeader`, `HeaderTooLarge`, `InvalidContentLength`, `Decompression`,
//!   `TimeBudgetExceeded`) describe a damaged record. The archive iterator
//!   handles them locally by resynchronizing, unless strict mode is enabled.
//! - **Terminal** errors (`Io`, `UnrecoverableCorruption`) end iteration.
//! - **Diagnostics** (`CorruptRecordSkipped`) are never returned from the
//!   iterator itself, but can be converted from a [`SkippedRange`](crate::resync::SkippedRange)
//!   for callers that want to treat skips as errors.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stream ended inside a record structure")]
    Truncated,

    #[error("line exceeds {max} bytes without terminator")]
    LineTooLong { max: usize },

    #[error("invalid record start line: {0:?}")]
    InvalidStartLine(String),

    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("header block exceeds {max} bytes")]
    HeaderTooLarge { max: usize },

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("record exceeded time budget of {0:?}")]
    TimeBudgetExceeded(Duration),

    #[error("skipped corrupt bytes {start}..{end}")]
    CorruptRecordSkipped { start: u64, end: u64 },

    #[error("no valid record found within {scanned} bytes after offset {offset}")]
    UnrecoverableCorruption { offset: u64, scanned: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Whether the error describes a damaged record that resynchronization may recover from.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Error::Io(_)
                | Error::InvalidConfig(_)
                | Error::CorruptRecordSkipped { .. }
                | Error::UnrecoverableCorruption { .. }
        )
    }

    /// Lossy textual excerpt of a line for error messages.
    pub(crate) fn excerpt(line: &[u8]) -> String {
        const MAX_EXCERPT: usize = 64;
        let line = &line[..line.len().min(MAX_EXCERPT)];
        String::from_utf8_lossy(line.trim_ascii_end()).into_owned()
    }
}

// Body handles implement io::Read, so engine errors travel through io::Error
// and are unwrapped again here.
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Error::Io(io::Error::new(kind, other)),
            None => Error::Io(io::Error::from(kind)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            Error::Truncated => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
