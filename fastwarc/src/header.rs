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

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;

use encoding::all::WINDOWS_1252;
use encoding::{DecoderTrap, Encoding};

use crate::error::{Error, Result};

/// Header name that compares and hashes ASCII case-insensitively.
#[derive(Debug, Clone, Eq)]
pub struct CaseInsensitiveKey(String);

impl CaseInsensitiveKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for CaseInsensitiveKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::hash::Hash for CaseInsensitiveKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl From<&str> for CaseInsensitiveKey {
    fn from(key: &str) -> Self {
        CaseInsensitiveKey(key.to_owned())
    }
}

impl From<String> for CaseInsensitiveKey {
    fn from(key: String) -> Self {
        CaseInsensitiveKey(key)
    }
}

impl From<CaseInsensitiveKey> for String {
    fn from(key: CaseInsensitiveKey) -> Self {
        key.0
    }
}

/// Text encoding used for lazily decoding header bytes.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum HeaderEncoding {
    /// UTF-8 (WARC headers).
    Unicode,
    /// Windows-1252 (HTTP headers).
    Latin1,
}

/// Ordered header block of a WARC record or HTTP message.
///
/// Keys and values are stored as raw bytes in their original order and decoded
/// only on access. Duplicate keys are kept as separate entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMap {
    encoding: HeaderEncoding,
    status_line: Vec<u8>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
}

impl HeaderMap {
    /// Empty header block whose values are decoded with `encoding`.
    pub fn new(encoding: HeaderEncoding) -> Self {
        HeaderMap {
            encoding,
            status_line: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Parse a complete in-memory header block (status line, header lines, blank line).
    ///
    /// Lines that are neither headers nor continuations are folded into the
    /// previous value instead of failing, which is how HTTP header blocks in
    /// the wild have to be read.
    pub fn parse_block(block: &[u8], encoding: HeaderEncoding) -> Self {
        let mut headers = HeaderMap::new(encoding);
        let mut lines = block.split_inclusive(|&b| b == b'\n');
        if let Some(status) = lines.next() {
            headers.set_status_line(strip_line_ending(status));
        }
        for line in lines {
            let line = strip_line_ending(line);
            if line.is_empty() {
                break;
            }
            if headers.push_line(line).is_err() {
                headers.add_continuation(line.trim_ascii());
            }
        }
        headers
    }

    pub fn encoding(&self) -> HeaderEncoding {
        self.encoding
    }

    /// First line of the block (`WARC/1.1`, `HTTP/1.1 200 OK`, ...).
    pub fn status_line(&self) -> String {
        self.decode(&self.status_line)
    }

    pub fn status_line_bytes(&self) -> &[u8] {
        &self.status_line
    }

    pub fn set_status_line(&mut self, status_line: impl AsRef<[u8]>) {
        self.status_line = status_line.as_ref().to_vec();
    }

    /// Status code of an HTTP response block.
    pub fn status_code(&self) -> Option<u16> {
        let (code, _) = self.http_status()?;
        std::str::from_utf8(code).ok()?.parse().ok()
    }

    /// Reason phrase of an HTTP response block, if one was given.
    pub fn reason_phrase(&self) -> Option<String> {
        let (_, reason) = self.http_status()?;
        reason.map(|r| self.decode(r))
    }

    /// Split an `HTTP/x.y <code> <reason>` status line.
    fn http_status(&self) -> Option<(&[u8], Option<&[u8]>)> {
        if !self.status_line.starts_with(b"HTTP/") {
            return None;
        }
        let mut fields = self.status_line.splitn(3, |&b| b == b' ');
        let _version = fields.next()?;
        Some((fields.next()?, fields.next()))
    }

    fn decode(&self, bytes: &[u8]) -> String {
        match self.encoding {
            HeaderEncoding::Unicode => String::from_utf8_lossy(bytes).into_owned(),
            HeaderEncoding::Latin1 => WINDOWS_1252
                .decode(bytes, DecoderTrap::Replace)
                .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Decoded value of a header, looked up case-insensitively.
    ///
    /// Repeated headers are joined with `","`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_bytes(key.as_bytes()).map(|v| self.decode(&v))
    }

    /// Raw value of a header, looked up case-insensitively.
    ///
    /// Repeated headers are joined with `","`.
    pub fn get_bytes(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut values = self.get_all_bytes(key);
        let mut joined = values.next()?.to_vec();
        for value in values {
            joined.push(b',');
            joined.extend_from_slice(value);
        }
        Some(joined)
    }

    /// First raw value for a (case-insensitive) header key.
    pub fn get_first_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_slice())
    }

    /// All raw values for a (case-insensitive) header key in order of appearance.
    pub fn get_all_bytes<'a, 'k>(&'a self, key: &'k [u8]) -> impl Iterator<Item = &'a [u8]> + use<'a, 'k> {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_slice())
    }

    /// All decoded values for a (case-insensitive) header key in order of appearance.
    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.get_all_bytes(key.as_bytes()).map(|v| self.decode(v)).collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get_first_bytes(key.as_bytes()).is_some()
    }

    /// Add a header at the end, keeping any existing ones with the same name.
    pub fn append(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) {
        self.append_bytes(key.as_ref().as_bytes(), value.as_ref().as_bytes());
    }

    /// Add a raw header at the end. Surrounding whitespace is trimmed.
    pub fn append_bytes(&mut self, key: &[u8], value: &[u8]) {
        self.headers.push((key.trim_ascii().to_vec(), value.trim_ascii().to_vec()));
    }

    /// Add a single `Name: Value` or continuation line (without line ending).
    ///
    /// Fails with [`Error::InvalidHeader`] if the line is neither.
    pub fn push_line(&mut self, line: &[u8]) -> Result<()> {
        if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
            self.add_continuation(line.trim_ascii());
            return Ok(());
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(Error::InvalidHeader(Error::excerpt(line)));
        };
        let name = &line[..colon];
        if !is_token(name) {
            return Err(Error::InvalidHeader(Error::excerpt(line)));
        }
        self.append_bytes(name, &line[colon + 1..]);
        Ok(())
    }

    /// Decoded `(key, value)` pairs in order, duplicates included.
    pub fn items(&self) -> impl Iterator<Item = (String, String)> + use<'_> {
        self.headers.iter().map(|(k, v)| (self.decode(k), self.decode(v)))
    }

    /// Raw `(key, value)` pairs in order, duplicates included.
    pub fn items_bytes(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = String> + use<'_> {
        self.items_bytes().map(|(k, _)| self.decode(k))
    }

    pub fn values(&self) -> impl Iterator<Item = String> + use<'_> {
        self.items_bytes().map(|(_, v)| self.decode(v))
    }

    /// Collected [`HeaderMap::items`].
    pub fn to_tuples(&self) -> Vec<(String, String)> {
        self.items().collect()
    }

    /// Headers keyed case-insensitively, with repeated values joined by `","`.
    pub fn to_map(&self) -> HashMap<CaseInsensitiveKey, String> {
        self.items().fold(HashMap::new(), |mut map, (key, value)| {
            match map.entry(CaseInsensitiveKey::from(key)) {
                Entry::Occupied(mut e) => {
                    e.get_mut().push(',');
                    e.get_mut().push_str(&value);
                }
                Entry::Vacant(e) => {
                    e.insert(value);
                }
            }
            map
        })
    }

    /// Number of header lines (not counting the status line).
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Serialize the block with `CRLF` line endings and return the number of bytes written.
    ///
    /// The block is written without the terminating blank line.
    pub fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<usize> {
        let mut written = 0;
        if !self.status_line.is_empty() {
            written += write_line(writer, &[self.status_line.as_slice()])?;
        }
        for (key, value) in &self.headers {
            // Orphaned continuation lines have no name.
            written += if key.is_empty() {
                write_line(writer, &[value.as_slice()])?
            } else {
                write_line(writer, &[key.as_slice(), &b": "[..], value.as_slice()])?
            };
        }
        Ok(written)
    }

    fn add_continuation(&mut self, value: &[u8]) {
        match self.headers.last_mut() {
            Some((_, last)) => {
                last.push(b' ');
                last.extend_from_slice(value);
            }
            None => self.headers.push((Vec::new(), value.to_vec())),
        }
    }
}

fn write_line<W: io::Write>(writer: &mut W, parts: &[&[u8]]) -> io::Result<usize> {
    let mut n = 2;
    for part in parts {
        writer.write_all(part)?;
        n += part.len();
    }
    writer.write_all(b"\r\n")?;
    Ok(n)
}

/// Strip a trailing `\n` or `\r\n`.
pub(crate) fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// RFC 7230 token characters (header field names).
fn is_token(name: &[u8]) -> bool {
    !name.is_empty()
        && name.iter().all(|&b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warc_headers() -> HeaderMap {
        let mut headers = HeaderMap::new(HeaderEncoding::Unicode);
        headers.set_status_line(b"WARC/1.1");
        headers.push_line(b"WARC-Type: response").unwrap();
        headers.push_line(b"warc-concurrent-to: <urn:a>").unwrap();
        headers.push_line(b"WARC-Concurrent-To:<urn:b>").unwrap();
        headers.push_line(b"Content-Length: 42 ").unwrap();
        headers
    }

    #[test]
    fn test_duplicates_and_case() {
        let headers = warc_headers();
        assert_eq!(headers.len(), 4);
        assert_eq!(headers.get("warc-type").unwrap(), "response");
        assert_eq!(headers.get("WARC-Concurrent-To").unwrap(), "<urn:a>,<urn:b>");
        assert_eq!(headers.get_all("WARC-CONCURRENT-TO"), vec!["<urn:a>", "<urn:b>"]);
        assert_eq!(headers.get_first_bytes(b"content-length").unwrap(), b"42");
        assert!(headers.contains_key("CONTENT-LENGTH"));
        assert!(headers.get("missing").is_none());
    }

    #[test]
    fn test_value_outlives_lookup_key() {
        let headers = warc_headers();
        let first = {
            let key = String::from("warc-type");
            headers.get_first_bytes(key.as_bytes())
        };
        assert_eq!(first, Some(&b"response"[..]));

        let all: Vec<&[u8]> = {
            let key = b"WARC-Concurrent-To".to_vec();
            headers.get_all_bytes(&key).collect()
        };
        assert_eq!(all, [&b"<urn:a>"[..], &b"<urn:b>"[..]]);
    }

    #[test]
    fn test_order_preserved() {
        let keys: Vec<String> = warc_headers().keys().collect();
        assert_eq!(keys, ["WARC-Type", "warc-concurrent-to", "WARC-Concurrent-To", "Content-Length"]);
    }

    #[test]
    fn test_to_map_merges_duplicates() {
        let map = warc_headers().to_map();
        assert_eq!(map.len(), 3);
        assert_eq!(map[&CaseInsensitiveKey::from("warc-concurrent-to")], "<urn:a>,<urn:b>");
    }

    #[test]
    fn test_invalid_lines() {
        let mut headers = HeaderMap::new(HeaderEncoding::Unicode);
        assert!(matches!(headers.push_line(b"no colon here"), Err(Error::InvalidHeader(_))));
        assert!(matches!(headers.push_line(b"Bad Name: x"), Err(Error::InvalidHeader(_))));
        assert!(matches!(headers.push_line(b": empty"), Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_continuation() {
        let mut headers = HeaderMap::new(HeaderEncoding::Unicode);
        headers.push_line(b"X-Long: first").unwrap();
        headers.push_line(b"\t second").unwrap();
        assert_eq!(headers.get("x-long").unwrap(), "first second");
    }

    #[test]
    fn test_write_roundtrip() {
        let headers = warc_headers();
        let mut out = Vec::new();
        let n = headers.write(&mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(
            out,
            b"WARC/1.1\r\nWARC-Type: response\r\nwarc-concurrent-to: <urn:a>\r\n\
              WARC-Concurrent-To: <urn:b>\r\nContent-Length: 42\r\n"
        );
    }

    #[test]
    fn test_http_block() {
        let block = b"HTTP/1.1 404 Not Found\r\nContent-Type: text/html; charset=\xe4\r\nbroken line\r\n\r\n";
        let headers = HeaderMap::parse_block(block, HeaderEncoding::Latin1);
        assert_eq!(headers.status_code(), Some(404));
        assert_eq!(headers.reason_phrase().unwrap(), "Not Found");
        assert_eq!(headers.get("content-type").unwrap(), "text/html; charset=\u{e4} broken line");
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_non_http_status() {
        let headers = warc_headers();
        assert_eq!(headers.status_line(), "WARC/1.1");
        assert_eq!(headers.status_code(), None);
        assert_eq!(headers.reason_phrase(), None);
    }
}
