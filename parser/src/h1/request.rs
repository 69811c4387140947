// Copyright 2022 Ryan Seipp
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

//! HTTP/1.1 request line + headers.
//!
//! IETF RFC 9112.

use core::str::from_utf8_unchecked;

use super::tokens::{is_header_value_token, is_request_target_token, is_tchar};
use super::{at_blank_line, ParseError};
use crate::raw_request::RawRequest;
use crate::{Header, Method, Status, Version};

type ParseResult<T> = Result<T, ParseError>;

/// A parsed HTTP/1.1 request line and header block.
///
/// `headers` is caller-supplied storage (typically a fixed-size array
/// initialized with [`crate::EMPTY_HEADER`]); the parser never allocates.
/// Every `&str`/`&[u8]` field borrows from the buffer passed to
/// [`Request::parse`], so they are valid only until that buffer is
/// overwritten.
#[derive(Debug)]
pub struct Request<'buf, 'h> {
    /// Parsed request method.
    pub method: Option<Method>,
    /// Parsed request target, including any query string. Percent-decoding
    /// and path resolution happen downstream, not in this parser.
    pub target: Option<&'buf str>,
    /// Parsed protocol version.
    pub version: Option<Version>,
    /// Header storage. Entries `0..num_headers` are populated after a
    /// successful parse; the rest are untouched.
    pub headers: &'h mut [Header<'buf>],
    /// Number of headers actually stored. May be less than the number of
    /// header lines on the wire if the request carried more than
    /// `headers.len()` headers — excess headers are scanned (so parsing
    /// still finds the terminating blank line) but silently dropped.
    pub num_headers: usize,
}

impl<'buf, 'h> Request<'buf, 'h> {
    /// Builds a request parser backed by the given header storage.
    pub fn new(headers: &'h mut [Header<'buf>]) -> Self {
        Request { method: None, target: None, version: None, headers, num_headers: 0 }
    }

    /// Parses a request line and header block from `buf`.
    ///
    /// Returns [`Status::Complete`] with the byte offset where the body (if
    /// any) begins, or [`Status::Partial`] if `buf` does not yet contain a
    /// complete request line and header block — the caller should read more
    /// bytes and call `parse` again with the larger buffer. `self` is reset
    /// at the start of every call, so it is safe (and expected) to re-parse
    /// the same growing buffer from scratch as more bytes arrive.
    ///
    /// # Example
    /// ```
    /// use parser::{h1::Request, EMPTY_HEADER, Status};
    ///
    /// let mut headers = [EMPTY_HEADER; 16];
    /// let mut req = Request::new(&mut headers);
    /// let status = req.parse(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    /// assert!(status.is_complete());
    /// assert_eq!(Some("/index.html"), req.target);
    /// ```
    pub fn parse(&mut self, buf: &'buf [u8]) -> ParseResult<Status<usize>> {
        self.method = None;
        self.target = None;
        self.version = None;
        self.num_headers = 0;

        let mut cursor = RawRequest::new(buf);

        let method_bytes = match take_strict_field(&mut cursor, b' ', ParseError::Method)? {
            Some(b) if !b.is_empty() => b,
            Some(_) => return Err(ParseError::Method),
            None => return Ok(Status::Partial),
        };
        self.method = Some(parse_method(method_bytes)?);

        let target_bytes = match take_strict_field(&mut cursor, b' ', ParseError::Target)? {
            Some(b) if !b.is_empty() => b,
            Some(_) => return Err(ParseError::Target),
            None => return Ok(Status::Partial),
        };
        if !target_bytes.iter().copied().all(is_request_target_token) {
            return Err(ParseError::Target);
        }
        // SAFETY: every byte in `target_bytes` passed `is_request_target_token`,
        // which admits only single-byte printable-ASCII values.
        self.target = Some(unsafe { from_utf8_unchecked(target_bytes) });

        const VERSION_LEN: usize = 8; // b"HTTP/1.1"
        if cursor.len() < VERSION_LEN {
            return Ok(Status::Partial);
        }
        for _ in 0..VERSION_LEN {
            cursor.next();
        }
        let version = match cursor.slice() {
            b"HTTP/1.0" => Version::H1_0,
            b"HTTP/1.1" => Version::H1_1,
            _ => return Err(ParseError::Version),
        };

        if cursor.len() < 2 {
            return Ok(Status::Partial);
        }
        match (cursor.next(), cursor.next()) {
            (Some(b'\r'), Some(b'\n')) => {}
            _ => return Err(ParseError::NewLine),
        }
        cursor.slice();
        self.version = Some(version);

        loop {
            if cursor.len() < 2 {
                return Ok(Status::Partial);
            }
            if at_blank_line(&cursor) {
                cursor.advance(2);
                cursor.slice();
                return Ok(Status::Complete(buf.len() - cursor.len()));
            }

            let name_bytes = match take_strict_field(&mut cursor, b':', ParseError::HeaderName)? {
                Some(b) if !b.is_empty() && b.iter().copied().all(is_tchar) => b,
                Some(_) => return Err(ParseError::HeaderName),
                None => return Ok(Status::Partial),
            };
            // SAFETY: every byte in `name_bytes` passed `is_tchar`, which only
            // admits single-byte ASCII values.
            let name = unsafe { from_utf8_unchecked(name_bytes) };

            while matches!(cursor.peek(), Some(b' ') | Some(b'\t')) {
                cursor.next();
            }
            cursor.slice();

            let mut value_bytes = match take_header_value(&mut cursor) {
                Some(b) => b,
                None => return Ok(Status::Partial),
            };
            while let [rest @ .., b' ' | b'\t'] = value_bytes {
                value_bytes = rest;
            }
            if !value_bytes.iter().copied().all(is_header_value_token) {
                return Err(ParseError::HeaderValue);
            }

            if self.num_headers < self.headers.len() {
                self.headers[self.num_headers] = Header { name, value: value_bytes };
                self.num_headers += 1;
            }
        }
    }

    /// Slices `buf` (the same buffer passed to [`Request::parse`]) starting
    /// at the body offset returned in `Status::Complete`. The server ignores
    /// request bodies entirely; this exists so callers who
    /// need to skip past the body (e.g. to find the start of a pipelined
    /// next request) have a single place to compute the split.
    pub fn body(buf: &'buf [u8], body_start: usize) -> &'buf [u8] {
        &buf[body_start..]
    }

    /// Headers stored by the most recent successful parse.
    pub fn headers(&self) -> &[Header<'buf>] {
        &self.headers[..self.num_headers]
    }
}

fn parse_method(bytes: &[u8]) -> ParseResult<Method> {
    match bytes {
        b"GET" => Ok(Method::Get),
        b"HEAD" => Ok(Method::Head),
        b"POST" => Ok(Method::Post),
        b"PUT" => Ok(Method::Put),
        b"DELETE" => Ok(Method::Delete),
        b"CONNECT" => Ok(Method::Connect),
        b"OPTIONS" => Ok(Method::Options),
        b"TRACE" => Ok(Method::Trace),
        _ => Err(ParseError::Method),
    }
}

/// Consumes up to and including `delim`, returning the bytes before it.
/// Returns `Ok(None)` if the cursor runs dry first — the caller should treat
/// that as a partial read and ask for more bytes. A CR, LF, or NUL byte
/// encountered before `delim` makes the field malformed rather than merely
/// incomplete, since none of those bytes can legally appear inside a
/// method, target, or header-name field.
fn take_strict_field<'a>(
    buf: &mut RawRequest<'a>,
    delim: u8,
    err: ParseError,
) -> ParseResult<Option<&'a [u8]>> {
    loop {
        match buf.next() {
            Some(b) if b == delim => {
                return Ok(Some(buf.slice_skip(1).expect("skip(1) after consuming delim")))
            }
            Some(b'\r') | Some(b'\n') | Some(0) => return Err(err),
            Some(_) => {}
            None => return Ok(None),
        }
    }
}

/// Consumes up to and including the header-value-terminating `b"\r\n"`,
/// returning the (untrimmed) bytes before it. Unlike [`take_strict_field`],
/// any byte other than the CRLF sequence itself is accepted here — header
/// values are validated separately via [`is_header_value_token`] after
/// trimming surrounding whitespace.
fn take_header_value<'a>(buf: &mut RawRequest<'a>) -> Option<&'a [u8]> {
    loop {
        match buf.next() {
            Some(b'\r') if buf.peek() == Some(b'\n') => {
                buf.next();
                return Some(buf.slice_skip(2).expect("skip(2) after consuming CRLF"));
            }
            Some(_) => {}
            None => return None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::EMPTY_HEADER;

    #[test]
    fn parses_simple_get() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        let status = req.parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(Status::Complete(37), status);
        assert_eq!(Some(Method::Get), req.method);
        assert_eq!(Some("/"), req.target);
        assert_eq!(Some(Version::H1_1), req.version);
        assert_eq!(1, req.num_headers);
        assert_eq!("Host", req.headers()[0].name);
        assert_eq!(b"example.com".as_slice(), req.headers()[0].value);
    }

    #[test]
    fn trims_ows_around_header_value() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        req.parse(b"GET / HTTP/1.1\r\nX-Thing:   hi there  \r\n\r\n").unwrap();
        assert_eq!(b"hi there".as_slice(), req.headers()[0].value);
    }

    #[test]
    fn reports_partial_on_truncated_request_line() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        assert_eq!(Status::Partial, req.parse(b"GET / HTTP/1").unwrap());
    }

    #[test]
    fn reports_partial_on_truncated_headers() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        assert_eq!(Status::Partial, req.parse(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap());
    }

    #[test]
    fn reparsing_a_grown_buffer_succeeds() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        assert_eq!(Status::Partial, req.parse(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap());
        let status = req.parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(status.is_complete());
    }

    #[test]
    fn rejects_missing_space_after_method() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        assert_eq!(Err(ParseError::Method), req.parse(b"GET/ HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn rejects_request_line_with_no_delimiters() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        assert_eq!(Err(ParseError::Method), req.parse(b"GET\r\n\r\n"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        assert_eq!(Err(ParseError::Version), req.parse(b"GET / HTTP/2.0\r\n\r\n"));
    }

    #[test]
    fn rejects_empty_header_name() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        assert_eq!(Err(ParseError::HeaderName), req.parse(b"GET / HTTP/1.1\r\n: x\r\n\r\n"));
    }

    #[test]
    fn excess_headers_are_scanned_but_not_stored() {
        let mut headers = [EMPTY_HEADER; 2];
        let mut req = Request::new(&mut headers);
        let raw = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        let status = req.parse(raw).unwrap();
        assert!(status.is_complete());
        assert_eq!(2, req.num_headers);
    }

    #[test]
    fn body_offset_points_past_blank_line() {
        let mut headers = [EMPTY_HEADER; 16];
        let mut req = Request::new(&mut headers);
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        match req.parse(raw).unwrap() {
            Status::Complete(offset) => assert_eq!(b"hello", Request::body(raw, offset)),
            Status::Partial => panic!("expected complete parse"),
        }
    }
}
