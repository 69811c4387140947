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

//! H1 request line + header parser.

use core::fmt::Display;

use crate::raw_request::RawRequest;

pub mod request;
mod tokens;

pub use request::Request;

/// Represents possible failures while parsing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid byte in method, or no delimiting space found.
    Method,
    /// Invalid byte in target, or no delimiting space found.
    Target,
    /// Invalid or unsupported HTTP version.
    Version,
    /// Invalid byte in header name, or no delimiting colon found.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid or missing CRLF line terminator.
    NewLine,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "invalid token in method",
            ParseError::Target => "invalid token in target",
            ParseError::Version => "invalid or unsupported version",
            ParseError::HeaderName => "invalid token in header name",
            ParseError::HeaderValue => "invalid token in header value",
            ParseError::NewLine => "invalid or missing new line",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose `Err` variant is [`ParseError`].
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// `true` if `buf`, starting at the cursor, begins with `b"\r\n"` (the blank
/// line terminating the header section). Does not advance the cursor.
pub(crate) fn at_blank_line(buf: &RawRequest<'_>) -> bool {
    buf.as_ref().starts_with(b"\r\n")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn at_blank_line_detects_terminator() {
        let buf = RawRequest::new(b"\r\nrest");
        assert!(at_blank_line(&buf));
    }

    #[test]
    fn at_blank_line_false_when_more_header_follows() {
        let buf = RawRequest::new(b"Host: x\r\n");
        assert!(!at_blank_line(&buf));
    }
}
