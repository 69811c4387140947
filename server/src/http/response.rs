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

//! Response construction: status line + header buffer
//! plus the STRING_BODY/FILE_BODY/HEAD_ONLY body variant.

use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use parser::Method;

use crate::error::PathError;
use crate::http::{date, mime, path};

/// The body half of a response.
pub enum Body {
    /// No body is sent, regardless of `Content-Length` (HEAD, OPTIONS).
    None,
    /// A small, fully-buffered body (error pages).
    String(Vec<u8>),
    /// An open file, sent via [`crate::transport::Transport::send_file`].
    File { file: File, len: u64 },
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::None => f.write_str("Body::None"),
            Body::String(b) => write!(f, "Body::String({} bytes)", b.len()),
            Body::File { len, .. } => write!(f, "Body::File({len} bytes)"),
        }
    }
}

/// A fully-constructed response: a pre-formatted head buffer plus body.
#[derive(Debug)]
pub struct Response {
    /// Status line + headers + trailing blank line, ready to send as-is.
    pub head: Vec<u8>,
    pub body: Body,
    /// `true` if the connection must close after this response is sent.
    pub should_close: bool,
}

impl Response {
    /// Bytes of body remaining to send beyond the head.
    pub fn body_len(&self) -> u64 {
        match &self.body {
            Body::None => 0,
            Body::String(b) => b.len() as u64,
            Body::File { len, .. } => *len,
        }
    }
}

const SERVER_HEADER: &str = "rask";

fn head_buffer(status_line: &str, extra_headers: &[(&str, &str)], content_length: u64, keep_alive: bool) -> Vec<u8> {
    let mut head = String::with_capacity(256);
    let _ = write!(head, "HTTP/1.1 {status_line}\r\n");
    for (name, value) in extra_headers {
        let _ = write!(head, "{name}: {value}\r\n");
    }
    let _ = write!(head, "Content-Length: {content_length}\r\n");
    let _ = write!(head, "Date: {}\r\n", date::now());
    let _ = write!(head, "Server: {SERVER_HEADER}\r\n");
    let _ = write!(head, "Connection: {}\r\n", if keep_alive { "keep-alive" } else { "close" });
    head.push_str("\r\n");
    head.into_bytes()
}

fn error_body(status_line: &str, message: &str) -> Vec<u8> {
    format!("<html><head><title>{status_line}</title></head><body><h1>{status_line}</h1><p>{message}</p></body></html>").into_bytes()
}

fn not_found() -> Response {
    let body = error_body("404 Not Found", "The requested resource was not found.");
    let head = head_buffer("404 Not Found", &[("Content-Type", "text/html")], body.len() as u64, true);
    Response { head, body: Body::String(body), should_close: false }
}

fn method_not_allowed() -> Response {
    let body = error_body("405 Method Not Allowed", "The requested method is not supported.");
    let head = head_buffer("405 Method Not Allowed", &[("Content-Type", "text/html")], body.len() as u64, false);
    Response { head, body: Body::String(body), should_close: true }
}

/// A `400 Bad Request` response for requests the parser rejected (spec
/// §4.5 "Parse failure").
pub fn bad_request() -> Response {
    let body = error_body("400 Bad Request", "The request could not be parsed.");
    let head = head_buffer("400 Bad Request", &[("Content-Type", "text/html")], body.len() as u64, false);
    Response { head, body: Body::String(body), should_close: true }
}

/// A `500 Internal Server Error` response.
pub fn internal_error() -> Response {
    let body = error_body("500 Internal Server Error", "The server encountered an internal error.");
    let head = head_buffer("500 Internal Server Error", &[("Content-Type", "text/html")], body.len() as u64, false);
    Response { head, body: Body::String(body), should_close: true }
}

fn options_response() -> Response {
    let head = head_buffer("204 No Content", &[("Allow", "GET, HEAD, OPTIONS")], 0, true);
    Response { head, body: Body::None, should_close: false }
}

fn get_or_head(target: &str, root: &Path, head_only: bool) -> Response {
    let resolved = match path::resolve(target, root) {
        Ok(resolved) => resolved,
        Err(PathError::Traversal) | Err(PathError::NotFound(_)) | Err(PathError::BadEncoding) => return not_found(),
    };

    let file = match File::open(&resolved.path) {
        Ok(file) => file,
        Err(_) => return not_found(),
    };

    let len = resolved.metadata.len();
    let content_type = mime::lookup(&resolved.path);
    let last_modified = resolved
        .metadata
        .modified()
        .map(date::format)
        .unwrap_or_else(|_| date::now());

    let head = head_buffer(
        "200 OK",
        &[
            ("Content-Type", content_type),
            ("Last-Modified", &last_modified),
            ("Accept-Ranges", "none"),
            ("Cache-Control", "public, max-age=86400"),
        ],
        len,
        true,
    );

    let body = if head_only { Body::None } else { Body::File { file, len } };
    Response { head, body, should_close: false }
}

/// Builds a response for `method` against `target`, resolved beneath
/// `root`.
pub fn build(method: Method, target: &str, root: &Path) -> Response {
    match method {
        Method::Get => get_or_head(target, root, false),
        Method::Head => get_or_head(target, root, true),
        Method::Options => options_response(),
        _ => method_not_allowed(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("index.html")).unwrap().write_all(b"hello").unwrap();
        dir
    }

    #[test]
    fn get_existing_file_returns_200_with_file_body() {
        let dir = fixture();
        let resp = build(Method::Get, "/", dir.path());
        assert!(std::str::from_utf8(&resp.head).unwrap().starts_with("HTTP/1.1 200 OK"));
        assert!(matches!(resp.body, Body::File { len: 5, .. }));
        assert!(!resp.should_close);
    }

    #[test]
    fn head_existing_file_returns_200_with_no_body() {
        let dir = fixture();
        let resp = build(Method::Head, "/", dir.path());
        assert!(std::str::from_utf8(&resp.head).unwrap().starts_with("HTTP/1.1 200 OK"));
        assert!(matches!(resp.body, Body::None));
    }

    #[test]
    fn get_missing_file_returns_404() {
        let dir = fixture();
        let resp = build(Method::Get, "/nope.html", dir.path());
        assert!(std::str::from_utf8(&resp.head).unwrap().starts_with("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn delete_returns_405_and_closes() {
        let dir = fixture();
        let resp = build(Method::Delete, "/", dir.path());
        assert!(std::str::from_utf8(&resp.head).unwrap().starts_with("HTTP/1.1 405"));
        assert!(resp.should_close);
        let head = std::str::from_utf8(&resp.head).unwrap();
        assert!(head.contains("Connection: close"));
    }

    #[test]
    fn options_returns_204_with_allow_header() {
        let dir = fixture();
        let resp = build(Method::Options, "*", dir.path());
        let head = std::str::from_utf8(&resp.head).unwrap();
        assert!(head.starts_with("HTTP/1.1 204 No Content"));
        assert!(head.contains("Allow: GET, HEAD, OPTIONS"));
        assert!(matches!(resp.body, Body::None));
    }

    #[test]
    fn bad_request_closes_connection() {
        let resp = bad_request();
        assert!(resp.should_close);
        assert!(std::str::from_utf8(&resp.head).unwrap().starts_with("HTTP/1.1 400"));
    }
}
