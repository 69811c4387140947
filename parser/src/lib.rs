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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! Zero-copy HTTP/1.1 request line + header parser.
//!
//! The parser never allocates. Every slice it returns borrows from the
//! caller-supplied buffer, so those slices are only valid until the buffer
//! is overwritten or dropped.

pub mod h1;
mod method;
mod raw_request;
mod version;

pub use method::Method;
pub use version::Version;

/// Whether a parse call consumed a complete request or needs more bytes.
///
/// Mirrors the `httparse::Status` shape: callers re-enter `parse` with a
/// larger buffer on `Partial` rather than treating it as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status<T> {
    /// The request was fully parsed. Carries the byte offset where the body
    /// (if any) begins.
    Complete(T),
    /// Not enough bytes were present to finish parsing the request line and
    /// headers. The caller should read more data and parse again.
    Partial,
}

impl<T> Status<T> {
    /// Returns `true` if this is `Status::Complete`.
    pub fn is_complete(&self) -> bool {
        matches!(self, Status::Complete(_))
    }

    /// Returns `true` if this is `Status::Partial`.
    pub fn is_partial(&self) -> bool {
        matches!(self, Status::Partial)
    }
}

/// Maximum number of headers the parser will store per request. This bound
/// is compile-time, matching the wire protocol limit used by the server.
/// Headers beyond this count are scanned (so the request line / terminating
/// blank line are still found correctly) but not stored.
pub const MAX_HEADERS: usize = 128;

/// A single parsed header. Both `name` and `value` borrow from the request
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'buf> {
    /// Header field name, e.g. `"Host"`.
    pub name: &'buf str,
    /// Header field value, raw bytes (not validated as UTF-8).
    pub value: &'buf [u8],
}

/// A `Header` suitable for initializing a fixed-size array of headers before
/// parsing, analogous to `httparse::EMPTY_HEADER`.
pub const EMPTY_HEADER: Header<'static> = Header { name: "", value: b"" };
