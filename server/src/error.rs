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

//! Per-subsystem error taxonomy. Each kind is a small enum the
//! caller matches on to decide recovery, rather than an opaque boxed error
//! — mirroring `parser::h1::ParseError`'s shape throughout this crate.

use std::fmt::{self, Display, Formatter};
use std::io;

/// Failures while resolving a request target to a filesystem path.
#[derive(Debug)]
pub enum PathError {
    /// The percent-encoding in the target was malformed.
    BadEncoding,
    /// The resolved path would escape the document root.
    Traversal,
    /// `stat`, `open`, or `realpath` failed (conflated with not-found,
    /// deliberately — the caller only needs to know the file isn't servable).
    NotFound(io::Error),
}

impl PathError {
    fn description_str(&self) -> &'static str {
        match self {
            PathError::BadEncoding => "malformed percent-encoding in request target",
            PathError::Traversal => "resolved path escapes document root",
            PathError::NotFound(_) => "path not found or inaccessible",
        }
    }
}

impl Display for PathError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for PathError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PathError::NotFound(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures in the non-blocking transport layer.
///
/// `WouldBlock` and the TLS `WantRead`/`WantWrite` variants are
/// transport-transient: they are state signals, not
/// failures, and callers re-enter later rather than treating them as errors.
/// Every other variant is transport-terminal: the caller (the Job) must
/// release the connection.
#[derive(Debug)]
pub enum TransportError {
    /// The operation would block; re-enter once the poller reports readiness.
    WouldBlock,
    /// TLS handshake needs more readable bytes before it can proceed.
    WantRead,
    /// TLS handshake needs to write bytes before it can proceed.
    WantWrite,
    /// The peer reset the connection, or the pipe is broken.
    Reset,
    /// The TLS handshake failed terminally.
    TlsHandshake,
    /// Any other I/O failure, surfaced from the underlying syscalls.
    Io(io::Error),
}

impl TransportError {
    fn description_str(&self) -> &'static str {
        match self {
            TransportError::WouldBlock => "operation would block",
            TransportError::WantRead => "tls handshake wants readable data",
            TransportError::WantWrite => "tls handshake wants to write",
            TransportError::Reset => "connection reset by peer",
            TransportError::TlsHandshake => "tls handshake failed",
            TransportError::Io(_) => "transport i/o error",
        }
    }

    /// `true` for the transport-transient kinds: not an error the
    /// caller should treat as terminal, merely "try again once readable".
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::WouldBlock | TransportError::WantRead | TransportError::WantWrite)
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => TransportError::WouldBlock,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => TransportError::Reset,
            _ => TransportError::Io(e),
        }
    }
}

/// Fatal failures while reading configuration or binding the server's
/// listening sockets. These abort startup.
#[derive(Debug)]
pub enum ConfigError {
    /// An unrecognized long option was passed on the command line.
    UnknownFlag(String),
    /// A recognized flag's value could not be parsed (e.g. non-numeric
    /// `--worker-count`).
    InvalidValue { flag: &'static str, value: String },
    /// A bind address could not be parsed.
    BadBindAddress(String),
    /// `--max-connections` (or a derived capacity) was zero or otherwise
    /// impossible to satisfy.
    ImpossibleCapacity,
    /// A PEM file (certificate or private key) could not be read or parsed.
    Pem { path: String, source: io::Error },
    /// The loaded private key does not match the loaded certificate.
    KeyCertMismatch,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownFlag(flag) => write!(f, "unknown flag: {flag}"),
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value for {flag}: {value}")
            }
            ConfigError::BadBindAddress(addr) => write!(f, "invalid bind address: {addr}"),
            ConfigError::ImpossibleCapacity => {
                f.write_str("max-connections must be greater than zero")
            }
            ConfigError::Pem { path, .. } => write!(f, "failed to read PEM file: {path}"),
            ConfigError::KeyCertMismatch => f.write_str("private key does not match certificate"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Pem { source, .. } => Some(source),
            _ => None,
        }
    }
}
