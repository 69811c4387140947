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

//! Non-blocking TLS handshake and record I/O, backed by
//! `rustls`. Each [`TlsSession`] wraps one `rustls::ServerConnection`;
//! progressing the handshake and pumping plaintext both drive the same
//! `read_tls`/`process_new_packets`/`write_tls` loop rustls expects the
//! embedder to run.
//!
//! rustls keeps per-thread error-reporting state internally (Design Notes
//! §9's thread-local note); this module confines any awareness of that to
//! itself and never leaks it past [`TlsSession`]'s public methods.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};

use crate::error::{ConfigError, TransportError};

/// Immutable TLS material for one [`crate::transport::socket`]-bound
/// endpoint.
pub struct TlsServerConfig {
    config: Arc<ServerConfig>,
    ktls_available: bool,
}

impl TlsServerConfig {
    /// Loads certificate and private key from PEM files, validates that the
    /// key matches the certificate, and probes KTLS availability once.
    /// KTLS is surfaced only as a capability flag for now; dispatch does not
    /// yet program the kernel ULP (see the TODO in `sendfile.rs`).
    pub fn from_pem(cert_path: &Path, key_path: &Path) -> Result<Self, ConfigError> {
        let cert_chain = load_certs(cert_path)?;
        let private_key = load_key(key_path)?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
            .map_err(|_| ConfigError::KeyCertMismatch)?;
        let certified_key = rustls::sign::CertifiedKey::new(cert_chain.clone(), signing_key);
        certified_key
            .keys_match()
            .map_err(|_| ConfigError::KeyCertMismatch)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|_| ConfigError::KeyCertMismatch)?;

        Ok(TlsServerConfig { config: Arc::new(config), ktls_available: probe_ktls_support() })
    }

    /// Whether kernel TLS record offload is available on this host, cached
    /// at startup so [`crate::transport::sendfile`] never re-probes per
    /// call.
    pub fn ktls_available(&self) -> bool {
        self.ktls_available
    }
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ConfigError> {
    let file = std::fs::File::open(path)
        .map_err(|source| ConfigError::Pem { path: path.display().to_string(), source })?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Pem { path: path.display().to_string(), source })
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ConfigError> {
    let file = std::fs::File::open(path)
        .map_err(|source| ConfigError::Pem { path: path.display().to_string(), source })?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::Pem { path: path.display().to_string(), source })?
        .ok_or(ConfigError::KeyCertMismatch)
}

/// Probes whether the running kernel supports the `tls` ULP (`man 7 tcp`,
/// `CONFIG_TLS`), which gates the KTLS sendfile path. Linux-only; any
/// other platform reports unavailable.
#[cfg(target_os = "linux")]
fn probe_ktls_support() -> bool {
    let probe = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP));
    let Ok(probe) = probe else { return false };
    use std::os::unix::io::AsRawFd;
    let ulp = b"tls\0";
    let ret = unsafe {
        libc::setsockopt(
            probe.as_raw_fd(),
            libc::SOL_TCP,
            libc::TCP_ULP,
            ulp.as_ptr() as *const libc::c_void,
            (ulp.len() - 1) as libc::socklen_t,
        )
    };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
fn probe_ktls_support() -> bool {
    false
}

/// One connection's TLS state.
pub struct TlsSession {
    conn: ServerConnection,
}

impl TlsSession {
    pub(crate) fn new_server(config: &TlsServerConfig) -> Self {
        // `ServerConnection::new` only fails on an invalid config, which
        // `TlsServerConfig::from_pem` has already validated.
        let conn = ServerConnection::new(Arc::clone(&config.config)).expect("validated TLS server config");
        TlsSession { conn }
    }

    /// Advances the handshake by one non-blocking step. Returns `Ok(true)`
    /// once the handshake has completed, `Ok(false)` on
    /// want-read/want-write, and an
    /// error on any other failure.
    pub(crate) fn drive_handshake(&mut self, socket: &mut socket2::Socket) -> Result<bool, TransportError> {
        loop {
            if !self.conn.is_handshaking() {
                return Ok(true);
            }

            if self.conn.wants_write() {
                match self.conn.write_tls(socket) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(_) => return Err(TransportError::TlsHandshake),
                }
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(socket) {
                    Ok(0) => return Err(TransportError::TlsHandshake),
                    Ok(_) => {
                        if self.conn.process_new_packets().is_err() {
                            return Err(TransportError::TlsHandshake);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(_) => return Err(TransportError::TlsHandshake),
                }
            } else {
                return Ok(true);
            }
        }
    }

    /// Reads decrypted application bytes, pumping the TLS record layer as
    /// needed.
    pub(crate) fn read(&mut self, socket: &mut socket2::Socket, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.read_tls(socket) {
            Ok(0) => return Ok(0),
            Ok(_) => {
                self.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) => Err(e),
        }
    }

    /// Writes plaintext, encrypting and flushing as many TLS records as
    /// fit without blocking.
    pub(crate) fn write(&mut self, socket: &mut socket2::Socket, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.flush_tls(socket)?;
        Ok(n)
    }

    fn flush_tls(&mut self, socket: &mut socket2::Socket) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Sends the TLS close-notify alert, best-effort.
    pub(crate) fn send_close_notify(&mut self, socket: &mut socket2::Socket) {
        self.conn.send_close_notify();
        let _ = self.flush_tls(socket);
    }
}
