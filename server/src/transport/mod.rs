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

//! Non-blocking stream transport: socket setup, TLS handshake
//! progression, and sendfile variant selection.

pub mod sendfile;
pub mod socket;
pub mod tls;

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::TransportError;
use tls::TlsSession;

/// Result of a receive/send attempt that may legitimately not move any
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Made progress; `usize` bytes were moved.
    Progress(usize),
    /// The operation would block; the caller re-enters later.
    WouldBlock,
    /// The peer closed its end of the connection (a `read` returned `Ok(0)`).
    /// Only ever produced by [`Transport::receive`].
    Closed,
}

/// A non-blocking stream socket with optional TLS wrapping. Owns the socket descriptor exclusively.
pub struct Transport {
    socket: socket2::Socket,
    peer_addr: SocketAddr,
    tls: Option<TlsSession>,
    tls_established: bool,
}

impl Transport {
    pub(crate) fn new(socket: socket2::Socket, peer_addr: SocketAddr, tls: Option<TlsSession>) -> Self {
        let tls_established = tls.is_none();
        Transport { socket, peer_addr, tls, tls_established }
    }

    /// The peer's address, captured at accept time.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// `true` once the TLS handshake (if any) has completed. Always `true`
    /// for plaintext connections.
    pub fn tls_established(&self) -> bool {
        self.tls_established
    }

    /// `true` if this connection carries a TLS session at all (regardless
    /// of handshake progress). Used by [`sendfile`] to choose between the
    /// raw kernel-sendfile path (plaintext only) and a path that goes
    /// through the TLS record layer.
    pub(crate) fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Drives the non-blocking TLS handshake one step. A no-op returning `Ok(())` immediately
    /// when this transport carries no TLS session.
    pub fn establish_tls(&mut self) -> Result<(), TransportError> {
        let Some(tls) = self.tls.as_mut() else {
            self.tls_established = true;
            return Ok(());
        };
        match tls.drive_handshake(&mut self.socket) {
            Ok(true) => {
                self.tls_established = true;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drains the socket into `buf` starting at `buf[filled..]`, looping
    /// until would-block or EOF. Returns the number of bytes newly appended,
    /// or `Closed` if the peer's `read` returned `Ok(0)` before any bytes
    /// were moved this call — on a non-blocking socket a zero-byte read is
    /// unambiguously EOF, never "nothing available yet" (that case reports
    /// `WouldBlock` instead).
    pub fn receive(&mut self, buf: &mut [u8], filled: usize) -> Result<IoOutcome, TransportError> {
        let mut total = 0usize;
        let mut cursor = filled;
        loop {
            if cursor >= buf.len() {
                break;
            }
            let result = match self.tls.as_mut() {
                Some(tls) => tls.read(&mut self.socket, &mut buf[cursor..]),
                None => self.socket.read(&mut buf[cursor..]),
            };
            match result {
                Ok(0) if total == 0 => return Ok(IoOutcome::Closed),
                Ok(0) => break,
                Ok(n) => {
                    cursor += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(IoOutcome::Progress(total))
    }

    /// Writes `buf[sent..]`, looping until would-block or the buffer is
    /// drained. Returns the number of newly-sent bytes;
    /// idempotent on partial sends.
    pub fn send(&mut self, buf: &[u8], sent: usize) -> Result<IoOutcome, TransportError> {
        let mut total = 0usize;
        let mut cursor = sent;
        loop {
            if cursor >= buf.len() {
                break;
            }
            let result = match self.tls.as_mut() {
                Some(tls) => tls.write(&mut self.socket, &buf[cursor..]),
                None => self.socket.write(&buf[cursor..]),
            };
            match result {
                Ok(0) => return Err(TransportError::Reset),
                Ok(n) => {
                    cursor += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(IoOutcome::Progress(total))
    }

    /// Transmits `len` bytes of `file` starting at `offset`, picking the
    /// fastest available path for the platform and TLS state. `scratch` backs the buffered fallback; it is not
    /// touched by the kernel-offload paths.
    pub fn send_file(
        &mut self,
        file: &std::fs::File,
        offset: u64,
        len: u64,
        sent: u64,
        scratch: &mut [u8],
    ) -> Result<IoOutcome, TransportError> {
        sendfile::send_file(self, file, offset, len, sent, scratch)
    }

    /// Best-effort close: TLS close-notify (if established), `shutdown
    /// (WR)`, drain trailing bytes up to a small cap, then close the
    /// descriptor.
    pub fn close(mut self) {
        if self.tls_established {
            if let Some(tls) = self.tls.as_mut() {
                tls.send_close_notify(&mut self.socket);
            }
        }
        let _ = self.socket.shutdown(std::net::Shutdown::Write);
        let mut scratch = [0u8; 512];
        for _ in 0..16 {
            match self.socket.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    pub(crate) fn socket(&self) -> &socket2::Socket {
        &self.socket
    }

    pub(crate) fn socket_mut(&mut self) -> &mut socket2::Socket {
        &mut self.socket
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer_addr", &self.peer_addr)
            .field("tls_established", &self.tls_established)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (Transport, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let socket = socket2::Socket::from(server);
        (Transport::new(socket, peer, None), client)
    }

    #[test]
    fn receive_reports_would_block_with_nothing_pending() {
        let (mut transport, _client) = loopback_pair();
        let mut buf = vec![0u8; 64];
        assert_eq!(IoOutcome::Progress(0), transport.receive(&mut buf, 0).unwrap());
    }

    #[test]
    fn receive_reports_closed_when_peer_hangs_up() {
        let (mut transport, client) = loopback_pair();
        drop(client);
        // Give the FIN a moment to arrive; non-blocking reads otherwise race it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut buf = vec![0u8; 64];
        assert_eq!(IoOutcome::Closed, transport.receive(&mut buf, 0).unwrap());
    }

    #[test]
    fn receive_reports_progress_when_data_is_pending() {
        let (mut transport, mut client) = loopback_pair();
        client.write_all(b"hello").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut buf = vec![0u8; 64];
        assert_eq!(IoOutcome::Progress(5), transport.receive(&mut buf, 0).unwrap());
    }
}
