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

//! Server-socket setup and the non-blocking accept loop.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use super::tls::{TlsServerConfig, TlsSession};
use super::Transport;
use crate::error::TransportError;

/// Sets up a listening socket: non-blocking, `SO_REUSEADDR`, IPv6-only when
/// applicable, `TCP_NODELAY` on accepted connections (set per-connection,
/// not here), `SO_KEEPALIVE`, and a best-effort `TCP_FASTOPEN`.
pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Keep v4-mapped addresses disabled so the caller's ipv4/ipv6 binds
        // never silently overlap.
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.set_keepalive(true)?;

    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    enable_tcp_fastopen(&socket);

    Ok(socket)
}

#[cfg(target_os = "linux")]
fn enable_tcp_fastopen(socket: &Socket) {
    // socket2 has no portable TCP_FASTOPEN wrapper; the queue-length
    // argument is Linux's calling convention (BSD instead takes a boolean).
    let queue_len: libc::c_int = 16;
    unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &queue_len as *const _ as *const libc::c_void,
            std::mem::size_of_val(&queue_len) as libc::socklen_t,
        );
    }
    // Best-effort: an unsupported kernel just leaves the option unset.
}

#[cfg(not(target_os = "linux"))]
fn enable_tcp_fastopen(_socket: &Socket) {}

fn configure_accepted(socket: &Socket) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    // SO_LINGER{on, 0}: force RST on close for fast reuse of the four-tuple.
    socket.set_linger(Some(Duration::from_secs(0)))?;
    // Idle reclamation happens at the Worker level (Job::is_idle), not via
    // SO_RCVTIMEO/SO_SNDTIMEO — those bound a blocking read/write and are
    // no-ops on a socket that's already non-blocking.
    Ok(())
}

/// One non-blocking accept attempt. Distinct
/// outcomes for "nothing pending" and "real error" — would-block is not an
/// error.
pub enum AcceptOutcome {
    /// A connection was accepted and configured.
    Accepted(socket2::Socket, SocketAddr),
    /// No pending connection.
    WouldBlock,
}

pub fn accept(listen_socket: &Socket) -> io::Result<AcceptOutcome> {
    match listen_socket.accept() {
        Ok((socket, addr)) => {
            configure_accepted(&socket)?;
            let addr = addr.as_socket().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "accepted socket has no inet address")
            })?;
            Ok(AcceptOutcome::Accepted(socket, addr))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(AcceptOutcome::WouldBlock),
        Err(e) => Err(e),
    }
}

/// Wraps a freshly-accepted socket into a [`Transport`], attaching a TLS
/// session when `tls_config` is set.
pub fn wrap(
    socket: socket2::Socket,
    peer_addr: SocketAddr,
    tls_config: Option<&TlsServerConfig>,
) -> Result<Transport, TransportError> {
    let tls = tls_config.map(TlsSession::new_server);
    Ok(Transport::new(socket, peer_addr, tls))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_produces_nonblocking_listener() {
        let socket = bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        // a non-blocking listener with nothing pending reports WouldBlock,
        // never blocks the test thread.
        match accept(&socket) {
            Ok(AcceptOutcome::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {:?}", other.is_ok()),
        }
    }
}
