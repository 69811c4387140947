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

//! Owns the server socket and hands accepted connections to Workers.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use crate::manager::Manager;
use crate::poller::{Backend, EventCode, Handler, Poller, RawEvent, Registry, Token};
use crate::transport::socket::{self, AcceptOutcome};
use crate::transport::tls::TlsServerConfig;
use crate::worker::WorkerHandle;

/// A Poller watching exactly one descriptor: the server socket.
pub struct Listener<B: Backend> {
    poller: Poller<B>,
    server_fd: std::os::unix::io::RawFd,
}

impl<B: Backend + 'static> Listener<B> {
    /// Binds and registers `server_socket`, dispatching accepted
    /// connections across `workers` by round robin. `tls_config` attaches a
    /// TLS session to every accepted connection when set, making this the
    /// HTTPS listener for its bind address.
    pub fn new(
        server_socket: socket2::Socket,
        tls_config: Option<Arc<TlsServerConfig>>,
        manager: Manager,
        workers: Vec<WorkerHandle<B::Registry>>,
    ) -> io::Result<Self> {
        let server_fd = server_socket.as_raw_fd();
        let handler = ListenerHandler { server_socket, tls_config, manager, workers, cursor: 0 };
        let poller = Poller::new(1, handler)?;
        poller.registry().add(server_fd, EventCode::READ | EventCode::EDGE_TRIGGERED, Token::LISTENER)?;
        Ok(Listener { poller, server_fd })
    }

    /// Requests the Listener's thread to stop; the server socket closes
    /// once the thread exits and drops its handler. In-flight connections
    /// already handed to a Worker keep being served.
    pub fn stop(&self) {
        self.poller.stop();
        let _ = self.poller.registry().wake();
    }

    /// Blocks until the Listener's thread has exited. Idempotent.
    pub fn join(&mut self) {
        self.poller.join();
    }

    /// The bound server socket's file descriptor, for diagnostics.
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.server_fd
    }
}

impl<B: Backend> std::fmt::Debug for Listener<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("poller", &self.poller).field("server_fd", &self.server_fd).finish()
    }
}

struct ListenerHandler<R: Registry> {
    server_socket: socket2::Socket,
    tls_config: Option<Arc<TlsServerConfig>>,
    manager: Manager,
    workers: Vec<WorkerHandle<R>>,
    cursor: usize,
}

impl<R: Registry> ListenerHandler<R> {
    fn drain_accepts(&mut self) {
        loop {
            match socket::accept(&self.server_socket) {
                Ok(AcceptOutcome::WouldBlock) => break,
                Ok(AcceptOutcome::Accepted(socket, addr)) => self.handle_accept(socket, addr),
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_accept(&mut self, socket: socket2::Socket, addr: std::net::SocketAddr) {
        let Some(handle) = self.manager.acquire() else {
            tracing::debug!(peer = %addr, "shed-closed: connection manager exhausted");
            drop(socket);
            return;
        };

        let transport = match socket::wrap(socket, addr, self.tls_config.as_deref()) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "failed to wrap accepted socket");
                return;
            }
        };

        let worker_count = self.workers.len();
        if worker_count == 0 {
            tracing::debug!(peer = %addr, "shed-closed: no workers configured");
            return;
        }

        let mut pending = Some((handle, transport));
        for _ in 0..worker_count {
            let (handle, transport) = pending.take().expect("loop body always re-fills pending");
            let worker = &self.workers[self.cursor];
            self.cursor = (self.cursor + 1) % worker_count;
            match worker.assign(handle, transport) {
                Ok(()) => return,
                Err(rejected) => pending = Some(rejected),
            }
        }

        tracing::debug!(peer = %addr, "shed-closed: all workers saturated");
        // `pending`'s JobHandle and Transport drop here: slot released,
        // socket closed.
    }
}

impl<R: Registry> Handler<R> for ListenerHandler<R> {
    fn on_event(&mut self, registry: &R, event: RawEvent) {
        if event.token != Token::LISTENER {
            tracing::warn!(token = ?event.token, "listener received event for unexpected token");
            return;
        }
        self.drain_accepts();
        // Event-ports backends consume the association on every delivery;
        // every other backend's `rearm_read` is a no-op.
        if let Err(e) = registry.rearm_read(self.server_socket.as_raw_fd(), Token::LISTENER) {
            tracing::warn!(error = %e, "failed to re-arm listener socket");
        }
    }

    fn on_stop(&mut self) {
        tracing::debug!("listener poller stopped");
    }
}
