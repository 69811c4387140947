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

//! Linux backend, built on `epoll_wait`/`epoll_ctl`. `EDGE_TRIGGERED`
//! maps directly onto `EPOLLET`; no re-arm is needed on this
//! backend, so [`Registry::rearm_read`] keeps its no-op default.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Backend, EventCode, RawEvent, Registry, Token};

fn epoll_events_for(mask: EventCode) -> u32 {
    let mut bits = 0u32;
    if mask.contains(EventCode::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if mask.contains(EventCode::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    if mask.contains(EventCode::EDGE_TRIGGERED) {
        bits |= libc::EPOLLET as u32;
    }
    bits
}

fn code_from_epoll_events(bits: u32) -> EventCode {
    let mut code = EventCode::NONE;
    if bits & (libc::EPOLLIN as u32) != 0 {
        code = code | EventCode::READ;
    }
    if bits & (libc::EPOLLOUT as u32) != 0 {
        code = code | EventCode::WRITE;
    }
    if bits & (libc::EPOLLERR as u32) != 0 {
        code = code | EventCode::ERROR;
    }
    if bits & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
        code = code | EventCode::CLOSE;
    }
    code
}

fn epoll_ctl_event(mask: EventCode, token: Token) -> libc::epoll_event {
    libc::epoll_event { events: epoll_events_for(mask), u64: token.0 as u64 }
}

fn cvt(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Cheaply-`Copy`-able registration handle sharing the owning
/// [`EpollBackend`]'s epoll instance. `epoll_ctl` is documented safe to
/// call concurrently with another thread blocked in `epoll_wait` on the
/// same instance, so no additional synchronization is needed here.
#[derive(Debug, Clone, Copy)]
pub struct EpollRegistry {
    epoll_fd: RawFd,
    wake_write: RawFd,
}

impl Registry for EpollRegistry {
    fn add(&self, fd: RawFd, mask: EventCode, token: Token) -> io::Result<()> {
        let mut event = epoll_ctl_event(mask, token);
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) })
    }

    fn modify(&self, fd: RawFd, mask: EventCode, token: Token) -> io::Result<()> {
        let mut event = epoll_ctl_event(mask, token);
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) })
    }

    fn remove(&self, fd: RawFd, _mask: EventCode) -> io::Result<()> {
        // Linux ignores the `event` pointer for EPOLL_CTL_DEL, but kernels
        // predating 2.6.9 require a non-null pointer; keep it for safety.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event) })
    }

    fn wake(&self) -> io::Result<()> {
        let n = unsafe {
            libc::write(self.wake_write, [1u8].as_ptr() as *const libc::c_void, 1)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // EAGAIN just means the wake pipe is already "full" of pending
            // wake-ups, which is fine — the next wait will still return.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Linux readiness backend.
pub struct EpollBackend {
    epoll_fd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    events_buf: Vec<libc::epoll_event>,
}

impl Backend for EpollBackend {
    type Registry = EpollRegistry;

    fn setup(capacity: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }
        let (wake_read, wake_write) = (fds[0], fds[1]);

        let registry = EpollRegistry { epoll_fd, wake_write };
        registry.add(wake_read, EventCode::READ, Token::WAKE)?;

        Ok(EpollBackend {
            epoll_fd,
            wake_read,
            wake_write,
            events_buf: Vec::with_capacity(capacity.max(1)),
        })
    }

    fn registry(&self) -> EpollRegistry {
        EpollRegistry { epoll_fd: self.epoll_fd, wake_write: self.wake_write }
    }

    fn wait(&mut self, timeout: Duration, out: &mut Vec<RawEvent>) -> io::Result<()> {
        if self.events_buf.capacity() == 0 {
            self.events_buf.reserve(1);
        }
        self.events_buf.clear();
        self.events_buf.resize(self.events_buf.capacity(), libc::epoll_event { events: 0, u64: 0 });

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events_buf.as_mut_ptr(),
                self.events_buf.len() as libc::c_int,
                timeout.as_millis() as libc::c_int,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for event in &self.events_buf[..n as usize] {
            let token = Token(event.u64 as usize);
            if token == Token::WAKE {
                drain_wake_pipe(self.wake_read);
                continue;
            }
            out.push(RawEvent { token, code: code_from_epoll_events(event.events) });
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

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_write);
            libc::close(self.wake_read);
            libc::close(self.epoll_fd);
        }
    }
}

// SAFETY: all fields are plain file descriptors; every access goes through
// `libc` syscalls that are individually thread-safe.
unsafe impl Send for EpollBackend {}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reports_readable_pipe() {
        let mut backend = EpollBackend::setup(4).unwrap();
        let registry = backend.registry();

        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        let (read_fd, write_fd) = (fds[0], fds[1]);

        registry.add(read_fd, EventCode::READ, Token(7)).unwrap();
        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        let mut events = Vec::new();
        backend.wait(Duration::from_millis(500), &mut events).unwrap();
        assert!(events.iter().any(|e| e.token == Token(7) && e.code.contains(EventCode::READ)));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn registry_fd_matches_backend() {
        let backend = EpollBackend::setup(1).unwrap();
        assert_eq!(backend.epoll_fd, backend.registry().epoll_fd);
    }
}
