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

//! Portable edge/level-triggered readiness engine.
//!
//! One [`Backend`] implementation exists per platform, selected at compile
//! time by `cfg`. All four share the [`Poller`] driver in this module,
//! which owns the backend's worker thread, the stop flag, and the event
//! buffer. The Worker and Listener never test which backend is active at
//! runtime (Design Notes §9) — the two differing interest-adjustment
//! policies (modify-in-place vs. add/remove-filter vs. re-arm-on-delivery)
//! live as methods on [`Registry`], not as branches in the caller.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub mod event_ports;
pub mod poll_backend;

/// Opaque user value handed back on every event for a watched descriptor,
/// analogous to an epoll/kqueue "user pointer". In this crate a token
/// is always either a Job's pool index or the reserved listener/wake
/// tokens, never a real pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

impl Token {
    /// Reserved token for the internal wake-up descriptor every backend
    /// registers for itself, so `stop()` can interrupt a blocking `wait`.
    pub const WAKE: Token = Token(usize::MAX);
    /// Reserved token for the server socket a [`crate::listener::Listener`]
    /// watches.
    pub const LISTENER: Token = Token(usize::MAX - 1);
}

/// Bitset over {READ, WRITE, ERROR, CLOSE, EDGE_TRIGGERED}.
/// ERROR and CLOSE are delivered, never requested: callers should not set
/// them in a call to [`Registry::add`]/[`Registry::modify`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventCode(u8);

impl EventCode {
    /// Readable (or, for the listener, "has a pending accept").
    pub const READ: EventCode = EventCode(1 << 0);
    /// Writable.
    pub const WRITE: EventCode = EventCode(1 << 1);
    /// The descriptor encountered an error. Delivered only.
    pub const ERROR: EventCode = EventCode(1 << 2);
    /// The peer closed its end. Delivered only.
    pub const CLOSE: EventCode = EventCode(1 << 3);
    /// Request edge-triggered delivery for this registration.
    pub const EDGE_TRIGGERED: EventCode = EventCode(1 << 4);
    /// The empty set.
    pub const NONE: EventCode = EventCode(0);

    /// `true` if `self` contains every bit set in `other`.
    pub fn contains(self, other: EventCode) -> bool {
        self.0 & other.0 == other.0
    }

    fn with(self, other: EventCode) -> EventCode {
        EventCode(self.0 | other.0)
    }

    fn without(self, other: EventCode) -> EventCode {
        EventCode(self.0 & !other.0)
    }
}

impl std::ops::BitOr for EventCode {
    type Output = EventCode;
    fn bitor(self, rhs: EventCode) -> EventCode {
        self.with(rhs)
    }
}

impl Debug for EventCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write_flag = |f: &mut Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)
        };
        f.write_str("EventCode(")?;
        if self.contains(EventCode::READ) {
            write_flag(f, "READ")?;
        }
        if self.contains(EventCode::WRITE) {
            write_flag(f, "WRITE")?;
        }
        if self.contains(EventCode::ERROR) {
            write_flag(f, "ERROR")?;
        }
        if self.contains(EventCode::CLOSE) {
            write_flag(f, "CLOSE")?;
        }
        if self.contains(EventCode::EDGE_TRIGGERED) {
            write_flag(f, "EDGE_TRIGGERED")?;
        }
        f.write_str(")")
    }
}

/// One readiness record delivered by [`Backend::wait`].
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    /// The token supplied when the descriptor was registered.
    pub token: Token,
    /// The union of fired conditions.
    pub code: EventCode,
}

/// Per-backend registration surface. Cheaply
/// cloneable and safe to call from any thread concurrently with the owning
/// [`Backend`]'s blocking `wait` — this is what lets a Listener's
/// round-robin `assign` register a job with a Worker's poller without
/// waiting for that poller's current `wait` call to return.
pub trait Registry: Send + Sync {
    /// Registers readiness interest for `fd` under `token`.
    fn add(&self, fd: RawFd, mask: EventCode, token: Token) -> io::Result<()>;
    /// Replaces the interest mask previously registered for `fd`.
    fn modify(&self, fd: RawFd, mask: EventCode, token: Token) -> io::Result<()>;
    /// Deregisters `fd`. `mask` must match what was last registered so
    /// kqueue can remove the matching filter(s).
    fn remove(&self, fd: RawFd, mask: EventCode) -> io::Result<()>;

    /// Ensures WRITE readiness is part of `fd`'s interest. The default forwards to `modify`
    /// with READ|WRITE|EDGE_TRIGGERED, which is correct for epoll and poll;
    /// kqueue and event ports override this with their own policy. Carrying
    /// EDGE_TRIGGERED through every `modify` matters on epoll: dropping it
    /// here would silently demote the registration to level-triggered,
    /// violating the edge-triggered discipline.
    fn enable_write(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.modify(fd, EventCode::READ | EventCode::WRITE | EventCode::EDGE_TRIGGERED, token)
    }

    /// Ensures WRITE readiness is not part of `fd`'s interest.
    fn disable_write(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.modify(fd, EventCode::READ | EventCode::EDGE_TRIGGERED, token)
    }

    /// Re-arms `fd` for READ after a delivered event. A no-op everywhere
    /// except event ports, where every delivered event consumes its
    /// association and must be re-`add`-ed.
    fn rearm_read(&self, _fd: RawFd, _token: Token) -> io::Result<()> {
        Ok(())
    }

    /// Interrupts a concurrent blocking `wait`, so a registration made from
    /// another thread (the listener→worker `assign` handoff) is
    /// observed promptly rather than after the backend's full wait
    /// timeout. The default is a no-op, correct only for backends whose
    /// `wait` timeout is short enough that the caller doesn't need it;
    /// every backend here overrides it with a self-pipe or platform
    /// equivalent.
    fn wake(&self) -> io::Result<()> {
        Ok(())
    }
}

/// An owned backend instance: the platform handle plus whatever private
/// bookkeeping that platform's registration scheme needs (the kqueue
/// write-filter set, the poll backend's fd array and [`crate::collections::byte_map::ByteMap`]).
pub trait Backend: Send + Sized {
    /// The cheaply-cloneable registration handle for this backend.
    type Registry: Registry + Clone + 'static;

    /// Creates the backend, sized to hold `capacity` registered
    /// descriptors (doubled internally for kqueue, which registers
    /// separate read and write filters per descriptor).
    fn setup(capacity: usize) -> io::Result<Self>;

    /// Returns a handle usable from any thread to add/modify/remove
    /// registrations.
    fn registry(&self) -> Self::Registry;

    /// Blocks up to `timeout` for readiness, appending fired events to
    /// `out` (cleared by the caller beforehand). Only ever called from the
    /// [`Poller`]'s own worker thread.
    fn wait(&mut self, timeout: Duration, out: &mut Vec<RawEvent>) -> io::Result<()>;
}

/// Receives events delivered by a [`Poller`]'s worker thread. Implemented
/// by [`crate::worker::Worker`] and [`crate::listener::Listener`].
///
/// `on_event` runs on the
/// poller's own thread and must not block; any panic or error it
/// encounters must be absorbed here; nothing propagates back into the
/// poller.
pub trait Handler<R: Registry>: Send {
    /// Dispatches one readiness record.
    fn on_event(&mut self, registry: &R, event: RawEvent);
    /// Invoked once per `wait` cycle (roughly every [`WAIT_TIMEOUT`]),
    /// whether or not that cycle delivered any events. The default is a
    /// no-op; a [`Handler`] that needs to notice the passage of time
    /// without a readiness event — an idle-connection sweep, say —
    /// overrides this instead of piggybacking on `on_event`.
    fn on_tick(&mut self, _registry: &R) {}
    /// Invoked exactly once as the poller thread exits, whether or not it
    /// was ever started.
    fn on_stop(&mut self) {}
}

/// One backend-chosen wait timeout (~1 second). Bounds how
/// long `stop()` may take to be observed.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives a [`Backend`] on its own thread, dispatching to a [`Handler`].
/// This is the single concrete type every Worker and Listener holds;
/// which backend it wraps is chosen once at compile time via
/// [`PlatformBackend`].
pub struct Poller<B: Backend> {
    registry: B::Registry,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    capacity: usize,
}

impl<B: Backend> Poller<B> {
    /// Builds and immediately starts the poller's worker thread, which
    /// runs `handler` until `stop()` is called or the backend fails
    /// irrecoverably.
    pub fn new<H>(capacity: usize, mut handler: H) -> io::Result<Self>
    where
        H: Handler<B::Registry> + 'static,
        B: 'static,
    {
        let mut backend = B::setup(capacity)?;
        let registry = backend.registry();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            let mut events = Vec::with_capacity(capacity.max(1));
            while !thread_stop.load(Ordering::Acquire) {
                events.clear();
                match backend.wait(WAIT_TIMEOUT, &mut events) {
                    Ok(()) => {
                        let registry = backend.registry();
                        for event in events.drain(..) {
                            handler.on_event(&registry, event);
                        }
                        handler.on_tick(&registry);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::error!(error = %e, "poller backend wait failed, stopping");
                        break;
                    }
                }
            }
            handler.on_stop();
        });

        Ok(Poller { registry, stop, thread: Some(thread), capacity })
    }

    /// A cheaply-cloneable handle for registering descriptors from any
    /// thread.
    pub fn registry(&self) -> B::Registry {
        self.registry.clone()
    }

    /// The configured capacity this poller was built with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests the worker thread to stop. Cooperative: the thread
    /// observes this before its next blocking wait and returns once the
    /// in-flight wait (bounded by `WAIT_TIMEOUT`) completes.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Blocks until the worker thread has exited. Idempotent.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<B: Backend> Debug for Poller<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("capacity", &self.capacity)
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B: Backend> Drop for Poller<B> {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Selects the concrete [`Backend`] for the current target at compile
/// time. The `poll-backend` feature forces the
/// generic fallback on any platform, for testing the Hash Map and
/// [`poll_backend`] modules uniformly in CI.
#[cfg(all(target_os = "linux", not(feature = "poll-backend")))]
pub type PlatformBackend = epoll::EpollBackend;

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ),
    not(feature = "poll-backend")
))]
pub type PlatformBackend = kqueue::KqueueBackend;

#[cfg(all(any(target_os = "illumos", target_os = "solaris"), not(feature = "poll-backend")))]
pub type PlatformBackend = event_ports::EventPortsBackend;

#[cfg(any(
    feature = "poll-backend",
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "illumos",
        target_os = "solaris"
    ))
))]
pub type PlatformBackend = poll_backend::PollBackend;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_code_bitor_and_contains() {
        let mask = EventCode::READ | EventCode::EDGE_TRIGGERED;
        assert!(mask.contains(EventCode::READ));
        assert!(mask.contains(EventCode::EDGE_TRIGGERED));
        assert!(!mask.contains(EventCode::WRITE));
    }

    #[test]
    fn event_code_without_clears_bit() {
        let mask = (EventCode::READ | EventCode::WRITE).without(EventCode::WRITE);
        assert!(mask.contains(EventCode::READ));
        assert!(!mask.contains(EventCode::WRITE));
    }

    #[test]
    fn reserved_tokens_are_distinct() {
        assert_ne!(Token::WAKE, Token::LISTENER);
    }
}
