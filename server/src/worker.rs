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

//! Each Worker owns a Poller and drives the Jobs assigned to it through
//! their READ/WRITE lifecycle.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::job::{JobState, Progress};
use crate::manager::{JobHandle, Manager};
use crate::poller::{Backend, EventCode, Handler, Poller, RawEvent, Registry, Token};
use crate::transport::Transport;

/// The cheaply-cloneable half of a Worker, handed to every Listener that
/// may round-robin connections to it. Holding this instead of the Worker
/// itself is what lets several Listener threads (plaintext, TLS, v4, v6)
/// assign work to the same pool of Workers without sharing the Worker's
/// `Poller` join handle.
#[derive(Clone)]
pub struct WorkerHandle<R: Registry> {
    registry: R,
    jobs: Arc<Mutex<HashMap<usize, JobHandle>>>,
    capacity: usize,
}

impl<R: Registry> WorkerHandle<R> {
    /// Registers `transport` under the slot `handle` was acquired for, with
    /// READ|EDGE_TRIGGERED interest. Returns the pair
    /// back to the caller, unregistered, if this Worker is already at
    /// capacity or the registration itself fails — the Listener retries the
    /// next Worker in the same accept iteration.
    pub fn assign(&self, handle: JobHandle, transport: Transport) -> Result<(), (JobHandle, Transport)> {
        use std::os::unix::io::AsRawFd;

        let mut jobs = self.jobs.lock().unwrap();
        if jobs.len() >= self.capacity {
            return Err((handle, transport));
        }

        let idx = handle.index();
        let fd = transport.as_raw_fd();
        // SAFETY: `handle` was just acquired from the Manager and is not
        // shared with anything else yet.
        unsafe { handle.get_mut() }.install(transport);

        if let Err(e) = self.registry.add(fd, EventCode::READ | EventCode::EDGE_TRIGGERED, Token(idx)) {
            tracing::warn!(error = %e, "failed to register accepted connection with worker poller");
            // SAFETY: still exclusively ours; nothing else has observed idx.
            let transport = unsafe { handle.get_mut() }.take_transport().expect("just installed");
            return Err((handle, transport));
        }

        jobs.insert(idx, handle);
        Ok(())
    }
}

impl<R: Registry> std::fmt::Debug for WorkerHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("capacity", &self.capacity).finish()
    }
}

/// Owns one Poller and the Jobs currently registered with it.
pub struct Worker<B: Backend> {
    poller: Poller<B>,
}

impl<B: Backend + 'static> Worker<B> {
    /// Builds a Worker sized to `capacity` concurrent jobs, serving files
    /// under `root` and using a scratch buffer of `buffer_bytes` for the
    /// buffered sendfile fallback. Connections idle for longer than
    /// `io_timeout` are closed on the next tick.
    /// Returns the Worker (owned by the supervisor, for `stop`/`join`)
    /// paired with a [`WorkerHandle`] (cloned into every Listener).
    pub fn new(
        capacity: usize,
        manager: Manager,
        root: Arc<PathBuf>,
        buffer_bytes: usize,
        io_timeout: std::time::Duration,
    ) -> io::Result<(Self, WorkerHandle<B::Registry>)> {
        let jobs = Arc::new(Mutex::new(HashMap::new()));
        let handler = WorkerHandler {
            manager,
            jobs: Arc::clone(&jobs),
            root,
            scratch: vec![0u8; buffer_bytes.max(1)],
            io_timeout,
            _registry: std::marker::PhantomData,
        };
        let poller = Poller::new(capacity, handler)?;
        let handle = WorkerHandle { registry: poller.registry(), jobs, capacity };
        Ok((Worker { poller }, handle))
    }

    /// Requests the Worker's thread to stop, waking it immediately rather
    /// than waiting out the backend's wait timeout.
    pub fn stop(&self) {
        self.poller.stop();
        let _ = self.poller.registry().wake();
    }

    /// Blocks until the Worker's thread has exited. Idempotent.
    pub fn join(&mut self) {
        self.poller.join();
    }
}

impl<B: Backend> std::fmt::Debug for Worker<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("poller", &self.poller).finish()
    }
}

struct WorkerHandler<R: Registry> {
    manager: Manager,
    jobs: Arc<Mutex<HashMap<usize, JobHandle>>>,
    root: Arc<PathBuf>,
    scratch: Vec<u8>,
    io_timeout: std::time::Duration,
    _registry: std::marker::PhantomData<R>,
}

impl<R: Registry> WorkerHandler<R> {
    fn job_read(&mut self, idx: usize) -> Result<Progress, ()> {
        let jobs = self.jobs.lock().unwrap();
        let Some(handle) = jobs.get(&idx) else { return Err(()) };
        // SAFETY: only this Worker thread ever touches a Job once assigned;
        // the Mutex above serializes against `assign`/`finish_job`, neither
        // of which holds a live borrow across this call.
        let job = unsafe { handle.get_mut() };
        job.on_readable(&self.root).map_err(|e| {
            tracing::warn!(job = idx, error = %e, "read failed");
        })
    }

    fn job_write(&mut self, idx: usize) -> Result<Progress, ()> {
        let jobs = self.jobs.lock().unwrap();
        let Some(handle) = jobs.get(&idx) else { return Err(()) };
        // SAFETY: see `job_read`.
        let job = unsafe { handle.get_mut() };
        job.on_writable(&mut self.scratch).map_err(|e| {
            tracing::warn!(job = idx, error = %e, "write failed");
        })
    }

    fn job_state(&self, idx: usize) -> Option<JobState> {
        let jobs = self.jobs.lock().unwrap();
        let handle = jobs.get(&idx)?;
        // SAFETY: see `job_read`.
        Some(unsafe { handle.get() }.state())
    }

    fn has_more_write(&self, idx: usize) -> bool {
        let jobs = self.jobs.lock().unwrap();
        let Some(handle) = jobs.get(&idx) else { return false };
        // SAFETY: see `job_read`.
        unsafe { handle.get() }.has_more_write()
    }

    fn raw_fd(&self, idx: usize) -> Option<RawFd> {
        let jobs = self.jobs.lock().unwrap();
        let handle = jobs.get(&idx)?;
        // SAFETY: see `job_read`.
        unsafe { handle.get() }.raw_fd()
    }

    /// Removes the descriptor from the poller, closes the transport, and
    /// drops the `JobHandle` — releasing the slot back to the Manager.
    fn finish_job(&mut self, registry: &R, idx: usize) {
        let handle = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.remove(&idx)
        };
        let Some(handle) = handle else { return };

        // SAFETY: just removed from the map; no other reference survives.
        let job = unsafe { handle.get_mut() };
        if let Some(fd) = job.raw_fd() {
            let _ = registry.remove(fd, EventCode::READ | EventCode::WRITE);
        }
        if let Some(transport) = job.take_transport() {
            transport.close();
        }
        tracing::debug!(job = idx, "connection closed");
        // `handle` drops here, returning the slot to the Manager.
    }

    /// Collects the indices of jobs idle past `self.io_timeout`, without
    /// holding the jobs lock across the subsequent `finish_job` calls (which
    /// each re-acquire it).
    fn idle_jobs(&self) -> Vec<usize> {
        let jobs = self.jobs.lock().unwrap();
        jobs.iter()
            // SAFETY: see `job_read`.
            .filter(|(_, handle)| unsafe { handle.get() }.is_idle(self.io_timeout))
            .map(|(&idx, _)| idx)
            .collect()
    }

    /// Ensures WRITE interest matches `has_more_write` — the one call site that needs to know nothing about
    /// which backend is active; that policy lives on [`Registry`].
    fn adjust_interest(&self, registry: &R, idx: usize) {
        let Some(fd) = self.raw_fd(idx) else { return };
        let token = Token(idx);
        let result = if self.has_more_write(idx) {
            registry.enable_write(fd, token)
        } else {
            registry.disable_write(fd, token)
        };
        if let Err(e) = result {
            tracing::warn!(job = idx, error = %e, "failed to adjust poller interest");
        }
    }
}

impl<R: Registry> Handler<R> for WorkerHandler<R> {
    fn on_event(&mut self, registry: &R, event: RawEvent) {
        let idx = event.token.0;

        if event.code.contains(EventCode::CLOSE) {
            self.finish_job(registry, idx);
            return;
        }
        if event.code.contains(EventCode::ERROR) {
            tracing::warn!(job = idx, "socket error event");
            self.finish_job(registry, idx);
            return;
        }

        let mut close = false;

        if event.code.contains(EventCode::WRITE) {
            match self.job_write(idx) {
                Ok(Progress::Close) => close = true,
                Ok(Progress::Continue) | Ok(Progress::WriteDrained) => {}
                Err(()) => close = true,
            }
        }

        if !close && event.code.contains(EventCode::READ) {
            match self.job_read(idx) {
                Ok(Progress::Continue) => {
                    if self.job_state(idx) == Some(JobState::Write) {
                        // Piggyback: try to send immediately rather than
                        // waiting for a separate WRITE event.
                        match self.job_write(idx) {
                            Ok(Progress::Close) => close = true,
                            Ok(Progress::Continue) | Ok(Progress::WriteDrained) => {}
                            Err(()) => close = true,
                        }
                    }
                }
                Ok(Progress::WriteDrained) | Ok(Progress::Close) => {}
                Err(()) => close = true,
            }
        }

        if close {
            self.finish_job(registry, idx);
            return;
        }

        self.adjust_interest(registry, idx);
    }

    fn on_tick(&mut self, registry: &R) {
        for idx in self.idle_jobs() {
            tracing::debug!(job = idx, "closing idle connection");
            self.finish_job(registry, idx);
        }
    }

    fn on_stop(&mut self) {
        tracing::debug!("worker poller stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::poller::poll_backend::PollBackend;

    fn loopback_transport() -> Transport {
        let socket =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP)).unwrap();
        socket.set_nonblocking(true).unwrap();
        crate::transport::socket::wrap(socket, "127.0.0.1:0".parse().unwrap(), None).unwrap()
    }

    #[test]
    fn worker_handle_rejects_assign_past_capacity() {
        let manager = Manager::new(2);
        let root = Arc::new(PathBuf::from("."));
        let (_worker, handle) =
            Worker::<PollBackend>::new(1, manager.clone(), root, 4096, std::time::Duration::from_secs(60)).unwrap();

        let job_a = manager.acquire().unwrap();
        assert!(handle.assign(job_a, loopback_transport()).is_ok());

        let job_b = manager.acquire().unwrap();
        assert!(handle.assign(job_b, loopback_transport()).is_err());
    }
}
