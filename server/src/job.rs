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

//! The per-connection state machine: a [`crate::transport::Transport`]
//! plus HTTP request/response state, drawn from the [`crate::manager::Manager`]'s
//! object pool rather than the heap.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use parser::h1::Request;
use parser::{Header, Status, EMPTY_HEADER, MAX_HEADERS};

use crate::error::TransportError;
use crate::http::response::{self, Response};
use crate::transport::{IoOutcome, Transport};

/// Request-line-plus-headers size ceiling.
pub const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Where a [`Job`] sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Read,
    Write,
}

/// Outcome of driving a [`Job`] through one readiness event, reported back
/// to the [`crate::worker::Worker`] so it can adjust poller interest or
/// release the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The job is still in the same state and the connection stays open;
    /// no interest change is implied beyond what the caller already knows.
    Continue,
    /// The response (or its current phase) finished sending this call, and
    /// there are no more bytes to write, but the connection is kept alive
    /// for a subsequent request.
    WriteDrained,
    /// A transport-terminal error occurred, or the response mandates
    /// closing after send; the job must be released.
    Close,
}

/// The per-connection state bundle.
pub struct Job {
    transport: Option<Transport>,
    state: JobState,
    read_buf: Vec<u8>,
    read_len: usize,
    response: Option<Response>,
    sent_head: u64,
    sent_body: u64,
    sent_file: u64,
    last_activity: Instant,
}

impl Default for Job {
    fn default() -> Self {
        Job {
            transport: None,
            state: JobState::Read,
            read_buf: vec![0u8; MAX_REQUEST_BYTES],
            read_len: 0,
            response: None,
            sent_head: 0,
            sent_body: 0,
            sent_file: 0,
            last_activity: Instant::now(),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("state", &self.state)
            .field("read_len", &self.read_len)
            .field("sent_head", &self.sent_head)
            .field("sent_body", &self.sent_body)
            .field("sent_file", &self.sent_file)
            .finish()
    }
}

impl Job {
    /// Installs the freshly-accepted transport into an acquired slot.
    pub fn install(&mut self, transport: Transport) {
        self.transport = Some(transport);
        self.last_activity = Instant::now();
    }

    /// `true` once more than `timeout` has elapsed since the last byte was
    /// read or written on this connection.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut Transport> {
        self.transport.as_mut()
    }

    /// Takes ownership of the transport, leaving the job without one — the
    /// last step before the slot is released back to the Manager.
    pub fn take_transport(&mut self) -> Option<Transport> {
        self.transport.take()
    }

    /// The transport's raw file descriptor, used as the poller registration
    /// key. `None` before `install` or after `take_transport`.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(|t| t.as_raw_fd())
    }

    /// Drives the non-blocking TLS handshake, if any.
    pub fn establish_tls(&mut self) -> Result<(), TransportError> {
        self.transport.as_mut().expect("job has a transport while active").establish_tls()
    }

    /// Reads available bytes and, once a complete request has been parsed,
    /// builds the response and transitions to WRITE. Returns `Progress::Close` on any transport-terminal error or
    /// parse failure whose response mandates closing is itself still sent
    /// — closing there happens naturally once `has_more_write` drains and
    /// `should_close` is observed, not here.
    pub fn on_readable(&mut self, root: &Path) -> Result<Progress, TransportError> {
        debug_assert_eq!(self.state, JobState::Read);

        if !self.transport().expect("job has a transport while active").tls_established() {
            self.establish_tls()?;
            if !self.transport().expect("job has a transport while active").tls_established() {
                return Ok(Progress::Continue);
            }
        }

        let filled = self.read_len;
        if filled >= self.read_buf.len() {
            // Request line + headers exceeded the configured ceiling;
            // treat exactly like a parse failure.
            self.response = Some(response::bad_request());
            self.state = JobState::Write;
            return Ok(Progress::Continue);
        }

        let outcome = self
            .transport_mut()
            .expect("job has a transport while active")
            .receive(&mut self.read_buf, filled)?;
        let n = match outcome {
            IoOutcome::Progress(n) => n,
            IoOutcome::WouldBlock => return Ok(Progress::Continue),
            IoOutcome::Closed => return Ok(Progress::Close),
        };
        self.read_len += n;
        self.last_activity = Instant::now();

        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut request = Request::new(&mut headers);
        match request.parse(&self.read_buf[..self.read_len]) {
            Ok(Status::Partial) => Ok(Progress::Continue),
            Ok(Status::Complete(_)) => {
                tracing::trace!(connection_header = has_connection_header(request.headers()), "request parsed");
                self.response = Some(build_response(&request, root));
                self.state = JobState::Write;
                Ok(Progress::Continue)
            }
            Err(_) => {
                self.response = Some(response::bad_request());
                self.state = JobState::Write;
                Ok(Progress::Continue)
            }
        }
    }

    /// `true` iff any part of the response (head, body, or file) still has
    /// unsent bytes.
    pub fn has_more_write(&self) -> bool {
        let Some(response) = &self.response else { return false };
        self.sent_head < response.head.len() as u64 || self.sent_body_or_file_remaining(response)
    }

    fn sent_body_or_file_remaining(&self, response: &Response) -> bool {
        if self.sent_head < response.head.len() as u64 {
            return false;
        }
        match &response.body {
            response::Body::None => false,
            response::Body::String(b) => self.sent_body < b.len() as u64,
            response::Body::File { .. } => self.sent_file < response.body_len(),
        }
    }

    /// Sends as much of the head/body/file as fits without blocking.
    /// Scratch is used only for the buffered sendfile fallback.
    pub fn on_writable(&mut self, scratch: &mut [u8]) -> Result<Progress, TransportError> {
        debug_assert_eq!(self.state, JobState::Write);

        // response is always `Some` once state is Write.
        let head_len = self.response.as_ref().expect("response set while writing").head.len() as u64;
        if self.sent_head < head_len {
            let head = self.response.as_ref().unwrap().head.clone();
            let transport = self.transport_mut().expect("job has a transport while active");
            match transport.send(&head, self.sent_head as usize)? {
                IoOutcome::Progress(n) => self.sent_head += n as u64,
                IoOutcome::WouldBlock => return Ok(Progress::Continue),
                IoOutcome::Closed => return Ok(Progress::Close),
            }
            if self.sent_head < head_len {
                return Ok(Progress::Continue);
            }
        }

        let should_close = self.response.as_ref().unwrap().should_close;
        match &self.response.as_ref().unwrap().body {
            response::Body::None => {}
            response::Body::String(_) => {
                // Borrow body bytes without holding `self.response` borrowed
                // across the mutable `transport_mut()` call.
                let body = match &self.response.as_ref().unwrap().body {
                    response::Body::String(b) => b.clone(),
                    _ => unreachable!(),
                };
                let transport = self.transport_mut().expect("job has a transport while active");
                match transport.send(&body, self.sent_body as usize)? {
                    IoOutcome::Progress(n) => self.sent_body += n as u64,
                    IoOutcome::WouldBlock => return Ok(Progress::Continue),
                    IoOutcome::Closed => return Ok(Progress::Close),
                }
            }
            response::Body::File { file, len } => {
                let (file, len) = (file.try_clone()?, *len);
                let transport = self.transport_mut().expect("job has a transport while active");
                match transport.send_file(&file, 0, len, self.sent_file, scratch)? {
                    IoOutcome::Progress(n) => self.sent_file += n as u64,
                    IoOutcome::WouldBlock => return Ok(Progress::Continue),
                    IoOutcome::Closed => return Ok(Progress::Close),
                }
            }
        }

        self.last_activity = Instant::now();

        if self.has_more_write() {
            return Ok(Progress::Continue);
        }

        if should_close {
            Ok(Progress::Close)
        } else {
            self.reset();
            Ok(Progress::WriteDrained)
        }
    }

    /// Zeroes counters and HTTP state, keeping the Connection intact —
    /// the keep-alive path back to a fresh request.
    pub fn reset(&mut self) {
        self.state = JobState::Read;
        self.read_len = 0;
        self.response = None;
        self.sent_head = 0;
        self.sent_body = 0;
        self.sent_file = 0;
        self.last_activity = Instant::now();
    }
}

fn build_response(request: &Request<'_, '_>, root: &Path) -> Response {
    let (Some(method), Some(target)) = (request.method, request.target) else {
        return response::bad_request();
    };
    response::build(method, target, root)
}

/// `true` if the parsed request carried a `Connection` header, logged
/// purely as a diagnostic note — it does not change response
/// `Connection` header logic, which follows status code alone.
fn has_connection_header(headers: &[Header<'_>]) -> bool {
    headers.iter().any(|h| h.name.eq_ignore_ascii_case("connection"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_job_starts_in_read_state_with_zeroed_counters() {
        let job = Job::default();
        assert_eq!(JobState::Read, job.state());
        assert_eq!(0, job.sent_head);
        assert_eq!(0, job.sent_body);
        assert_eq!(0, job.sent_file);
        assert!(!job.has_more_write());
    }

    #[test]
    fn reset_clears_response_and_counters_but_keeps_state_read() {
        let mut job = Job::default();
        job.response = Some(response::bad_request());
        job.sent_head = 3;
        job.state = JobState::Write;
        job.reset();
        assert_eq!(JobState::Read, job.state());
        assert_eq!(0, job.sent_head);
        assert!(job.response.is_none());
    }

    #[test]
    fn fresh_job_is_not_idle_but_becomes_idle_past_the_timeout() {
        let job = Job::default();
        assert!(!job.is_idle(Duration::from_secs(60)));
        assert!(job.is_idle(Duration::from_secs(0)));
    }

    #[test]
    fn has_connection_header_matches_case_insensitively() {
        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        headers[0] = parser::Header { name: "Connection", value: b"keep-alive" };
        assert!(has_connection_header(&headers[..1]));
        assert!(!has_connection_header(&headers[..0]));
    }
}
