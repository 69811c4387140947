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

//! Send-file variant selection: KTLS-offloaded, kernel
//! socket-to-file, or a buffered `lseek`/`read`/`send` fallback. Variant
//! choice happens once per call based on cached state (TLS + KTLS
//! availability, platform); none of the three paths probes per call.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;

use super::{IoOutcome, Transport};
use crate::error::TransportError;

pub(super) fn send_file(
    transport: &mut Transport,
    file: &std::fs::File,
    offset: u64,
    len: u64,
    sent: u64,
    scratch: &mut [u8],
) -> Result<IoOutcome, TransportError> {
    if sent >= len {
        return Ok(IoOutcome::Progress(0));
    }

    // KTLS would let a plain socket-level sendfile transmit already-
    // encrypted records once the kernel's `tls` ULP is programmed with the
    // negotiated traffic secrets for this connection. `tls::probe_ktls_support`
    // only records host *capability*; per-connection enablement (handing
    // the negotiated secrets to `setsockopt(SOL_TLS, ...)`) is not wired up
    // here, so every TLS connection currently takes the buffered path below.
    // TODO: enable KTLS per-connection once rustls exposes the negotiated
    // traffic secrets needed to program the kernel's ULP.
    if !transport.has_tls() {
        if let Some(outcome) = try_kernel_sendfile(transport, file, offset, len, sent)? {
            return Ok(outcome);
        }
    }

    buffered_send(transport, file, offset, len, sent, scratch)
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn try_kernel_sendfile(
    transport: &mut Transport,
    file: &std::fs::File,
    offset: u64,
    len: u64,
    sent: u64,
) -> Result<Option<IoOutcome>, TransportError> {
    Ok(Some(kernel_sendfile(transport, file, offset, len, sent)?))
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
fn try_kernel_sendfile(
    _transport: &mut Transport,
    _file: &std::fs::File,
    _offset: u64,
    _len: u64,
    _sent: u64,
) -> Result<Option<IoOutcome>, TransportError> {
    Ok(None)
}

#[cfg(target_os = "linux")]
fn kernel_sendfile(
    transport: &mut Transport,
    file: &std::fs::File,
    offset: u64,
    len: u64,
    sent: u64,
) -> Result<IoOutcome, TransportError> {
    let out_fd = transport.socket().as_raw_fd();
    let in_fd = file.as_raw_fd();
    let mut file_offset = (offset + sent) as libc::off_t;
    let remaining = (len - sent) as libc::size_t;

    let n = unsafe { libc::sendfile(out_fd, in_fd, &mut file_offset, remaining) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(IoOutcome::WouldBlock);
        }
        return Err(err.into());
    }
    Ok(IoOutcome::Progress(n as usize))
}

#[cfg(target_os = "freebsd")]
fn kernel_sendfile(
    transport: &mut Transport,
    file: &std::fs::File,
    offset: u64,
    len: u64,
    sent: u64,
) -> Result<IoOutcome, TransportError> {
    let out_fd = transport.socket().as_raw_fd();
    let in_fd = file.as_raw_fd();
    let mut sbytes: libc::off_t = 0;

    let ret = unsafe {
        libc::sendfile(
            in_fd,
            out_fd,
            (offset + sent) as libc::off_t,
            (len - sent) as libc::size_t,
            std::ptr::null_mut(),
            &mut sbytes,
            0,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock && sbytes > 0 {
            return Ok(IoOutcome::Progress(sbytes as usize));
        }
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(IoOutcome::WouldBlock);
        }
        return Err(err.into());
    }
    Ok(IoOutcome::Progress(sbytes as usize))
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
fn kernel_sendfile(
    _transport: &mut Transport,
    _file: &std::fs::File,
    _offset: u64,
    _len: u64,
    _sent: u64,
) -> Result<IoOutcome, TransportError> {
    unreachable!("kernel_sendfile is only selected where try_kernel_sendfile returns Some")
}

/// `lseek` → `read` into `scratch` → `send` (or TLS-write), preserving the
/// sent-count across calls.
fn buffered_send(
    transport: &mut Transport,
    file: &std::fs::File,
    offset: u64,
    len: u64,
    sent: u64,
    scratch: &mut [u8],
) -> Result<IoOutcome, TransportError> {
    let mut file = file.try_clone().map_err(TransportError::from)?;
    file.seek(SeekFrom::Start(offset + sent)).map_err(TransportError::from)?;

    let want = std::cmp::min(scratch.len() as u64, len - sent) as usize;
    let n = file.read(&mut scratch[..want]).map_err(TransportError::from)?;
    if n == 0 {
        return Ok(IoOutcome::Progress(0));
    }

    match transport.send(&scratch[..n], 0)? {
        IoOutcome::Progress(written) => Ok(IoOutcome::Progress(written)),
        IoOutcome::WouldBlock => Ok(IoOutcome::WouldBlock),
        IoOutcome::Closed => Ok(IoOutcome::Closed),
    }
}
