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

//! Wires the Manager, Workers, and Listeners together, installs signal
//! handling, and runs the shutdown sequence.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::ConfigError;
use crate::listener::Listener;
use crate::manager::Manager;
use crate::poller::{Backend, PlatformBackend};
use crate::transport::socket;
use crate::transport::tls::TlsServerConfig;
use crate::worker::{Worker, WorkerHandle};

/// Backlog passed to `listen(2)` for every bound server socket.
const BACKLOG: i32 = 1024;

/// Socket read/write timeouts applied to accepted connections. Not currently exposed on the
/// command line; fixed at a generous value pending a future `Config` field.
const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Failures that can abort startup, beyond the `ConfigError`s surfaced by
/// argument parsing and TLS material loading — binding a listener socket or
/// standing up a Worker's poller can also fail, and both are still
/// startup-fatal.
#[derive(Debug)]
pub enum BootstrapError {
    /// Parsing or validating `Config` itself failed.
    Config(ConfigError),
    /// Binding or registering a listener socket failed.
    Bind { address: SocketAddr, source: io::Error },
    /// A Worker's poller failed to initialize.
    Worker(io::Error),
}

impl Display for BootstrapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Config(e) => Display::fmt(e, f),
            BootstrapError::Bind { address, .. } => write!(f, "failed to bind {address}"),
            BootstrapError::Worker(_) => f.write_str("failed to initialize a worker poller"),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootstrapError::Config(e) => Some(e),
            BootstrapError::Bind { source, .. } => Some(source),
            BootstrapError::Worker(e) => Some(e),
        }
    }
}

impl From<ConfigError> for BootstrapError {
    fn from(e: ConfigError) -> Self {
        BootstrapError::Config(e)
    }
}

impl BootstrapError {
    /// The process exit code for this failure: the OS errno of the
    /// underlying I/O failure when one is available, else `1`.
    pub fn exit_code(&self) -> i32 {
        let io_error = match self {
            BootstrapError::Config(ConfigError::Pem { source, .. }) => Some(source),
            BootstrapError::Bind { source, .. } => Some(source),
            BootstrapError::Worker(e) => Some(e),
            _ => None,
        };
        io_error.and_then(io::Error::raw_os_error).unwrap_or(1)
    }
}

/// Owns every long-lived piece of the running server: the Manager (via the
/// Workers it handed clones to), the Worker pool, and the Listener(s) bound
/// to it. Built once by [`Supervisor::bootstrap`], then driven by
/// [`Supervisor::run`].
pub struct Supervisor {
    workers: Vec<Worker<PlatformBackend>>,
    listeners: Vec<Listener<PlatformBackend>>,
    stop_requested: Arc<AtomicBool>,
}

impl Supervisor {
    /// Validates TLS material if `config.enable_tls`, spins up the Worker
    /// pool, and binds every configured listener. Each Worker and
    /// Listener starts its own Poller thread as soon as it's constructed
    /// — nothing
    /// is deferred to [`Supervisor::run`].
    pub fn bootstrap(config: &Config) -> Result<Self, BootstrapError> {
        let manager = Manager::new(config.max_connections);
        let document_root = Arc::new(config.document_root.clone());

        let tls_config = if config.enable_tls {
            Some(Arc::new(TlsServerConfig::from_pem(&config.tls_certificate_path, &config.tls_private_key_path)?))
        } else {
            None
        };

        let mut workers = Vec::with_capacity(config.worker_count);
        let mut worker_handles = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            let (worker, handle) = Worker::new(
                config.max_connections,
                manager.clone(),
                Arc::clone(&document_root),
                config.per_transfer_buffer_bytes,
                IO_TIMEOUT,
            )
            .map_err(BootstrapError::Worker)?;
            workers.push(worker);
            worker_handles.push(handle);
        }

        let mut listeners = Vec::new();
        bind_listener(&mut listeners, IpAddr::V4(config.ipv4_bind_address), config.http_port, None, &manager, &worker_handles)?;
        if config.enable_tls {
            bind_listener(
                &mut listeners,
                IpAddr::V4(config.ipv4_bind_address),
                config.https_port,
                tls_config.clone(),
                &manager,
                &worker_handles,
            )?;
        }
        if config.enable_ipv6 {
            bind_listener(&mut listeners, IpAddr::V6(config.ipv6_bind_address), config.http_port, None, &manager, &worker_handles)?;
            if config.enable_tls {
                bind_listener(
                    &mut listeners,
                    IpAddr::V6(config.ipv6_bind_address),
                    config.https_port,
                    tls_config.clone(),
                    &manager,
                    &worker_handles,
                )?;
            }
        }

        tracing::info!(
            workers = config.worker_count,
            max_connections = config.max_connections,
            tls = config.enable_tls,
            ipv6 = config.enable_ipv6,
            document_root = %document_root.display(),
            "rask starting"
        );

        Ok(Supervisor { workers, listeners, stop_requested: Arc::new(AtomicBool::new(false)) })
    }

    /// Installs `SIGINT`-triggers-shutdown and ignores `SIGPIPE`. `SIGPIPE` is ignored
    /// because every write already goes through non-blocking sockets whose
    /// errors are reported via `EPIPE`/`ECONNRESET`, not a fatal signal.
    fn install_signal_handlers(&self) -> io::Result<()> {
        // SAFETY: SIG_IGN is a valid, static disposition; no signal-unsafe
        // code runs in response to it.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.stop_requested))?;
        Ok(())
    }

    /// Blocks until a shutdown signal arrives, then stops all Listeners,
    /// joins them, then stops all Workers and joins them. Returns once
    /// every thread has exited.
    pub fn run(mut self) {
        if let Err(e) = self.install_signal_handlers() {
            tracing::error!(error = %e, "failed to install signal handlers, shutting down immediately");
            self.shutdown();
            return;
        }

        while !self.stop_requested.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
        }

        tracing::info!("shutdown signal received");
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for listener in &self.listeners {
            listener.stop();
        }
        for listener in &mut self.listeners {
            listener.join();
        }
        for worker in &self.workers {
            worker.stop();
        }
        for worker in &mut self.workers {
            worker.join();
        }
        tracing::info!("shutdown complete");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.workers.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn bind_listener(
    listeners: &mut Vec<Listener<PlatformBackend>>,
    addr: IpAddr,
    port: u16,
    tls_config: Option<Arc<TlsServerConfig>>,
    manager: &Manager,
    worker_handles: &[WorkerHandle<<PlatformBackend as Backend>::Registry>],
) -> Result<(), BootstrapError> {
    let bind_addr = SocketAddr::new(addr, port);
    let is_tls = tls_config.is_some();
    let server_socket = socket::bind(bind_addr, BACKLOG).map_err(|source| BootstrapError::Bind { address: bind_addr, source })?;
    let listener = Listener::new(server_socket, tls_config, manager.clone(), worker_handles.to_vec())
        .map_err(|source| BootstrapError::Bind { address: bind_addr, source })?;
    tracing::info!(address = %bind_addr, tls = is_tls, "listening");
    listeners.push(listener);
    Ok(())
}
