//! Minimal embedding example: serves `./www` on plaintext HTTP with a
//! single worker, using the library directly instead of the `raskd` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rask::listener::Listener;
use rask::manager::Manager;
use rask::poller::PlatformBackend;
use rask::transport::socket;
use rask::worker::Worker;

fn main() {
    tracing_subscriber::fmt().init();

    let manager = Manager::new(255);
    let root = Arc::new(PathBuf::from("./www"));

    let (worker, handle) = Worker::<PlatformBackend>::new(255, manager.clone(), root, 1024 * 1024)
        .expect("failed to start worker poller");

    let server_socket = socket::bind("0.0.0.0:8080".parse().unwrap(), 1024).expect("failed to bind 0.0.0.0:8080");
    let listener = Listener::<PlatformBackend>::new(
        server_socket,
        None,
        manager,
        vec![handle],
        Duration::from_secs(60),
        Duration::from_secs(60),
    )
    .expect("failed to start listener poller");

    println!("listening on 0.0.0.0:8080, serving ./www");

    // Block the main thread; Ctrl+C terminates the process directly since
    // this example skips the supervisor's graceful-shutdown sequence.
    // `listener` and `worker` stay alive in this scope for exactly that
    // reason — dropping either would stop its poller thread.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
