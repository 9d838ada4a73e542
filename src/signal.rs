//! Signal handling for orderly shutdown.
//!
//! SIGINT and SIGTERM initiate `Server::stop`; a second signal forces an
//! immediate exit. SIGPIPE is ignored process-wide so a write to a dead
//! peer surfaces as `EPIPE` on the call instead of killing the process
//! (sends additionally pass `MSG_NOSIGNAL` as a second line of defence).

use crate::server::Server;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Ignore SIGPIPE for the whole process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Install the SIGINT/SIGTERM handler that stops `server`.
pub fn install_shutdown_handler(server: Arc<Server>) -> Result<(), ctrlc::Error> {
    let signalled = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if signalled.swap(true, Ordering::SeqCst) {
            warn!("received second shutdown signal, exiting immediately");
            std::process::exit(1);
        }
        info!("received shutdown signal, stopping server");
        server.stop();
    })
}
