//! echod: a multi-reactor TCP echo server.
//!
//! One main event loop accepts connections and hands them round-robin to
//! worker loops, each running on its own thread over Linux epoll. Every
//! connection is pinned to its loop for life; cross-thread work travels
//! through a per-loop task queue woken by an eventfd. An optional
//! fixed-size compute pool offloads the echo work and hands results back
//! to the I/O threads for transmission.

pub mod config;
pub mod pool;
pub mod runtime;
pub mod server;
pub mod signal;
