//! Worker runtime.
//!
//! Each worker is single-threaded and readiness-driven (mio: epoll on
//! Linux, kqueue on macOS):
//! - `Connection`: per-connection state machine and buffers
//! - `request`: frames one HTTP request and runs the echo responder
//! - `event_loop`: the poll loop over a `SO_REUSEPORT` listener

mod connection;
mod event_loop;
mod request;

use crate::config::Config;
use event_loop::Worker;

/// Bind and run one worker until it fails.
pub fn run_worker(worker_id: usize, config: &Config) -> std::io::Result<()> {
    Worker::bind(worker_id, config)?.run()
}
