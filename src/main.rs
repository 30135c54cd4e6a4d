//! echo-pool: A multi-process HTTP echo server
//!
//! A test fixture for load balancers and proxies. Every request is answered
//! with 200 and a description of itself:
//! - Method, absolute URL, query parameters, headers, HTTP version
//! - The request body for POST, PUT, DELETE and PATCH (parsed if JSON)
//! - JSON by default, HTML with `?format=html`
//!
//! Features:
//! - A supervisor fanning workers out over one `SO_REUSEPORT` port
//! - Process or thread workers, each a single-threaded mio event loop
//! - Configuration via CLI arguments or TOML file

mod config;
mod echo;
mod http;
mod runtime;
mod supervisor;

use config::Config;
use std::io::IsTerminal;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    if let Some(worker_id) = config.worker_id {
        supervisor::run_worker_process(worker_id, &config)?;
        return Ok(());
    }

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        mode = ?config.mode,
        html = config.html,
        "Starting echo-pool server"
    );

    supervisor::run(&config)?;
    Ok(())
}
