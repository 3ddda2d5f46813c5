//! cache-relay: a forwarding HTTP proxy with a path-keyed response cache
//!
//! The proxy sits between clients and a single upstream server:
//! - Clients are served one at a time on a loopback listener
//! - Requests are framed with a fixed-chunk heuristic (no length field)
//! - Responses for paths under a configured prefix are cached in memory
//! - Cache hits are answered without contacting the upstream
//! - Configuration via CLI arguments or TOML file

mod cache;
mod config;
mod error;
mod framer;
mod relay;
mod request;
mod server;
mod shutdown;

use config::Config;
use error::ProxyError;
use server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load().map_err(ProxyError::from)?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        upstream = %config.upstream,
        cache_prefix = %config.cache_prefix,
        cache_write = ?config.cache_write,
        read_timeout_ms = config.read_timeout.map(|t| t.as_millis() as u64),
        "Starting cache-relay"
    );

    let mut server = Server::new(config)?;
    match server.run() {
        // Only a signal ends the accept loop.
        Ok(()) => Ok(ExitCode::FAILURE),
        Err(e) => {
            if e.is_startup() {
                error!(error = %e, "Startup failed");
            } else {
                error!(error = %e, "Server failed");
            }
            Err(e.into())
        }
    }
}
