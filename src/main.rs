//! ringkv: a single-node, in-memory key-value server speaking a RESP 2.0
//! subset over a completion-based io_uring engine.

mod config;
mod connection;
mod error;
mod resp;
mod runtime;
mod server;
mod signal;
mod store;

use config::CliArgs;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::load();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(port = config::PORT, "starting ringkv");

    let server = Server::bind().map_err(|e| {
        error!(error = %e, "failed to initialize server");
        e
    })?;

    server.run()?;

    info!("ringkv shut down");
    Ok(())
}
