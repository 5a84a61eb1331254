//! Runs a process as the single active instance across a cluster, guarded by a
//! distributed lock.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod host;

use host::Host;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warden_coordination_nats::{NatsBackend, NatsBackendOptions};
use warden_lock::LockLifecycleManager;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lock lifecycle error
    #[error(transparent)]
    Lock(#[from] warden_lock::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Lock property as key=value, e.g. `warden.lock.name=scheduler` (repeatable)
    #[arg(
        short = 'p',
        long = "property",
        value_parser = parse_property,
        value_delimiter = ',',
        env = "WARDEN_PROPERTIES"
    )]
    properties: Vec<(String, String)>,

    /// Port the default NATS server listens for clients on
    #[arg(long, default_value_t = 4222, env = "WARDEN_NATS_CLIENT_PORT")]
    nats_client_port: u16,

    /// Whether to enable NATS server debug logging
    #[arg(long, default_value_t = false, env = "WARDEN_NATS_DEBUG")]
    nats_debug: bool,

    /// Optional path to the NATS server binary directory if it is not in the PATH
    #[arg(long, env = "WARDEN_NATS_SERVER_BIN_DIR")]
    nats_server_bin_dir: Option<PathBuf>,

    /// NATS `JetStream` store directory for the default server
    #[arg(long, default_value = "/tmp/warden/nats", env = "WARDEN_NATS_STORE_DIR")]
    nats_store_dir: PathBuf,

    /// Milliseconds between lock polls
    #[arg(long, default_value_t = 1000, env = "WARDEN_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,
}

/// Parses a `key=value` property. The value may itself contain `=`.
fn parse_property(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid property `{s}`: expected key=value"))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid property `{s}`: empty key"));
    }

    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for better logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let properties: HashMap<String, String> = args.properties.into_iter().collect();

    let backend = NatsBackend::new(NatsBackendOptions {
        server_bin_dir: args.nats_server_bin_dir,
        client_port: args.nats_client_port,
        store_dir: args.nats_store_dir,
        debug: args.nats_debug,
        ..NatsBackendOptions::default()
    });
    let host = Host::new(
        LockLifecycleManager::new(backend, properties),
        Duration::from_millis(args.poll_interval_ms.max(1)),
    );

    // Create shared shutdown token
    let shutdown_token = CancellationToken::new();

    // Set up signal handlers
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        if cfg!(unix) {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler failed");
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler failed");

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        } else {
            // Fall back to just ctrl-c on non-unix platforms
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        signal_shutdown_token.cancel();
    });

    host.run(shutdown_token).await.map_err(Error::Lock)
}
