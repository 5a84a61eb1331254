//! NATS `JetStream` coordination backend.
//!
//! The server role runs a local `nats-server` (or attaches to one already
//! listening on the default port). The client role connects to the cluster
//! and hands out [`NatsMutex`]es: locks stored as keys in a KV bucket whose
//! value is the owning session's identifier.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;
mod mutex;
mod retry;
mod server;

pub use client::{ClientSettings, LockSettings, NatsClient};
pub use error::Error;
pub use mutex::NatsMutex;
pub use retry::RetryPolicy;
pub use server::NatsServer;

use server::ServerMode;

use std::path::PathBuf;
use std::time::Duration;

use warden_coordination::{CoordinationBackend, RoleConfig};

/// Client port used by default discovery.
pub const DEFAULT_CLIENT_PORT: u16 = 4222;

/// Environment variable overriding the URL default discovery connects to.
pub const NATS_URL_ENV: &str = "NATS_URL";

/// Options for configuring a [`NatsBackend`].
#[derive(Clone, Debug)]
pub struct NatsBackendOptions {
    /// Optional path to the NATS server binary if it is not in the PATH.
    pub server_bin_dir: Option<PathBuf>,

    /// The port the default-discovery server listens for clients on.
    pub client_port: u16,

    /// The `JetStream` store directory of the default-discovery server.
    pub store_dir: PathBuf,

    /// Whether to enable debug logging on the server.
    pub debug: bool,

    /// How long a spawned server may take to report readiness.
    pub startup_timeout: Duration,
}

impl Default for NatsBackendOptions {
    fn default() -> Self {
        Self {
            server_bin_dir: None,
            client_port: DEFAULT_CLIENT_PORT,
            store_dir: PathBuf::from("/tmp/warden/nats"),
            debug: false,
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds NATS server and client roles.
#[derive(Clone, Debug, Default)]
pub struct NatsBackend {
    options: NatsBackendOptions,
}

impl NatsBackend {
    /// Creates a backend with the given options.
    #[must_use]
    pub const fn new(options: NatsBackendOptions) -> Self {
        Self { options }
    }

    /// The URL clients connect to when their config names no servers.
    #[must_use]
    pub fn default_url(&self) -> String {
        std::env::var(NATS_URL_ENV)
            .unwrap_or_else(|_| format!("nats://127.0.0.1:{}", self.options.client_port))
    }
}

impl CoordinationBackend for NatsBackend {
    type Error = Error;
    type Server = NatsServer;
    type Client = NatsClient;

    fn server(&self, config: RoleConfig) -> Result<Self::Server, Self::Error> {
        let mode = match config {
            RoleConfig::Discovery => ServerMode::Discovery {
                client_port: self.options.client_port,
                store_dir: self.options.store_dir.clone(),
            },
            RoleConfig::File { path, .. } => ServerMode::File(path),
        };

        Ok(NatsServer::new(
            mode,
            self.options.server_bin_dir.clone(),
            self.options.debug,
            self.options.startup_timeout,
        ))
    }

    fn client(&self, config: RoleConfig) -> Result<Self::Client, Self::Error> {
        let settings = match config {
            RoleConfig::Discovery => ClientSettings::default(),
            RoleConfig::File { contents, .. } => ClientSettings::parse(&contents)?,
        };

        Ok(NatsClient::new(settings, self.default_url()))
    }
}
