use crate::mutex::NatsMutex;
use crate::retry::RetryPolicy;
use crate::Error;

use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use warden_bootable::Bootable;
use warden_coordination::CoordinationClient;

/// Settings for the lock bucket, from the `[lock]` table of a client config file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LockSettings {
    /// The KV bucket holding the locks.
    pub bucket: String,

    /// Number of replicas for the KV store. Should be at least 3 in a cluster.
    pub replicas: usize,

    /// Seconds an unrenewed lock survives its holder.
    pub ttl_secs: u64,

    /// Whether to persist the locks to disk.
    pub persist: bool,

    /// Timeout for individual `JetStream` operations, in milliseconds.
    pub operation_timeout_ms: u64,

    /// Maximum number of attempts for failed operations.
    pub max_retries: usize,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            bucket: "warden_locks".to_string(),
            replicas: 1,
            ttl_secs: 30,
            persist: false,
            operation_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

impl LockSettings {
    pub(crate) fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            max_retries: self.max_retries.max(1),
            ..RetryPolicy::default()
        }
    }
}

/// Client role settings, parsed from a TOML client config file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Server URLs to connect to. Empty means the default URL.
    pub servers: Vec<String>,

    /// Connection name reported to the server.
    pub name: Option<String>,

    /// Timeout for a single connection attempt, in seconds.
    pub connect_timeout_secs: u64,

    /// Attempts made before the cluster is declared unreachable.
    pub connect_attempts: usize,

    /// Lock bucket settings.
    pub lock: LockSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            name: None,
            connect_timeout_secs: 5,
            connect_attempts: 5,
            lock: LockSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Parses settings from the contents of a client config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidClientConfig`] if the contents are not valid.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        Ok(toml::from_str(contents)?)
    }
}

/// The client role: a NATS connection whose session owns locks.
pub struct NatsClient {
    settings: ClientSettings,
    default_url: String,
    session_id: String,
    connection: Mutex<Option<Client>>,
    session: CancellationToken,
    running: watch::Sender<bool>,
}

impl NatsClient {
    pub(crate) fn new(settings: ClientSettings, default_url: String) -> Self {
        Self {
            settings,
            default_url,
            session_id: format!("warden-{}", Uuid::new_v4().as_hyphenated()),
            connection: Mutex::new(None),
            session: CancellationToken::new(),
            running: watch::Sender::new(false),
        }
    }

    /// The settings this client was created with.
    #[must_use]
    pub const fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn server_addrs(&self) -> String {
        if self.settings.servers.is_empty() {
            self.default_url.clone()
        } else {
            self.settings.servers.join(",")
        }
    }
}

#[async_trait]
impl Bootable for NatsClient {
    type Error = Error;

    fn bootable_name(&self) -> &'static str {
        "nats-client"
    }

    #[instrument(skip(self), fields(session = %self.session_id))]
    async fn start(&self) -> Result<(), Self::Error> {
        let mut connection = self.connection.lock().await;

        if connection.is_some() || self.session.is_cancelled() {
            return Err(Error::AlreadyStarted);
        }

        let addrs = self.server_addrs();
        let name = self
            .settings
            .name
            .clone()
            .unwrap_or_else(|| self.session_id.clone());
        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs.max(1));

        let policy = RetryPolicy {
            // The connection timeout applies per attempt; leave headroom around it
            operation_timeout: connect_timeout * 2,
            max_retries: self.settings.connect_attempts.max(1),
            base_delay: Duration::from_millis(250),
            ..RetryPolicy::default()
        };

        let client = policy
            .run("connect", || {
                let addrs = addrs.clone();
                let options = ConnectOptions::new()
                    .name(name.clone())
                    .connection_timeout(connect_timeout);
                async move { options.connect(addrs).await }
            })
            .await
            .map_err(|e| match e {
                Error::MaxRetriesExceeded {
                    max_attempts,
                    last_error,
                }
                | Error::Timeout {
                    attempts: max_attempts,
                    last_error,
                } => Error::ClientFailedToConnect {
                    attempts: max_attempts,
                    last_error,
                },
                other => other,
            })?;

        info!(servers = %addrs, "connected to nats");

        connection.replace(client);
        self.running.send_replace(true);

        Ok(())
    }

    #[instrument(skip(self), fields(session = %self.session_id))]
    async fn shutdown(&self) -> Result<(), Self::Error> {
        // Stops lock renewals and invalidates outstanding mutex handles
        self.session.cancel();

        let Some(client) = self.connection.lock().await.take() else {
            debug!("nats client not connected");
            return Ok(());
        };

        if let Err(e) = client.flush().await {
            warn!(error = %e, "failed to flush nats client");
        }
        drop(client);

        self.running.send_replace(false);
        info!("nats client shut down");

        Ok(())
    }

    async fn wait(&self) {
        let _ = self.running.subscribe().wait_for(|running| !*running).await;
    }
}

#[async_trait]
impl CoordinationClient for NatsClient {
    type Mutex = NatsMutex;

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn mutex(&self, name: &str) -> Result<Self::Mutex, Self::Error> {
        let connection = self.connection.lock().await;
        let Some(client) = connection.as_ref().filter(|_| !self.session.is_cancelled()) else {
            return Err(Error::NotConnected);
        };

        Ok(NatsMutex::new(
            name.to_string(),
            async_nats::jetstream::new(client.clone()),
            self.session_id.clone(),
            self.settings.lock.clone(),
            self.session.clone(),
        ))
    }
}
