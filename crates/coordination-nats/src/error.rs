use std::time::Duration;

use thiserror::Error;
use warden_coordination::CoordinationError;

/// Errors that can occur when using the NATS coordination backend.
#[derive(Error, Debug)]
pub enum Error {
    /// The role was started twice.
    #[error("nats role already started")]
    AlreadyStarted,

    /// The `nats-server` binary could not be located.
    #[error("nats-server binary not found: {0}")]
    BinaryNotFound(#[from] which::Error),

    /// The client could not reach any server.
    #[error("failed to connect to nats after {attempts} attempts: {last_error}")]
    ClientFailedToConnect {
        /// Number of connection attempts made.
        attempts: usize,
        /// The last error message received.
        last_error: String,
    },

    /// Creating a lock entry failed for a reason other than it already existing.
    #[error("NATS KV store create operation error: {0}")]
    CreateError(#[from] async_nats::jetstream::kv::CreateError),

    /// The client role config file could not be parsed.
    #[error("invalid nats client config: {0}")]
    InvalidClientConfig(#[from] toml::de::Error),

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({max_attempts}) exceeded for NATS operation: {last_error}")]
    MaxRetriesExceeded {
        /// Maximum number of attempts that were allowed.
        max_attempts: usize,
        /// The last error message received.
        last_error: String,
    },

    /// The client has not connected, or has been shut down.
    #[error("nats client is not connected")]
    NotConnected,

    /// The server process exited before becoming ready.
    #[error("nats server exited during startup ({0})")]
    ServerExited(String),

    /// The server process did not report readiness in time.
    #[error("nats server not ready after {0:?}")]
    ServerNotReady(Duration),

    /// Signalling the server process failed.
    #[error("failed to signal nats server: {0}")]
    Signal(#[from] nix::Error),

    /// The server process could not be spawned.
    #[error("failed to spawn nats server: {0}")]
    Spawn(std::io::Error),

    /// Timeout error during NATS operation.
    #[error("NATS operation timed out after {attempts} attempts: {last_error}")]
    Timeout {
        /// Number of attempts made before timing out.
        attempts: usize,
        /// The last error message received.
        last_error: String,
    },
}

impl CoordinationError for Error {
    fn is_config(&self) -> bool {
        matches!(self, Self::InvalidClientConfig(_))
    }
}
