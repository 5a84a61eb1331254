use thiserror::Error;
use warden_coordination::CoordinationError;

/// Errors that can occur when using the in-memory coordination backend.
#[derive(Debug, Error)]
pub enum Error {
    /// The server role was started twice.
    #[error("memory coordination server already started")]
    AlreadyStarted,

    /// A role config file could not be parsed.
    #[error("invalid memory role config: {0}")]
    InvalidConfig(#[from] toml::de::Error),

    /// The client has not connected, or has been shut down.
    #[error("memory coordination client is not connected")]
    NotConnected,

    /// The cluster no longer knows the client's session.
    #[error("session {0} has expired")]
    SessionExpired(String),

    /// The simulated link to the cluster has been cut.
    #[error("link to the memory coordination cluster is severed")]
    Severed,

    /// No server in the cluster could be reached within the retry budget.
    #[error("no server reachable in cluster {cluster} after {attempts} attempts")]
    Unreachable {
        /// The cluster the client tried to reach.
        cluster: String,

        /// Number of connection attempts made.
        attempts: usize,
    },
}

impl CoordinationError for Error {
    fn is_config(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}
