use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The two roles a process plays in the coordination cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Hosts or replicates coordination state.
    Server,

    /// Connects to the coordination cluster.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Errors raised while establishing coordination participation.
#[derive(Debug, Error)]
pub enum Error {
    /// A configured role file does not exist or cannot be read.
    #[error("failed to read coordination {role} config {}: {source}", path.display())]
    ConfigurationFile {
        /// The role the file configures.
        role: Role,

        /// The configured path.
        path: PathBuf,

        /// The underlying I/O failure.
        source: std::io::Error,
    },

    /// A configured role file was read but its contents were rejected.
    #[error("invalid coordination {role} config {}: {source}", path.display())]
    InvalidConfigurationFile {
        /// The role the file configures.
        role: Role,

        /// The configured path.
        path: PathBuf,

        /// The backend's rejection.
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The coordination cluster could not be joined or reached.
    #[error("coordination {role} unavailable: {source}")]
    CoordinationUnavailable {
        /// The role that failed.
        role: Role,

        /// The backend's failure.
        source: Box<dyn StdError + Send + Sync>,
    },
}
