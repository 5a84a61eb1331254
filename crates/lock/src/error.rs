use std::error::Error as StdError;

use thiserror::Error;

/// Errors raised by the lock and its lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// The lifecycle was started while already running.
    #[error("lock lifecycle already started")]
    AlreadyStarted,

    /// The configuration properties could not be resolved.
    #[error(transparent)]
    Configuration(#[from] warden_config::Error),

    /// Coordination participation could not be established.
    #[error(transparent)]
    Coordination(#[from] warden_coordination::Error),

    /// The coordination cluster could not be reached during a lock operation.
    #[error("lost coordination connectivity while {operation} lock {name}: {source}")]
    Connectivity {
        /// The lock being operated on.
        name: String,

        /// What was being done when connectivity failed.
        operation: &'static str,

        /// The backend's failure.
        source: Box<dyn StdError + Send + Sync>,
    },
}
