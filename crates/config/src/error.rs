use std::num::ParseIntError;

use thiserror::Error;

/// Errors that can occur while resolving the lock configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// The lock timeout is present but is not a non-negative integer.
    #[error("invalid lock timeout {value:?}: {source}")]
    InvalidTimeout {
        /// The raw value that failed to parse.
        value: String,

        /// The underlying parse failure.
        source: ParseIntError,
    },
}
