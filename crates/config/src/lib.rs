//! Resolution of the lock's operating parameters from key/value properties.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

/// Property key for the name of the distributed mutex.
pub const LOCK_NAME_KEY: &str = "warden.lock.name";

/// Property key for the advisory acquisition timeout, in seconds.
pub const LOCK_TIMEOUT_KEY: &str = "warden.lock.timeout";

/// Property key for the file configuring the coordination server role.
pub const SERVER_CONFIG_PATH_KEY: &str = "warden.lock.server.config.path";

/// Property key for the file configuring the coordination client role.
pub const CLIENT_CONFIG_PATH_KEY: &str = "warden.lock.client.config.path";

/// Lock name used when none is configured.
pub const DEFAULT_LOCK_NAME: &str = "DEFAULT_LOCK";

/// Acquisition timeout used when none is configured.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Immutable snapshot of the lock's operating parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockConfiguration {
    name: String,
    acquire_timeout_secs: u64,
    server_config_path: Option<PathBuf>,
    client_config_path: Option<PathBuf>,
}

impl LockConfiguration {
    /// Resolves the configuration from a mapping of properties.
    ///
    /// Unrecognised keys are ignored and missing keys take their defaults. Blank
    /// lock names and blank paths count as missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTimeout`] if the timeout is present but is not a
    /// non-negative integer.
    pub fn resolve<S: BuildHasher>(properties: &HashMap<String, String, S>) -> Result<Self, Error> {
        let name = non_blank(properties, LOCK_NAME_KEY)
            .map_or_else(|| DEFAULT_LOCK_NAME.to_string(), ToString::to_string);

        let acquire_timeout_secs = match properties.get(LOCK_TIMEOUT_KEY) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|source| Error::InvalidTimeout {
                    value: value.clone(),
                    source,
                })?,
            None => DEFAULT_ACQUIRE_TIMEOUT_SECS,
        };

        let configuration = Self {
            name,
            acquire_timeout_secs,
            server_config_path: non_blank(properties, SERVER_CONFIG_PATH_KEY).map(PathBuf::from),
            client_config_path: non_blank(properties, CLIENT_CONFIG_PATH_KEY).map(PathBuf::from),
        };

        info!(
            name = %configuration.name,
            timeout_secs = configuration.acquire_timeout_secs,
            "property setup complete"
        );

        Ok(configuration)
    }

    /// The name of the distributed mutex.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The advisory acquisition budget in whole seconds.
    #[must_use]
    pub const fn acquire_timeout_secs(&self) -> u64 {
        self.acquire_timeout_secs
    }

    /// The advisory acquisition budget the host's retry loop may spend.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// File configuring the coordination server role, if any.
    #[must_use]
    pub fn server_config_path(&self) -> Option<&Path> {
        self.server_config_path.as_deref()
    }

    /// File configuring the coordination client role, if any.
    #[must_use]
    pub fn client_config_path(&self) -> Option<&Path> {
        self.client_config_path.as_deref()
    }
}

impl Default for LockConfiguration {
    fn default() -> Self {
        Self {
            name: DEFAULT_LOCK_NAME.to_string(),
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            server_config_path: None,
            client_config_path: None,
        }
    }
}

fn non_blank<'a, S: BuildHasher>(
    properties: &'a HashMap<String, String, S>,
    key: &str,
) -> Option<&'a str> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}
