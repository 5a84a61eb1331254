use crate::{CoordinationBackend, CoordinationClient, CoordinationError, Error, Role, RoleConfig};

use std::path::Path;

use tracing::{debug, info, instrument, warn};
use warden_bootable::Bootable;
use warden_config::LockConfiguration;

/// This process's membership in the coordination cluster.
///
/// The server role is established before the client role and torn down after
/// it. Both teardown methods are idempotent and never fail.
pub struct CoordinationParticipant<B>
where
    B: CoordinationBackend,
{
    server: Option<B::Server>,
    client: Option<B::Client>,
}

impl<B> CoordinationParticipant<B>
where
    B: CoordinationBackend,
{
    /// Starts the server role, then connects the client role.
    ///
    /// If the client role cannot be established the server role is shut down
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationFile`] if a configured file cannot be read,
    /// [`Error::InvalidConfigurationFile`] if the backend rejects its contents,
    /// and [`Error::CoordinationUnavailable`] if the cluster cannot be reached.
    #[instrument(skip_all)]
    pub async fn establish(backend: &B, config: &LockConfiguration) -> Result<Self, Error> {
        let server_path = config.server_config_path();
        let server_role = load_role(Role::Server, server_path).await?;
        let server = backend
            .server(server_role)
            .map_err(|e| classify(Role::Server, server_path, e))?;
        server
            .start()
            .await
            .map_err(|e| classify(Role::Server, server_path, e))?;

        info!(server = server.bootable_name(), "coordination server started");

        let client = match Self::connect_client(backend, config).await {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "coordination client failed; shutting down server");
                if let Err(shutdown_error) = server.shutdown().await {
                    warn!(error = %shutdown_error, "failed to shut down coordination server");
                }
                return Err(e);
            }
        };

        info!(session = client.session_id(), "coordination client started");

        Ok(Self {
            server: Some(server),
            client: Some(client),
        })
    }

    async fn connect_client(backend: &B, config: &LockConfiguration) -> Result<B::Client, Error> {
        let client_path = config.client_config_path();
        let client_role = load_role(Role::Client, client_path).await?;
        let client = backend
            .client(client_role)
            .map_err(|e| classify(Role::Client, client_path, e))?;
        client
            .start()
            .await
            .map_err(|e| classify(Role::Client, client_path, e))?;

        Ok(client)
    }

    /// Obtains a handle to the named lock from the client role.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoordinationUnavailable`] if the client role is gone or
    /// refuses to hand out the mutex.
    pub async fn mutex(
        &self,
        name: &str,
    ) -> Result<<B::Client as CoordinationClient>::Mutex, Error> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::CoordinationUnavailable {
                role: Role::Client,
                source: "coordination client has been shut down".into(),
            })?;

        client
            .mutex(name)
            .await
            .map_err(|e| classify(Role::Client, None, e))
    }

    /// Whether the client role is still established.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Shuts down the client role, ending its session.
    pub async fn shutdown_client(&mut self) {
        let Some(client) = self.client.take() else {
            debug!("coordination client already shut down");
            return;
        };

        match client.shutdown().await {
            Ok(()) => info!("coordination client shutdown complete"),
            Err(e) => warn!(error = %e, "coordination client shutdown failed"),
        }
    }

    /// Shuts down the server role.
    pub async fn shutdown_server(&mut self) {
        let Some(server) = self.server.take() else {
            debug!("coordination server already shut down");
            return;
        };

        match server.shutdown().await {
            Ok(()) => info!("coordination server shutdown complete"),
            Err(e) => warn!(error = %e, "coordination server shutdown failed"),
        }
    }
}

async fn load_role(role: Role, path: Option<&Path>) -> Result<RoleConfig, Error> {
    let Some(path) = path else {
        debug!(%role, "using default discovery");
        return Ok(RoleConfig::Discovery);
    };

    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::ConfigurationFile {
                role,
                path: path.to_path_buf(),
                source,
            })?;

    debug!(%role, path = %path.display(), "loaded role config file");

    Ok(RoleConfig::File {
        path: path.to_path_buf(),
        contents,
    })
}

fn classify<E: CoordinationError>(role: Role, path: Option<&Path>, error: E) -> Error {
    match path {
        Some(path) if error.is_config() => Error::InvalidConfigurationFile {
            role,
            path: path.to_path_buf(),
            source: Box::new(error),
        },
        _ => Error::CoordinationUnavailable {
            role,
            source: Box::new(error),
        },
    }
}
