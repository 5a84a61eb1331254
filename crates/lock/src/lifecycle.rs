use crate::{DistributedMutex, Error};

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, warn};
use warden_bootable::Bootable;
use warden_config::LockConfiguration;
use warden_coordination::{CoordinationBackend, CoordinationClient, CoordinationParticipant};

type BackendMutex<B> = <<B as CoordinationBackend>::Client as CoordinationClient>::Mutex;

struct Running<B>
where
    B: CoordinationBackend,
{
    config: LockConfiguration,
    mutex: DistributedMutex<BackendMutex<B>>,
    participant: CoordinationParticipant<B>,
}

/// Owns the lock for the host application, from configuration to teardown.
///
/// Lock queries never fail: losing connectivity resolves to "not held", so the
/// host steps down rather than risk two leaders.
pub struct LockLifecycleManager<B>
where
    B: CoordinationBackend,
{
    backend: B,
    properties: HashMap<String, String>,
    running: Mutex<Option<Running<B>>>,
    status: watch::Sender<bool>,
}

impl<B> LockLifecycleManager<B>
where
    B: CoordinationBackend,
{
    /// Creates an unstarted manager.
    #[must_use]
    pub fn new(backend: B, properties: HashMap<String, String>) -> Self {
        Self {
            backend,
            properties,
            running: Mutex::new(None),
            status: watch::Sender::new(false),
        }
    }

    /// Resolves the configuration, joins the coordination cluster and obtains
    /// the mutex handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if already running,
    /// [`Error::Configuration`] if the properties are invalid, and
    /// [`Error::Coordination`] if the cluster cannot be joined. Nothing is left
    /// running when an error is returned.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        let mut running = self.running.lock().await;

        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let config = LockConfiguration::resolve(&self.properties)?;
        let mut participant = CoordinationParticipant::establish(&self.backend, &config).await?;

        let primitive = match participant.mutex(config.name()).await {
            Ok(primitive) => primitive,
            Err(e) => {
                warn!(error = %e, "failed to obtain lock handle; tearing down");
                participant.shutdown_client().await;
                participant.shutdown_server().await;
                return Err(e.into());
            }
        };

        info!(lock = config.name(), "lock lifecycle started");

        running.replace(Running {
            config,
            mutex: DistributedMutex::new(primitive),
            participant,
        });
        self.status.send_replace(true);

        Ok(())
    }

    /// Attempts to take the lock without waiting. Returns true iff this
    /// process holds it afterwards.
    pub async fn acquire(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(running) = running.as_mut() else {
            warn!("acquire called while lock lifecycle is not running");
            return false;
        };

        running.mutex.acquire().await.unwrap_or_else(|e| {
            warn!(error = %e, "acquire failed; treating lock as not held");
            false
        })
    }

    /// Releases the lock if held. Never fails.
    pub async fn release(&self) {
        let mut running = self.running.lock().await;
        let Some(running) = running.as_mut() else {
            debug!("release called while lock lifecycle is not running");
            return;
        };

        if let Err(e) = running.mutex.release().await {
            warn!(error = %e, "release failed");
        }
    }

    /// Whether this process still holds the lock, as the coordination service
    /// currently sees it.
    pub async fn is_alive(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(running) = running.as_mut() else {
            return false;
        };

        running.mutex.is_alive().await.unwrap_or_else(|e| {
            warn!(error = %e, "liveness check failed; treating lock as lost");
            false
        })
    }

    /// Relinquishes the lock, including from an unknown state, then shuts down
    /// the client and server roles. Failures are logged.
    ///
    /// Every step runs even if an earlier one failed. Calling this again, or
    /// before [`Self::start`], does nothing.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut guard = self.running.lock().await;
        let Some(mut running) = guard.take() else {
            debug!("lock lifecycle not running");
            return;
        };

        running.mutex.relinquish().await;
        running.participant.shutdown_client().await;
        running.participant.shutdown_server().await;

        self.status.send_replace(false);
        info!(lock = running.config.name(), "lock lifecycle stopped");
    }

    /// The resolved configuration while running.
    pub async fn configuration(&self) -> Option<LockConfiguration> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.config.clone())
    }
}

#[async_trait]
impl<B> Bootable for LockLifecycleManager<B>
where
    B: CoordinationBackend,
{
    type Error = Error;

    fn bootable_name(&self) -> &'static str {
        "warden-lock"
    }

    async fn start(&self) -> Result<(), Self::Error> {
        Self::start(self).await
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.stop().await;
        Ok(())
    }

    async fn wait(&self) {
        let _ = self.status.subscribe().wait_for(|running| !*running).await;
    }
}
