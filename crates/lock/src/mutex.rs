use crate::Error;

use tracing::{debug, info, instrument, warn};
use warden_coordination::{LockStatus, MutexPrimitive};

/// What this process believes about its ownership of the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutexState {
    /// Not held by this process.
    Unheld,

    /// Held by this process, as last confirmed by the coordination service.
    HeldBySelf,

    /// Connectivity was lost; the local belief cannot be trusted.
    Unknown,
}

/// A named, cluster-visible lock and this process's belief about holding it.
///
/// The coordination service is the source of truth. Every answer this type
/// gives comes from re-querying the service's holder record, never from the
/// result of a claim attempt.
#[derive(Debug)]
pub struct DistributedMutex<M>
where
    M: MutexPrimitive,
{
    primitive: M,
    state: MutexState,
}

impl<M> DistributedMutex<M>
where
    M: MutexPrimitive,
{
    /// Wraps a mutex primitive. The initial state is [`MutexState::Unheld`].
    pub const fn new(primitive: M) -> Self {
        Self {
            primitive,
            state: MutexState::Unheld,
        }
    }

    /// The name of the lock in the cluster.
    pub fn name(&self) -> &str {
        self.primitive.name()
    }

    /// The current local belief.
    pub const fn state(&self) -> MutexState {
        self.state
    }

    /// Attempts to take the lock without waiting.
    ///
    /// Returns true iff, after the claim attempt, the coordination service
    /// attributes the lock to this session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the cluster cannot be reached. The
    /// state becomes [`MutexState::Unknown`].
    #[instrument(skip(self), fields(lock = %self.primitive.name()))]
    pub async fn acquire(&mut self) -> Result<bool, Error> {
        let claimed = match self.primitive.try_claim().await {
            Ok(claimed) => claimed,
            Err(e) => return Err(self.lost("acquiring", e)),
        };

        // The claim result can race with a concurrent release; only the holder
        // record decides.
        let held = self.query("acquiring").await?;

        if held {
            info!("lock acquired");
        } else if claimed {
            warn!("claim reported success but the lock is not held by this session");
        } else {
            debug!("lock is held elsewhere");
        }

        Ok(held)
    }

    /// Releases the lock if this process holds it.
    ///
    /// A no-op unless the local state is [`MutexState::HeldBySelf`]. The
    /// coordination service only ever drops ownership attributed to this
    /// session, so another holder is never affected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the cluster cannot be reached while
    /// releasing a held lock. The state becomes [`MutexState::Unknown`].
    #[instrument(skip(self), fields(lock = %self.primitive.name()))]
    pub async fn release(&mut self) -> Result<(), Error> {
        if self.state != MutexState::HeldBySelf {
            debug!(state = ?self.state, "lock not held; nothing to release");
            return Ok(());
        }

        if let Err(e) = self.primitive.release().await {
            return Err(self.lost("releasing", e));
        }

        self.state = MutexState::Unheld;
        info!("lock released");

        Ok(())
    }

    /// Best-effort release for teardown. Never fails.
    ///
    /// Unlike [`Self::release`], ownership is also given up from
    /// [`MutexState::Unknown`], so a lock whose holder record could not be read
    /// is not left behind when connectivity has come back.
    #[instrument(skip(self), fields(lock = %self.primitive.name()))]
    pub async fn relinquish(&mut self) {
        if self.state == MutexState::Unheld {
            debug!("lock not held; nothing to relinquish");
            return;
        }

        match self.primitive.release().await {
            Ok(()) => {
                self.state = MutexState::Unheld;
                info!("lock relinquished");
            }
            Err(e) => {
                warn!(error = %e, "failed to relinquish lock");
                self.state = MutexState::Unknown;
            }
        }
    }

    /// Re-queries the coordination service and reports whether this process
    /// still holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the cluster cannot be reached. The
    /// state becomes [`MutexState::Unknown`].
    #[instrument(skip(self), fields(lock = %self.primitive.name()))]
    pub async fn is_alive(&mut self) -> Result<bool, Error> {
        let was_held = self.state == MutexState::HeldBySelf;
        let held = self.query("checking").await?;

        if was_held && !held {
            warn!("lock is no longer held by this session");
        }

        Ok(held)
    }

    async fn query(&mut self, operation: &'static str) -> Result<bool, Error> {
        match self.primitive.status().await {
            Ok(LockStatus::HeldBySelf) => {
                self.state = MutexState::HeldBySelf;
                Ok(true)
            }
            Ok(status) => {
                debug!(?status, "lock not held by this session");
                self.state = MutexState::Unheld;
                Ok(false)
            }
            Err(e) => Err(self.lost(operation, e)),
        }
    }

    fn lost(&mut self, operation: &'static str, error: M::Error) -> Error {
        warn!(operation, error = %error, "coordination unreachable; lock state unknown");
        self.state = MutexState::Unknown;

        Error::Connectivity {
            name: self.primitive.name().to_string(),
            operation,
            source: Box::new(error),
        }
    }
}
