use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_coordination::CoordinationBackend;
use warden_lock::LockLifecycleManager;

/// Runs as the single active instance while holding the lock, and stands by
/// otherwise.
pub struct Host<B>
where
    B: CoordinationBackend,
{
    manager: LockLifecycleManager<B>,
    poll_interval: Duration,
    leading: watch::Sender<bool>,
}

impl<B> Host<B>
where
    B: CoordinationBackend,
{
    pub fn new(manager: LockLifecycleManager<B>, poll_interval: Duration) -> Self {
        Self {
            manager,
            poll_interval,
            leading: watch::Sender::new(false),
        }
    }

    /// Observes whether this instance is currently the leader.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn leading(&self) -> watch::Receiver<bool> {
        self.leading.subscribe()
    }

    /// Starts the lock lifecycle and alternates between standby and leader
    /// until `shutdown` is cancelled, then stops the lifecycle.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), warden_lock::Error> {
        self.manager.start().await?;

        let acquire_timeout = self
            .manager
            .configuration()
            .await
            .map_or(Duration::from_secs(10), |config| config.acquire_timeout());

        info!("standing by for leadership");
        let mut budget_started = Instant::now();

        loop {
            let leading = *self.leading.borrow();

            if leading {
                if !self.manager.is_alive().await {
                    warn!("leadership lost; returning to standby");
                    self.leading.send_replace(false);
                    budget_started = Instant::now();
                }
            } else if self.manager.acquire().await {
                info!("acquired leadership; now the active instance");
                self.leading.send_replace(true);
            } else if budget_started.elapsed() >= acquire_timeout {
                warn!(
                    timeout = ?acquire_timeout,
                    "lock not acquired within acquire timeout; still standing by"
                );
                budget_started = Instant::now();
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("shutting down");
        self.manager.stop().await;
        self.leading.send_replace(false);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use warden_config::LOCK_NAME_KEY;
    use warden_coordination_memory::{DEFAULT_CLUSTER_NAME, MemoryBackend, MemoryNetwork};

    fn host(network: &MemoryNetwork) -> Arc<Host<MemoryBackend>> {
        let properties = HashMap::from([(LOCK_NAME_KEY.to_string(), "scheduler".to_string())]);
        let manager = LockLifecycleManager::new(MemoryBackend::new(network.clone()), properties);

        Arc::new(Host::new(manager, Duration::from_millis(10)))
    }

    async fn became(mut leading: watch::Receiver<bool>, expected: bool) {
        tokio::time::timeout(Duration::from_secs(5), leading.wait_for(|l| *l == expected))
            .await
            .expect("timed out waiting for leadership change")
            .expect("host dropped");
    }

    #[tokio::test]
    async fn test_standby_takes_over_after_leader_stops() {
        let network = MemoryNetwork::new();
        let a = host(&network);
        let b = host(&network);
        let shutdown_a = CancellationToken::new();
        let shutdown_b = CancellationToken::new();

        let run_a = tokio::spawn({
            let a = a.clone();
            let shutdown = shutdown_a.clone();
            async move { a.run(shutdown).await }
        });
        became(a.leading(), true).await;

        let run_b = tokio::spawn({
            let b = b.clone();
            let shutdown = shutdown_b.clone();
            async move { b.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!*b.leading().borrow());

        shutdown_a.cancel();
        run_a.await.expect("host a panicked").expect("host a failed");
        became(b.leading(), true).await;

        shutdown_b.cancel();
        run_b.await.expect("host b panicked").expect("host b failed");
        assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 0);
    }

    #[tokio::test]
    async fn test_leader_steps_down_when_lock_is_lost() {
        let network = MemoryNetwork::new();
        let backend = MemoryBackend::new(network.clone());
        let properties = HashMap::from([(LOCK_NAME_KEY.to_string(), "scheduler".to_string())]);
        let a = Arc::new(Host::new(
            LockLifecycleManager::new(backend.clone(), properties),
            Duration::from_millis(10),
        ));
        let shutdown = CancellationToken::new();

        let run = tokio::spawn({
            let a = a.clone();
            let shutdown = shutdown.clone();
            async move { a.run(shutdown).await }
        });
        became(a.leading(), true).await;

        backend.sever().await;
        became(a.leading(), false).await;

        shutdown.cancel();
        run.await.expect("host panicked").expect("host failed");
    }
}
