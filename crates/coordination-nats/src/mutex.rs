use crate::Error;
use crate::client::LockSettings;
use crate::retry::RetryPolicy;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_nats::jetstream::Context as JetStreamContext;
use async_nats::jetstream::kv::{Config as KvConfig, CreateErrorKind, Store as KvStore};
use async_nats::jetstream::stream::StorageType;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use warden_coordination::{LockStatus, MutexPrimitive};

// renew at 80% of bucket_max_age to avoid gap between renewal and expiration
const RENEWAL_INTERVAL_RATIO_OF_BUCKET_MAX_AGE: f64 = 0.8;

/// A named lock stored as a key in a `JetStream` KV bucket.
///
/// The key's value is the owning session's identifier. An empty value is a
/// released lock. Entries expire after the bucket's max age unless renewed, so
/// a crashed holder frees the lock after one TTL.
pub struct NatsMutex {
    name: String,
    bucket: String,
    jetstream_context: JetStreamContext,
    local_identifier: String,
    local_identifier_bytes: Bytes,
    settings: LockSettings,
    retry: RetryPolicy,
    session: CancellationToken,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl NatsMutex {
    pub(crate) fn new(
        name: String,
        jetstream_context: JetStreamContext,
        local_identifier: String,
        settings: LockSettings,
        session: CancellationToken,
    ) -> Self {
        let local_identifier_bytes = Bytes::from(local_identifier.clone());

        Self {
            name,
            bucket: settings.bucket.clone(),
            jetstream_context,
            local_identifier,
            local_identifier_bytes,
            retry: settings.retry_policy(),
            settings,
            session,
            renewal: Mutex::new(None),
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.session.is_cancelled() {
            Err(Error::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Gets or creates the KV bucket holding the locks.
    async fn get_kv_store(&self) -> Result<KvStore, Error> {
        self.check()?;

        let kv_config = KvConfig {
            bucket: self.bucket.clone(),
            max_age: self.settings.ttl(),
            num_replicas: self.settings.replicas,
            storage: if self.settings.persist {
                StorageType::File
            } else {
                StorageType::Memory
            },
            ..Default::default()
        };

        self.retry
            .run("create_or_update_kv", || {
                let jetstream_context = self.jetstream_context.clone();
                let config = kv_config.clone();
                async move { jetstream_context.create_or_update_key_value(config).await }
            })
            .await
    }

    /// Takes over a released (empty) entry with a compare-and-set on its revision.
    async fn claim_tombstone(&self, kv_store: &KvStore) -> Result<bool, Error> {
        let entry = self
            .retry
            .run("kv_entry", || {
                let kv_store = kv_store.clone();
                let name = self.name.clone();
                async move { kv_store.entry(name).await }
            })
            .await?;

        let Some(entry) = entry else {
            debug!("create failed, but subsequent entry() found no key");
            return Ok(false);
        };

        if !entry.value.is_empty() {
            debug!(revision = entry.revision, "lock already has a holder");
            return Ok(false);
        }

        match kv_store
            .update(&self.name, self.local_identifier_bytes.clone(), entry.revision)
            .await
        {
            Ok(revision) => {
                info!(
                    old_rev = entry.revision,
                    new_rev = revision,
                    "lock claimed by updating empty tombstone"
                );
                self.start_renewal(kv_store.clone(), revision);
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "failed to update empty tombstone; lock likely claimed by another");
                Ok(false)
            }
        }
    }

    /// Keeps the entry alive while held by rewriting it before the bucket's
    /// max age elapses.
    fn start_renewal(&self, kv_store: KvStore, mut revision: u64) {
        let interval = renewal_interval(self.settings.ttl());
        let name = self.name.clone();
        let value = self.local_identifier_bytes.clone();
        let session = self.session.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = session.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                match kv_store.update(&name, value.clone(), revision).await {
                    Ok(new_revision) => {
                        trace!(lock = %name, revision = new_revision, "lock renewed");
                        revision = new_revision;
                    }
                    Err(e) => {
                        warn!(lock = %name, error = %e, "lock renewal failed");

                        // Pick up the current revision if the entry is still ours
                        match kv_store.entry(&name).await {
                            Ok(Some(entry)) if entry.value == value => revision = entry.revision,
                            _ => {
                                warn!(lock = %name, "lock no longer held; stopping renewal");
                                break;
                            }
                        }
                    }
                }
            }
        });

        if let Some(previous) = replace_renewal(&self.renewal, Some(task)) {
            previous.abort();
        }
    }

    fn stop_renewal(&self) {
        if let Some(task) = replace_renewal(&self.renewal, None) {
            task.abort();
        }
    }
}

#[async_trait]
impl MutexPrimitive for NatsMutex {
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, key = %self.name, local_id = %self.local_identifier))]
    async fn try_claim(&self) -> Result<bool, Self::Error> {
        let kv_store = self.get_kv_store().await?;

        let create_result = tokio::time::timeout(
            self.retry.operation_timeout,
            kv_store.create(&self.name, self.local_identifier_bytes.clone()),
        )
        .await
        .map_err(|_| Error::Timeout {
            attempts: 1,
            last_error: "kv create timed out".to_string(),
        })?;

        match create_result {
            Ok(revision) => {
                info!(revision, "lock claimed via create");
                self.start_renewal(kv_store, revision);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), CreateErrorKind::AlreadyExists) => {
                self.claim_tombstone(&kv_store).await
            }
            Err(e) => Err(Error::CreateError(e)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, key = %self.name, local_id = %self.local_identifier))]
    async fn status(&self) -> Result<LockStatus, Self::Error> {
        let kv_store = self.get_kv_store().await?;

        let value = self
            .retry
            .run("kv_get", || {
                let kv_store = kv_store.clone();
                let name = self.name.clone();
                async move { kv_store.get(name).await }
            })
            .await?;

        Ok(match value {
            Some(value) if value.is_empty() => LockStatus::Free,
            Some(value) if value == self.local_identifier_bytes => LockStatus::HeldBySelf,
            Some(value) => LockStatus::HeldByOther(String::from_utf8_lossy(&value).to_string()),
            None => LockStatus::Free,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, key = %self.name, local_id = %self.local_identifier))]
    async fn release(&self) -> Result<(), Self::Error> {
        self.stop_renewal();

        let kv_store = self.get_kv_store().await?;

        let entry = self
            .retry
            .run("kv_entry", || {
                let kv_store = kv_store.clone();
                let name = self.name.clone();
                async move { kv_store.entry(name).await }
            })
            .await?;

        let Some(entry) = entry.filter(|entry| entry.value == self.local_identifier_bytes) else {
            debug!("lock not held by this session; nothing to release");
            return Ok(());
        };

        let update_result = tokio::time::timeout(
            self.retry.operation_timeout,
            kv_store.update(&self.name, Bytes::new(), entry.revision),
        )
        .await;

        match update_result {
            Ok(Ok(revision)) => {
                info!(revision, "lock released");
                Ok(())
            }
            Ok(Err(e)) => {
                // A revision mismatch means someone else has rewritten the entry
                match self.status().await? {
                    LockStatus::HeldBySelf => Err(Error::MaxRetriesExceeded {
                        max_attempts: 1,
                        last_error: e.to_string(),
                    }),
                    status => {
                        debug!(?status, "lock changed hands during release");
                        Ok(())
                    }
                }
            }
            Err(_) => Err(Error::Timeout {
                attempts: 1,
                last_error: "kv update timed out".to_string(),
            }),
        }
    }
}

impl Drop for NatsMutex {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

impl std::fmt::Debug for NatsMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsMutex")
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .field("local_identifier", &self.local_identifier)
            .finish_non_exhaustive()
    }
}

/// Swaps the renewal task slot. A poisoned slot is still used, so a renewal
/// task is never left running.
fn replace_renewal(
    slot: &Mutex<Option<JoinHandle<()>>>,
    task: Option<JoinHandle<()>>,
) -> Option<JoinHandle<()>> {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, task)
}

/// Interval at which a held lock is rewritten.
fn renewal_interval(ttl: Duration) -> Duration {
    ttl.mul_f64(RENEWAL_INTERVAL_RATIO_OF_BUCKET_MAX_AGE)
}
