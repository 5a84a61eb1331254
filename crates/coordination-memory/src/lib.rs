//! In-memory (single process) coordination backend for local development and tests.
//!
//! A [`MemoryNetwork`] stands in for the network: it holds any number of named
//! clusters. Each simulated process gets its own [`MemoryBackend`] on the shared
//! network, and [`MemoryBackend::sever`] cuts that process off, expiring its
//! sessions the way a real coordination service would after a partition.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_bootable::Bootable;
use warden_coordination::{
    CoordinationBackend, CoordinationClient, LockStatus, MutexPrimitive, RoleConfig,
};

/// Cluster joined when a role uses default discovery.
pub const DEFAULT_CLUSTER_NAME: &str = "warden";

#[derive(Debug, Default)]
struct ClusterState {
    members: HashSet<String>,
    sessions: HashSet<String>,
    locks: HashMap<String, String>,
}

/// Shared in-process network of named coordination clusters.
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    clusters: Arc<Mutex<HashMap<String, ClusterState>>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session currently holding the named lock, if any.
    pub async fn holder(&self, cluster: &str, lock: &str) -> Option<String> {
        self.clusters
            .lock()
            .await
            .get(cluster)
            .and_then(|state| state.locks.get(lock).cloned())
    }

    /// Returns the number of servers that are members of the cluster.
    pub async fn member_count(&self, cluster: &str) -> usize {
        self.clusters
            .lock()
            .await
            .get(cluster)
            .map_or(0, |state| state.members.len())
    }

    /// Ends a session, releasing every lock it holds.
    pub async fn expire_session(&self, cluster: &str, session: &str) {
        if let Some(state) = self.clusters.lock().await.get_mut(cluster) {
            if state.sessions.remove(session) {
                state.locks.retain(|_, holder| holder != session);
                debug!(cluster, session, "session expired");
            }
        }
    }

    async fn with_session<T: Send>(
        &self,
        cluster: &str,
        session: &str,
        f: impl FnOnce(&mut ClusterState) -> T + Send,
    ) -> Result<T, Error> {
        let mut clusters = self.clusters.lock().await;

        match clusters.get_mut(cluster) {
            Some(state) if state.sessions.contains(session) => Ok(f(state)),
            _ => Err(Error::SessionExpired(session.to_string())),
        }
    }
}

/// Options for configuring a `MemoryBackend`.
#[derive(Clone, Debug)]
pub struct MemoryOptions {
    /// Number of times a client tries to reach a server before giving up.
    pub connect_attempts: usize,

    /// Delay between client connection attempts.
    pub retry_delay: Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default)]
struct Link {
    severed: AtomicBool,
    sessions: Mutex<Vec<(String, String)>>,
}

impl Link {
    fn check(&self) -> Result<(), Error> {
        if self.severed.load(Ordering::SeqCst) {
            Err(Error::Severed)
        } else {
            Ok(())
        }
    }
}

/// Role config file contents understood by the memory backend.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoleFile {
    cluster_name: Option<String>,
}

fn cluster_name(config: &RoleConfig) -> Result<String, Error> {
    match config {
        RoleConfig::Discovery => Ok(DEFAULT_CLUSTER_NAME.to_string()),
        RoleConfig::File { contents, .. } => {
            let file: RoleFile = toml::from_str(contents)?;
            Ok(file
                .cluster_name
                .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string()))
        }
    }
}

/// Coordination backend for one simulated process on a [`MemoryNetwork`].
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    network: MemoryNetwork,
    options: MemoryOptions,
    link: Arc<Link>,
}

impl MemoryBackend {
    /// Creates a backend on the given network with default options.
    #[must_use]
    pub fn new(network: MemoryNetwork) -> Self {
        Self::with_options(network, MemoryOptions::default())
    }

    /// Creates a backend on the given network.
    #[must_use]
    pub fn with_options(network: MemoryNetwork, options: MemoryOptions) -> Self {
        Self {
            network,
            options,
            link: Arc::new(Link::default()),
        }
    }

    /// Simulates losing connectivity: every later operation from this process
    /// fails, and the cluster expires every session this process opened.
    pub async fn sever(&self) {
        self.link.severed.store(true, Ordering::SeqCst);

        let sessions = std::mem::take(&mut *self.link.sessions.lock().await);
        for (cluster, session) in sessions {
            self.network.expire_session(&cluster, &session).await;
        }

        warn!("memory coordination link severed");
    }
}

impl CoordinationBackend for MemoryBackend {
    type Error = Error;
    type Server = MemoryServer;
    type Client = MemoryClient;

    fn server(&self, config: RoleConfig) -> Result<Self::Server, Self::Error> {
        Ok(MemoryServer {
            cluster: cluster_name(&config)?,
            link: self.link.clone(),
            member_id: format!("member-{}", Uuid::new_v4()),
            network: self.network.clone(),
            running: watch::Sender::new(false),
        })
    }

    fn client(&self, config: RoleConfig) -> Result<Self::Client, Self::Error> {
        Ok(MemoryClient {
            cluster: cluster_name(&config)?,
            connected: Arc::new(AtomicBool::new(false)),
            link: self.link.clone(),
            network: self.network.clone(),
            options: self.options.clone(),
            running: watch::Sender::new(false),
            session_id: format!("session-{}", Uuid::new_v4()),
        })
    }
}

/// Server role: a member of a named cluster on the network.
///
/// When the last member leaves, the cluster and all of its sessions disappear.
#[derive(Debug)]
pub struct MemoryServer {
    cluster: String,
    link: Arc<Link>,
    member_id: String,
    network: MemoryNetwork,
    running: watch::Sender<bool>,
}

#[async_trait]
impl Bootable for MemoryServer {
    type Error = Error;

    fn bootable_name(&self) -> &'static str {
        "memory-coordination-server"
    }

    async fn start(&self) -> Result<(), Self::Error> {
        self.link.check()?;

        let mut clusters = self.network.clusters.lock().await;
        let state = clusters.entry(self.cluster.clone()).or_default();

        if !state.members.insert(self.member_id.clone()) {
            return Err(Error::AlreadyStarted);
        }

        info!(cluster = %self.cluster, member = %self.member_id, members = state.members.len(), "joined memory cluster");
        self.running.send_replace(true);

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        let mut clusters = self.network.clusters.lock().await;

        if let Some(state) = clusters.get_mut(&self.cluster) {
            if state.members.remove(&self.member_id) {
                info!(cluster = %self.cluster, member = %self.member_id, "left memory cluster");
            }

            if state.members.is_empty() {
                clusters.remove(&self.cluster);
                debug!(cluster = %self.cluster, "last member left; cluster dissolved");
            }
        }

        self.running.send_replace(false);

        Ok(())
    }

    async fn wait(&self) {
        let _ = self.running.subscribe().wait_for(|running| !*running).await;
    }
}

/// Client role: a session in a named cluster.
#[derive(Debug)]
pub struct MemoryClient {
    cluster: String,
    connected: Arc<AtomicBool>,
    link: Arc<Link>,
    network: MemoryNetwork,
    options: MemoryOptions,
    running: watch::Sender<bool>,
    session_id: String,
}

impl MemoryClient {
    async fn try_connect(&self) -> Result<bool, Error> {
        self.link.check()?;

        let mut clusters = self.network.clusters.lock().await;
        match clusters.get_mut(&self.cluster) {
            Some(state) if !state.members.is_empty() => {
                state.sessions.insert(self.session_id.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl Bootable for MemoryClient {
    type Error = Error;

    fn bootable_name(&self) -> &'static str {
        "memory-coordination-client"
    }

    async fn start(&self) -> Result<(), Self::Error> {
        for attempt in 1..=self.options.connect_attempts {
            match self.try_connect().await {
                Ok(true) => {
                    self.link
                        .sessions
                        .lock()
                        .await
                        .push((self.cluster.clone(), self.session_id.clone()));
                    self.connected.store(true, Ordering::SeqCst);
                    self.running.send_replace(true);

                    info!(cluster = %self.cluster, session = %self.session_id, "connected to memory cluster");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(cluster = %self.cluster, attempt, "no server reachable yet");
                }
                Err(e) => {
                    debug!(cluster = %self.cluster, attempt, error = %e, "connection attempt failed");
                }
            }

            tokio::time::sleep(self.options.retry_delay).await;
        }

        Err(Error::Unreachable {
            cluster: self.cluster.clone(),
            attempts: self.options.connect_attempts,
        })
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.link
                .sessions
                .lock()
                .await
                .retain(|(cluster, session)| {
                    *cluster != self.cluster || *session != self.session_id
                });
            self.network
                .expire_session(&self.cluster, &self.session_id)
                .await;
            info!(cluster = %self.cluster, session = %self.session_id, "disconnected from memory cluster");
        }

        self.running.send_replace(false);

        Ok(())
    }

    async fn wait(&self) {
        let _ = self.running.subscribe().wait_for(|running| !*running).await;
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    type Mutex = MemoryMutex;

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn mutex(&self, name: &str) -> Result<Self::Mutex, Self::Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        Ok(MemoryMutex {
            cluster: self.cluster.clone(),
            connected: self.connected.clone(),
            link: self.link.clone(),
            name: name.to_string(),
            network: self.network.clone(),
            session_id: self.session_id.clone(),
        })
    }
}

/// Handle to a named lock in a memory cluster.
#[derive(Clone, Debug)]
pub struct MemoryMutex {
    cluster: String,
    connected: Arc<AtomicBool>,
    link: Arc<Link>,
    name: String,
    network: MemoryNetwork,
    session_id: String,
}

impl MemoryMutex {
    fn check(&self) -> Result<(), Error> {
        self.link.check()?;

        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl MutexPrimitive for MemoryMutex {
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    async fn try_claim(&self) -> Result<bool, Self::Error> {
        self.check()?;

        self.network
            .with_session(&self.cluster, &self.session_id, |state| {
                let holder = state
                    .locks
                    .entry(self.name.clone())
                    .or_insert_with(|| self.session_id.clone());
                *holder == self.session_id
            })
            .await
    }

    async fn status(&self) -> Result<LockStatus, Self::Error> {
        self.check()?;

        self.network
            .with_session(&self.cluster, &self.session_id, |state| {
                match state.locks.get(&self.name) {
                    None => LockStatus::Free,
                    Some(holder) if *holder == self.session_id => LockStatus::HeldBySelf,
                    Some(holder) => LockStatus::HeldByOther(holder.clone()),
                }
            })
            .await
    }

    async fn release(&self) -> Result<(), Self::Error> {
        self.check()?;

        self.network
            .with_session(&self.cluster, &self.session_id, |state| {
                if state.locks.get(&self.name) == Some(&self.session_id) {
                    state.locks.remove(&self.name);
                    debug!(lock = %self.name, "memory lock released");
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    async fn started_server(backend: &MemoryBackend) -> MemoryServer {
        let server = backend
            .server(RoleConfig::Discovery)
            .expect("server config rejected");
        server.start().await.expect("server failed to start");
        server
    }

    async fn connected_client(backend: &MemoryBackend) -> MemoryClient {
        let client = backend
            .client(RoleConfig::Discovery)
            .expect("client config rejected");
        client.start().await.expect("client failed to connect");
        client
    }

    #[tokio::test]
    async fn test_claim_status_and_release() {
        let network = MemoryNetwork::new();
        let backend = MemoryBackend::new(network.clone());
        let _server = started_server(&backend).await;
        let client = connected_client(&backend).await;

        let mutex = client.mutex("test_lock").await.expect("mutex failed");
        assert_eq!(mutex.status().await.expect("status failed"), LockStatus::Free);

        assert!(mutex.try_claim().await.expect("claim failed"));
        assert_eq!(
            mutex.status().await.expect("status failed"),
            LockStatus::HeldBySelf
        );
        assert_eq!(
            network.holder(DEFAULT_CLUSTER_NAME, "test_lock").await,
            Some(client.session_id().to_string())
        );

        mutex.release().await.expect("release failed");
        assert_eq!(mutex.status().await.expect("status failed"), LockStatus::Free);
    }

    #[tokio::test]
    async fn test_claim_conflict_reports_other_holder() {
        let network = MemoryNetwork::new();
        let backend_a = MemoryBackend::new(network.clone());
        let backend_b = MemoryBackend::new(network.clone());
        let _server = started_server(&backend_a).await;
        let client_a = connected_client(&backend_a).await;
        let client_b = connected_client(&backend_b).await;

        let mutex_a = client_a.mutex("shared").await.expect("mutex failed");
        let mutex_b = client_b.mutex("shared").await.expect("mutex failed");

        assert!(mutex_a.try_claim().await.expect("claim failed"));
        assert!(!mutex_b.try_claim().await.expect("claim failed"));
        assert_eq!(
            mutex_b.status().await.expect("status failed"),
            LockStatus::HeldByOther(client_a.session_id().to_string())
        );

        // Releasing a lock held by someone else leaves it alone.
        mutex_b.release().await.expect("release failed");
        assert_eq!(
            mutex_a.status().await.expect("status failed"),
            LockStatus::HeldBySelf
        );
    }

    #[tokio::test]
    async fn test_client_shutdown_expires_session_locks() {
        let network = MemoryNetwork::new();
        let backend_a = MemoryBackend::new(network.clone());
        let backend_b = MemoryBackend::new(network.clone());
        let _server = started_server(&backend_b).await;
        let client_a = connected_client(&backend_a).await;
        let client_b = connected_client(&backend_b).await;

        let mutex_a = client_a.mutex("expiring").await.expect("mutex failed");
        assert!(mutex_a.try_claim().await.expect("claim failed"));

        client_a.shutdown().await.expect("shutdown failed");
        client_a.shutdown().await.expect("second shutdown failed");

        assert_matches!(mutex_a.status().await, Err(Error::NotConnected));
        assert_eq!(network.holder(DEFAULT_CLUSTER_NAME, "expiring").await, None);

        let mutex_b = client_b.mutex("expiring").await.expect("mutex failed");
        assert!(mutex_b.try_claim().await.expect("claim failed"));
    }

    #[tokio::test]
    async fn test_sever_fails_operations_and_frees_locks() {
        let network = MemoryNetwork::new();
        let backend_a = MemoryBackend::new(network.clone());
        let backend_b = MemoryBackend::new(network.clone());
        let _server = started_server(&backend_b).await;
        let client_a = connected_client(&backend_a).await;

        let mutex_a = client_a.mutex("partitioned").await.expect("mutex failed");
        assert!(mutex_a.try_claim().await.expect("claim failed"));

        backend_a.sever().await;

        assert_matches!(mutex_a.status().await, Err(Error::Severed));
        assert_eq!(network.holder(DEFAULT_CLUSTER_NAME, "partitioned").await, None);
    }

    #[tokio::test]
    async fn test_reconnect_cycles_do_not_accumulate_sessions() {
        let network = MemoryNetwork::new();
        let backend = MemoryBackend::new(network.clone());
        let _server = started_server(&backend).await;

        for _ in 0..5 {
            let client = connected_client(&backend).await;
            assert_eq!(backend.link.sessions.lock().await.len(), 1);

            client.shutdown().await.expect("shutdown failed");
            client.shutdown().await.expect("second shutdown failed");
            assert!(backend.link.sessions.lock().await.is_empty());
        }

        let kept = connected_client(&backend).await;
        let other = connected_client(&backend).await;
        other.shutdown().await.expect("shutdown failed");
        assert_eq!(
            *backend.link.sessions.lock().await,
            vec![(DEFAULT_CLUSTER_NAME.to_string(), kept.session_id().to_string())]
        );
    }

    #[tokio::test]
    async fn test_client_without_server_is_unreachable() {
        let backend = MemoryBackend::new(MemoryNetwork::new());
        let client = backend
            .client(RoleConfig::Discovery)
            .expect("client config rejected");

        assert_matches!(
            client.start().await,
            Err(Error::Unreachable { attempts: 3, .. })
        );
        assert_matches!(client.mutex("nope").await, Err(Error::NotConnected));
    }

    #[tokio::test]
    async fn test_last_server_leaving_dissolves_cluster() {
        let network = MemoryNetwork::new();
        let backend = MemoryBackend::new(network.clone());
        let server = started_server(&backend).await;
        let client = connected_client(&backend).await;
        let mutex = client.mutex("dissolved").await.expect("mutex failed");
        assert!(mutex.try_claim().await.expect("claim failed"));

        server.shutdown().await.expect("shutdown failed");
        server.shutdown().await.expect("second shutdown failed");
        server.wait().await;

        assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 0);
        assert_matches!(mutex.status().await, Err(Error::SessionExpired(_)));
    }

    #[tokio::test]
    async fn test_role_file_selects_cluster() {
        let network = MemoryNetwork::new();
        let backend = MemoryBackend::new(network.clone());
        let config = RoleConfig::File {
            path: PathBuf::from("server.toml"),
            contents: "cluster_name = \"blue\"".to_string(),
        };

        let server = backend.server(config).expect("server config rejected");
        server.start().await.expect("server failed to start");

        assert_eq!(network.member_count("blue").await, 1);
        assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 0);
    }

    #[test]
    fn test_invalid_role_file_is_config_error() {
        use warden_coordination::CoordinationError;

        let backend = MemoryBackend::new(MemoryNetwork::new());
        let config = RoleConfig::File {
            path: PathBuf::from("client.toml"),
            contents: "cluster_name = [".to_string(),
        };

        let error = backend.client(config).expect_err("config should be rejected");
        assert!(error.is_config());
    }
}
